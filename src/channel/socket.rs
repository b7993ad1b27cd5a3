//! Socket construction helpers.
//!
//! All sockets are created non-blocking with close-on-exec (socket2 opens
//! with `SOCK_CLOEXEC` on this platform).

use crate::channel::config::ChannelConfig;
use crate::error::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

fn domain_of(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// A non-blocking TCP socket for an outgoing connection.
pub(crate) fn new_stream_socket(addr: &SocketAddr, cfg: &ChannelConfig) -> Result<Socket> {
    let socket = Socket::new(domain_of(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    cfg.apply_to_socket(&socket)?;
    Ok(socket)
}

/// A non-blocking TCP acceptor socket, not yet bound: the channel's `bind`
/// operation binds and listens.
pub(crate) fn new_acceptor_socket(addr: &SocketAddr, cfg: &ChannelConfig) -> Result<Socket> {
    let socket = Socket::new(domain_of(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    cfg.apply_to_socket(&socket)?;
    Ok(socket)
}

/// Configure a freshly accepted socket.
pub(crate) fn prepare_accepted(socket: &Socket, cfg: &ChannelConfig) -> Result<()> {
    socket.set_nonblocking(true)?;
    cfg.apply_to_socket(socket)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptor_binds_ephemeral() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let cfg = ChannelConfig::default();
        let socket = new_acceptor_socket(&addr, &cfg).unwrap();
        socket.bind(&addr.into()).unwrap();
        socket.listen(128).unwrap();
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_stream_socket_is_nonblocking() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cfg = ChannelConfig::default();
        let socket = new_stream_socket(&addr, &cfg).unwrap();
        // A non-blocking connect to a port nothing listens on must not hang.
        let result = socket.connect(&addr.into());
        assert!(result.is_err() || result.is_ok());
    }
}
