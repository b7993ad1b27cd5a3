//! Channel options and per-channel configuration.

use crate::buffer::Allocator;
use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Sizing bounds for the adaptive receive-buffer allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvAllocatorSpec {
    /// Smallest buffer the allocator will guess.
    pub minimum: usize,
    /// First guess before any reads were observed.
    pub initial: usize,
    /// Largest buffer the allocator will guess.
    pub maximum: usize,
}

impl Default for RecvAllocatorSpec {
    fn default() -> Self {
        RecvAllocatorSpec {
            minimum: 64,
            initial: 2048,
            maximum: 65536,
        }
    }
}

/// A recognized channel option with its value.
#[derive(Clone)]
pub enum ChannelOption {
    /// Disable Nagle's algorithm.
    TcpNodelay(bool),
    /// Enable TCP keepalive probes.
    SoKeepalive(bool),
    /// Allow address reuse on bind.
    SoReuseaddr(bool),
    /// Linger on close for the given duration; `None` disables.
    SoLinger(Option<Duration>),
    /// Kernel send buffer size.
    SoSndbuf(usize),
    /// Kernel receive buffer size.
    SoRcvbuf(usize),
    /// Permit broadcast datagrams.
    SoBroadcast(bool),
    /// Interface index for outgoing multicast.
    IpMulticastIf(u32),
    /// TTL for outgoing multicast.
    IpMulticastTtl(u32),
    /// Loop outgoing multicast back to the host.
    IpMulticastLoop(bool),
    /// Connect timeout in milliseconds; 0 disables.
    ConnectTimeoutMs(u64),
    /// Pending outbound bytes above which the channel reports unwritable.
    WriteBufferHighWaterMark(usize),
    /// Pending outbound bytes below which the channel reports writable again.
    WriteBufferLowWaterMark(usize),
    /// Read continuously without explicit `read` calls.
    AutoRead(bool),
    /// Close automatically on write failure.
    AutoClose(bool),
    /// Keep the channel half-open when the peer shuts down its side.
    AllowHalfClosure(bool),
    /// Reads performed per event-loop turn before yielding.
    MaxMessagesPerRead(usize),
    /// Write attempts per flush before registering write interest.
    WriteSpinCount(usize),
    /// Buffer allocator for this channel.
    Allocator(Allocator),
    /// Receive-buffer sizing bounds.
    RcvbufAllocator(RecvAllocatorSpec),
}

impl fmt::Debug for ChannelOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOption::TcpNodelay(v) => write!(f, "TCP_NODELAY={v}"),
            ChannelOption::SoKeepalive(v) => write!(f, "SO_KEEPALIVE={v}"),
            ChannelOption::SoReuseaddr(v) => write!(f, "SO_REUSEADDR={v}"),
            ChannelOption::SoLinger(v) => write!(f, "SO_LINGER={v:?}"),
            ChannelOption::SoSndbuf(v) => write!(f, "SO_SNDBUF={v}"),
            ChannelOption::SoRcvbuf(v) => write!(f, "SO_RCVBUF={v}"),
            ChannelOption::SoBroadcast(v) => write!(f, "SO_BROADCAST={v}"),
            ChannelOption::IpMulticastIf(v) => write!(f, "IP_MULTICAST_IF={v}"),
            ChannelOption::IpMulticastTtl(v) => write!(f, "IP_MULTICAST_TTL={v}"),
            ChannelOption::IpMulticastLoop(v) => write!(f, "IP_MULTICAST_LOOP={v}"),
            ChannelOption::ConnectTimeoutMs(v) => write!(f, "CONNECT_TIMEOUT_MS={v}"),
            ChannelOption::WriteBufferHighWaterMark(v) => {
                write!(f, "WRITE_BUFFER_HIGH_WATER_MARK={v}")
            }
            ChannelOption::WriteBufferLowWaterMark(v) => {
                write!(f, "WRITE_BUFFER_LOW_WATER_MARK={v}")
            }
            ChannelOption::AutoRead(v) => write!(f, "AUTO_READ={v}"),
            ChannelOption::AutoClose(v) => write!(f, "AUTO_CLOSE={v}"),
            ChannelOption::AllowHalfClosure(v) => write!(f, "ALLOW_HALF_CLOSURE={v}"),
            ChannelOption::MaxMessagesPerRead(v) => write!(f, "MAX_MESSAGES_PER_READ={v}"),
            ChannelOption::WriteSpinCount(v) => write!(f, "WRITE_SPIN_COUNT={v}"),
            ChannelOption::Allocator(_) => write!(f, "ALLOCATOR"),
            ChannelOption::RcvbufAllocator(v) => write!(f, "RCVBUF_ALLOCATOR={v:?}"),
        }
    }
}

/// Resolved configuration carried by each channel.
#[derive(Clone)]
pub struct ChannelConfig {
    pub(crate) tcp_nodelay: bool,
    pub(crate) so_keepalive: bool,
    pub(crate) so_reuseaddr: bool,
    pub(crate) so_linger: Option<Duration>,
    pub(crate) so_sndbuf: Option<usize>,
    pub(crate) so_rcvbuf: Option<usize>,
    pub(crate) so_broadcast: bool,
    pub(crate) ip_multicast_if: Option<u32>,
    pub(crate) ip_multicast_ttl: Option<u32>,
    pub(crate) ip_multicast_loop: bool,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) high_water_mark: usize,
    pub(crate) low_water_mark: usize,
    pub(crate) auto_read: bool,
    pub(crate) auto_close: bool,
    pub(crate) allow_half_closure: bool,
    pub(crate) max_messages_per_read: usize,
    pub(crate) write_spin_count: usize,
    pub(crate) allocator: Option<Allocator>,
    pub(crate) recv_spec: RecvAllocatorSpec,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            tcp_nodelay: false,
            so_keepalive: false,
            so_reuseaddr: false,
            so_linger: None,
            so_sndbuf: None,
            so_rcvbuf: None,
            so_broadcast: false,
            ip_multicast_if: None,
            ip_multicast_ttl: None,
            ip_multicast_loop: false,
            connect_timeout: Some(Duration::from_secs(30)),
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
            auto_read: true,
            auto_close: true,
            allow_half_closure: false,
            max_messages_per_read: 16,
            write_spin_count: 16,
            allocator: None,
            recv_spec: RecvAllocatorSpec::default(),
        }
    }
}

impl ChannelConfig {
    /// Apply one option.
    pub fn set(&mut self, option: ChannelOption) -> Result<()> {
        match option {
            ChannelOption::TcpNodelay(v) => self.tcp_nodelay = v,
            ChannelOption::SoKeepalive(v) => self.so_keepalive = v,
            ChannelOption::SoReuseaddr(v) => self.so_reuseaddr = v,
            ChannelOption::SoLinger(v) => self.so_linger = v,
            ChannelOption::SoSndbuf(v) => self.so_sndbuf = Some(v),
            ChannelOption::SoRcvbuf(v) => self.so_rcvbuf = Some(v),
            ChannelOption::SoBroadcast(v) => self.so_broadcast = v,
            ChannelOption::IpMulticastIf(v) => self.ip_multicast_if = Some(v),
            ChannelOption::IpMulticastTtl(v) => self.ip_multicast_ttl = Some(v),
            ChannelOption::IpMulticastLoop(v) => self.ip_multicast_loop = v,
            ChannelOption::ConnectTimeoutMs(v) => {
                self.connect_timeout = if v == 0 {
                    None
                } else {
                    Some(Duration::from_millis(v))
                };
            }
            ChannelOption::WriteBufferHighWaterMark(v) => {
                if v < self.low_water_mark {
                    return Err(Error::IllegalState(format!(
                        "high watermark {v} below low watermark {}",
                        self.low_water_mark
                    )));
                }
                self.high_water_mark = v;
            }
            ChannelOption::WriteBufferLowWaterMark(v) => {
                if v > self.high_water_mark {
                    return Err(Error::IllegalState(format!(
                        "low watermark {v} above high watermark {}",
                        self.high_water_mark
                    )));
                }
                self.low_water_mark = v;
            }
            ChannelOption::AutoRead(v) => self.auto_read = v,
            ChannelOption::AutoClose(v) => self.auto_close = v,
            ChannelOption::AllowHalfClosure(v) => self.allow_half_closure = v,
            ChannelOption::MaxMessagesPerRead(v) => {
                if v == 0 {
                    return Err(Error::IllegalState(
                        "MAX_MESSAGES_PER_READ must be positive".into(),
                    ));
                }
                self.max_messages_per_read = v;
            }
            ChannelOption::WriteSpinCount(v) => {
                if v == 0 {
                    return Err(Error::IllegalState(
                        "WRITE_SPIN_COUNT must be positive".into(),
                    ));
                }
                self.write_spin_count = v;
            }
            ChannelOption::Allocator(v) => self.allocator = Some(v),
            ChannelOption::RcvbufAllocator(v) => self.recv_spec = v,
        }
        Ok(())
    }

    /// Apply a list of options in order.
    pub fn set_all(&mut self, options: &[ChannelOption]) -> Result<()> {
        for option in options {
            self.set(option.clone())?;
        }
        Ok(())
    }

    /// Apply the socket-level options to a socket.
    pub(crate) fn apply_to_socket(&self, socket: &socket2::Socket) -> Result<()> {
        socket.set_nodelay(self.tcp_nodelay)?;
        socket.set_keepalive(self.so_keepalive)?;
        socket.set_reuse_address(self.so_reuseaddr)?;
        socket.set_linger(self.so_linger)?;
        if let Some(size) = self.so_sndbuf {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.so_rcvbuf {
            socket.set_recv_buffer_size(size)?;
        }
        if self.so_broadcast {
            socket.set_broadcast(true)?;
        }
        if let Some(ttl) = self.ip_multicast_ttl {
            socket.set_multicast_ttl_v4(ttl)?;
        }
        if let Some(ifindex) = self.ip_multicast_if {
            socket.set_multicast_if_v4(&std::net::Ipv4Addr::from(ifindex.to_be_bytes()))?;
        }
        if self.ip_multicast_loop {
            socket.set_multicast_loop_v4(true)?;
        }
        Ok(())
    }
}
