//! Readiness backend over mio (epoll on Linux, kqueue on macOS).
//!
//! The poll tells us when sockets are ready; the channel layer then performs
//! non-blocking syscalls. A dedicated waker token interrupts `wait` for
//! cross-thread task submission.

use crate::error::{Error, Result};
use crate::io::{Interest, IoBackend, IoEvent, IoPayload, IoWaker, Ready};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the waker; registrations use their id directly.
const WAKER_TOKEN: Token = Token(usize::MAX);

struct Registration {
    fd: RawFd,
    interest: Interest,
}

/// mio-backed readiness backend.
pub struct PollBackend {
    poll: Poll,
    events: Events,
    waker: Arc<mio::Waker>,
    registrations: HashMap<usize, Registration>,
}

impl PollBackend {
    /// Create the backend with the given event batch capacity.
    pub fn new(max_events: usize) -> Result<PollBackend> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(PollBackend {
            poll,
            events: Events::with_capacity(max_events.max(1)),
            waker,
            registrations: HashMap::new(),
        })
    }

    fn mio_interest(interest: Interest) -> Option<mio::Interest> {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn ready_of(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready = ready | Ready::READABLE;
        }
        if event.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready = ready | Ready::HANG_UP;
        }
        ready
    }
}

impl IoBackend for PollBackend {
    fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        if self.registrations.contains_key(&id) {
            return Err(Error::IllegalState(format!("id {id} already registered")));
        }
        if let Some(mio_interest) = Self::mio_interest(interest) {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(id), mio_interest)?;
        }
        self.registrations.insert(id, Registration { fd, interest });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        let reg = self
            .registrations
            .get_mut(&id)
            .ok_or_else(|| Error::IllegalState(format!("id {id} is not registered")))?;
        let was_armed = Self::mio_interest(reg.interest).is_some();
        match Self::mio_interest(interest) {
            Some(mio_interest) if was_armed => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(id), mio_interest)?;
            }
            Some(mio_interest) => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(id), mio_interest)?;
            }
            None if was_armed => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
            }
            None => {}
        }
        reg.fd = fd;
        reg.interest = interest;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, id: usize) -> Result<()> {
        let reg = self
            .registrations
            .remove(&id)
            .ok_or_else(|| Error::IllegalState(format!("id {id} is not registered")))?;
        if Self::mio_interest(reg.interest).is_some() {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<IoEvent>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let ready = Self::ready_of(event);
            if ready.is_empty() {
                continue;
            }
            events.push(IoEvent {
                id: token.0,
                payload: IoPayload::Ready(ready),
            });
        }
        Ok(())
    }

    fn waker(&self) -> IoWaker {
        let waker = Arc::clone(&self.waker);
        IoWaker::new(move || {
            let _ = waker.wake();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_waker_interrupts_wait() {
        let mut backend = PollBackend::new(64).unwrap();
        let waker = backend.waker();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        let mut events = Vec::new();
        backend.wait(Some(Duration::from_secs(5)), &mut events).unwrap();
        assert!(events.is_empty());
        t.join().unwrap();
    }

    #[test]
    fn test_readable_event_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut backend = PollBackend::new(64).unwrap();
        backend
            .register(server.as_raw_fd(), 7, Interest::READ)
            .unwrap();

        client.write_all(b"ping").unwrap();
        let mut events = Vec::new();
        // Poll until the kernel reports readability.
        for _ in 0..50 {
            backend
                .wait(Some(Duration::from_millis(100)), &mut events)
                .unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert!(events.iter().any(|e| {
            e.id == 7
                && matches!(e.payload, IoPayload::Ready(r) if r.contains(Ready::READABLE))
        }));
        backend.deregister(server.as_raw_fd(), 7).unwrap();
    }

    #[test]
    fn test_modify_to_empty_disarms() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let mut backend = PollBackend::new(64).unwrap();
        backend
            .register(server.as_raw_fd(), 3, Interest::READ)
            .unwrap();
        backend
            .modify(server.as_raw_fd(), 3, Interest::empty())
            .unwrap();

        client.write_all(b"x").unwrap();
        let mut events = Vec::new();
        backend
            .wait(Some(Duration::from_millis(50)), &mut events)
            .unwrap();
        assert!(events.is_empty());
        backend.deregister(server.as_raw_fd(), 3).unwrap();
    }
}
