//! I/O backends.
//!
//! Two backends satisfy the same contract and are chosen at group
//! construction: a readiness backend over mio (epoll/kqueue) and, on Linux,
//! an io_uring adapter that turns completions into the same readiness
//! events plus bulk I/O primitives.

pub mod poll;
#[cfg(target_os = "linux")]
pub mod uring;

use crate::error::Result;
use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness bitmask delivered with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    /// Data can be read.
    pub const READABLE: Ready = Ready(1);
    /// The socket accepts writes.
    pub const WRITABLE: Ready = Ready(1 << 1);
    /// An outstanding connect finished.
    pub const CONNECT: Ready = Ready(1 << 2);
    /// The listener has pending connections.
    pub const ACCEPT: Ready = Ready(1 << 3);
    /// Peer hung up.
    pub const HANG_UP: Ready = Ready(1 << 4);

    /// Empty mask.
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Kernel-side interest installed for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// Await readability.
    pub const READ: Interest = Interest(1);
    /// Await writability.
    pub const WRITE: Interest = Interest(1 << 1);

    /// No interest installed.
    pub fn empty() -> Interest {
        Interest(0)
    }

    /// Whether read interest is set.
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// Whether write interest is set.
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    /// Whether no interest is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// This interest with the given bits added.
    pub fn with(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// This interest with the given bits removed.
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Operation kinds carried on io_uring submissions and echoed on their
/// completions. Also used to label completion events handed to channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    /// Readiness poll.
    Poll = 1,
    /// Single-buffer write.
    Write = 2,
    /// Vectored write.
    Writev = 3,
    /// Non-blocking connect.
    Connect = 4,
    /// Splice from a file to the trampoline pipe.
    SpliceToPipe = 5,
    /// Splice from the trampoline pipe to the socket.
    SpliceFromPipe = 6,
    /// Cancellation of an earlier submission.
    Cancel = 7,
    /// Ring-ordered close of the registration's fd.
    Close = 8,
    /// Eventfd wake readiness.
    Wake = 9,
    /// Wait timeout sentinel.
    Timeout = 10,
}

impl OpKind {
    /// Decode from the token byte; unknown values are dropped by callers.
    pub fn from_u8(v: u8) -> Option<OpKind> {
        Some(match v {
            1 => OpKind::Poll,
            2 => OpKind::Write,
            3 => OpKind::Writev,
            4 => OpKind::Connect,
            5 => OpKind::SpliceToPipe,
            6 => OpKind::SpliceFromPipe,
            7 => OpKind::Cancel,
            8 => OpKind::Close,
            9 => OpKind::Wake,
            10 => OpKind::Timeout,
            _ => return None,
        })
    }
}

/// Payload of one I/O event.
#[derive(Debug, Clone, Copy)]
pub enum IoPayload {
    /// Readiness for the registration.
    Ready(Ready),
    /// A completed submission. `result < 0` is a negated errno.
    Completion {
        /// What operation completed.
        op: OpKind,
        /// Kernel result: byte count, zero, or negated errno.
        result: i32,
    },
}

/// One ready event delivered by a backend.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    /// Registration id the event belongs to.
    pub id: usize,
    /// What happened.
    pub payload: IoPayload,
}

/// Cross-thread wakeup handle for a backend's `wait`.
#[derive(Clone)]
pub struct IoWaker {
    inner: Arc<dyn Fn() + Send + Sync>,
}

impl IoWaker {
    pub(crate) fn new(wake: impl Fn() + Send + Sync + 'static) -> IoWaker {
        IoWaker {
            inner: Arc::new(wake),
        }
    }

    /// Interrupt the backend's current or next `wait`.
    pub fn wake(&self) {
        (self.inner)();
    }
}

impl fmt::Debug for IoWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IoWaker")
    }
}

/// Contract both backends satisfy.
pub trait IoBackend {
    /// Install kernel-side interest for a registration.
    fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()>;

    /// Change which events a registration awaits.
    fn modify(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()>;

    /// Remove a registration's interest.
    fn deregister(&mut self, fd: RawFd, id: usize) -> Result<()>;

    /// Wait for events up to `timeout` (forever when `None`), appending
    /// them to `events`.
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<IoEvent>) -> Result<()>;

    /// A handle that interrupts `wait` from another thread.
    fn waker(&self) -> IoWaker;
}

/// Which backend a group uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// io_uring on Linux, readiness polling elsewhere.
    #[default]
    Auto,
    /// Readiness polling via mio.
    Poll,
    /// io_uring completions (Linux only).
    Uring,
}

/// Backend instance owned by one event loop.
pub enum Backend {
    /// mio readiness backend.
    Poll(poll::PollBackend),
    /// io_uring adapter.
    #[cfg(target_os = "linux")]
    Uring(uring::UringBackend),
}

impl Backend {
    /// Construct the backend for `kind` with the given event batch size.
    pub fn new(kind: BackendKind, max_events: usize) -> Result<Backend> {
        match kind {
            BackendKind::Poll => Ok(Backend::Poll(poll::PollBackend::new(max_events)?)),
            #[cfg(target_os = "linux")]
            BackendKind::Auto => match uring::UringBackend::new(max_events) {
                Ok(backend) => Ok(Backend::Uring(backend)),
                Err(e) => {
                    tracing::warn!(error = %e, "io_uring unavailable; falling back to poll");
                    Ok(Backend::Poll(poll::PollBackend::new(max_events)?))
                }
            },
            #[cfg(not(target_os = "linux"))]
            BackendKind::Auto => Ok(Backend::Poll(poll::PollBackend::new(max_events)?)),
            #[cfg(target_os = "linux")]
            BackendKind::Uring => Ok(Backend::Uring(uring::UringBackend::new(max_events)?)),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Uring => Err(crate::error::Error::IllegalState(
                "io_uring backend requires Linux".into(),
            )),
        }
    }

    /// The io_uring adapter, when this backend is one.
    #[cfg(target_os = "linux")]
    pub fn uring_mut(&mut self) -> Option<&mut uring::UringBackend> {
        match self {
            Backend::Uring(backend) => Some(backend),
            Backend::Poll(_) => None,
        }
    }

    /// Whether this backend is completion-based.
    pub fn is_uring(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            matches!(self, Backend::Uring(_))
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}

impl IoBackend for Backend {
    fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        match self {
            Backend::Poll(b) => b.register(fd, id, interest),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.register(fd, id, interest),
        }
    }

    fn modify(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        match self {
            Backend::Poll(b) => b.modify(fd, id, interest),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.modify(fd, id, interest),
        }
    }

    fn deregister(&mut self, fd: RawFd, id: usize) -> Result<()> {
        match self {
            Backend::Poll(b) => b.deregister(fd, id),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.deregister(fd, id),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<IoEvent>) -> Result<()> {
        match self {
            Backend::Poll(b) => b.wait(timeout, events),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.wait(timeout, events),
        }
    }

    fn waker(&self) -> IoWaker {
        match self {
            Backend::Poll(b) => b.waker(),
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.waker(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_bit_algebra() {
        let r = Ready::READABLE | Ready::HANG_UP;
        assert!(r.contains(Ready::READABLE));
        assert!(r.contains(Ready::HANG_UP));
        assert!(!r.contains(Ready::WRITABLE));
        assert!(Ready::empty().is_empty());
    }

    #[test]
    fn test_interest_with_without() {
        let i = Interest::READ.with(Interest::WRITE);
        assert!(i.is_readable() && i.is_writable());
        let i = i.without(Interest::READ);
        assert!(!i.is_readable() && i.is_writable());
        assert!(i.without(Interest::WRITE).is_empty());
    }

    #[test]
    fn test_op_kind_codes_round_trip() {
        for op in [
            OpKind::Poll,
            OpKind::Write,
            OpKind::Writev,
            OpKind::Connect,
            OpKind::SpliceToPipe,
            OpKind::SpliceFromPipe,
            OpKind::Cancel,
            OpKind::Close,
            OpKind::Wake,
            OpKind::Timeout,
        ] {
            assert_eq!(OpKind::from_u8(op as u8), Some(op));
        }
        assert_eq!(OpKind::from_u8(0), None);
        assert_eq!(OpKind::from_u8(200), None);
    }
}
