//! io_uring adapter.
//!
//! io_uring is completion-based: operations go onto a submission queue and
//! results appear on a completion queue. This adapter turns that into the
//! readiness contract the event loop expects (interest becomes oneshot
//! `PollAdd` ops, re-armed while interest persists) and additionally
//! exposes bulk primitives: single and vectored write ops, connect ops,
//! splice for sendfile, and ring-ordered close.
//!
//! Every submission carries a 64-bit user-data token packing
//! `(registration_id, op_code, seq)`; a pending-op table maps the sequence
//! back to the owning registration when the completion arrives. Exactly one
//! completion is delivered per submission, possibly `ECANCELED`. Unknown
//! tokens are logged and dropped. Cross-thread wakeups arrive through an
//! eventfd read op kept armed on the ring.

pub(crate) mod sendfile;

use crate::error::{Error, Result};
use crate::io::{Interest, IoBackend, IoEvent, IoPayload, IoWaker, OpKind, Ready};
use io_uring::{opcode, squeue, types, IoUring};
use self::sendfile::{Pipe, PipePool};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registration id reserved for ring-internal ops (wake, timeout).
const INTERNAL_REG: u32 = u32::MAX;

/// Pack a submission token: registration id, op code, sequence.
pub(crate) fn pack_token(reg: u32, op: OpKind, seq: u32) -> u64 {
    debug_assert!(seq < (1 << 24));
    ((reg as u64) << 32) | ((op as u8 as u64) << 24) | (seq as u64 & 0x00FF_FFFF)
}

/// Unpack a completion token into (registration id, op code, sequence).
pub(crate) fn unpack_token(token: u64) -> (u32, Option<OpKind>, u32) {
    let reg = (token >> 32) as u32;
    let op = OpKind::from_u8(((token >> 24) & 0xFF) as u8);
    let seq = (token & 0x00FF_FFFF) as u32;
    (reg, op, seq)
}

/// Resources a submission must keep alive until its completion.
enum Payload {
    None,
    Iovecs(#[allow(dead_code)] Box<[libc::iovec]>),
    SockAddr(#[allow(dead_code)] Box<socket2::SockAddr>),
}

struct Pending {
    reg: u32,
    op: OpKind,
    payload: Payload,
}

struct RegState {
    fd: RawFd,
    interest: Interest,
    /// Sequence of the currently armed poll op, if any.
    poll_seq: Option<u32>,
}

/// io_uring-backed I/O backend for one event loop.
pub struct UringBackend {
    ring: IoUring,
    pending: Slab<Pending>,
    regs: HashMap<usize, RegState>,
    eventfd: Arc<EventFd>,
    /// Read target for the armed wake op; one wake op in flight at a time.
    wake_buf: Box<u64>,
    /// Timespec storage for the current wait's timeout op.
    timeout_ts: Box<types::Timespec>,
    pipes: PipePool,
}

// The raw pointers held in pending payloads reference loop-local buffer
// memory; the backend moves onto its loop thread once, before any
// submission exists.
unsafe impl Send for UringBackend {}

struct EventFd(RawFd);

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

impl UringBackend {
    /// Create the ring and arm the eventfd wake op.
    pub fn new(max_events: usize) -> Result<UringBackend> {
        let entries = max_events.next_power_of_two().clamp(32, 4096) as u32;
        let ring = IoUring::new(entries)?;
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::NativeIo(io::Error::last_os_error()));
        }
        let mut backend = UringBackend {
            ring,
            pending: Slab::new(),
            regs: HashMap::new(),
            eventfd: Arc::new(EventFd(fd)),
            wake_buf: Box::new(0),
            timeout_ts: Box::new(types::Timespec::new()),
            pipes: PipePool::new(),
        };
        backend.arm_wake()?;
        Ok(backend)
    }

    fn next_token(&mut self, reg: u32, op: OpKind, payload: Payload) -> Result<u64> {
        let seq = self.pending.insert(Pending { reg, op, payload });
        if seq >= (1 << 24) {
            self.pending.remove(seq);
            return Err(Error::IllegalState("too many in-flight submissions".into()));
        }
        Ok(pack_token(reg, op, seq as u32))
    }

    /// Push one SQE, flushing the queue once if it is full. On failure the
    /// pending slot is reclaimed.
    fn push(&mut self, entry: &squeue::Entry, token: u64) -> Result<()> {
        for _ in 0..2 {
            let pushed = unsafe { self.ring.submission().push(entry) };
            match pushed {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // Queue full: hand what we have to the kernel and retry.
                    self.ring.submit()?;
                }
            }
        }
        let (_, _, seq) = unpack_token(token);
        self.pending.remove(seq as usize);
        Err(Error::NativeIo(io::Error::other("submission queue full")))
    }

    fn arm_wake(&mut self) -> Result<()> {
        let token = self.next_token(INTERNAL_REG, OpKind::Wake, Payload::None)?;
        let read = opcode::Read::new(
            types::Fd(self.eventfd.0),
            &mut *self.wake_buf as *mut u64 as *mut u8,
            8,
        )
        .build()
        .user_data(token);
        self.push(&read, token)
    }

    fn arm_poll(&mut self, id: usize) -> Result<()> {
        let (fd, interest) = match self.regs.get(&id) {
            Some(reg) => (reg.fd, reg.interest),
            None => return Ok(()),
        };
        if interest.is_empty() {
            return Ok(());
        }
        let mut mask = 0u32;
        if interest.is_readable() {
            mask |= libc::POLLIN as u32 | libc::POLLRDHUP as u32;
        }
        if interest.is_writable() {
            mask |= libc::POLLOUT as u32;
        }
        let token = self.next_token(id as u32, OpKind::Poll, Payload::None)?;
        let (_, _, seq) = unpack_token(token);
        let poll = opcode::PollAdd::new(types::Fd(fd), mask)
            .build()
            .user_data(token);
        self.push(&poll, token)?;
        if let Some(reg) = self.regs.get_mut(&id) {
            reg.poll_seq = Some(seq);
        }
        Ok(())
    }

    fn cancel_token(&mut self, target: u64) -> Result<()> {
        let (reg, _, _) = unpack_token(target);
        let token = self.next_token(reg, OpKind::Cancel, Payload::None)?;
        let cancel = opcode::AsyncCancel::new(target).build().user_data(token);
        self.push(&cancel, token)
    }

    /// Submissions still awaiting completion for a registration.
    pub(crate) fn pending_ops(&self, id: usize) -> usize {
        self.pending
            .iter()
            .filter(|(_, p)| p.reg as usize == id)
            .count()
    }

    /// Submit a cancel for every outstanding submission of a registration.
    /// Each cancelled op still delivers its own (ECANCELED) completion.
    pub(crate) fn cancel_all(&mut self, id: usize) -> usize {
        let targets: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.reg as usize == id && p.op != OpKind::Cancel)
            .map(|(seq, p)| pack_token(p.reg, p.op, seq as u32))
            .collect();
        let count = targets.len();
        for target in targets {
            if let Err(e) = self.cancel_token(target) {
                warn!(error = %e, "cancel submission failed");
            }
        }
        count
    }

    /// Submit a single-buffer write at the buffer's reader offset.
    pub(crate) fn submit_write(
        &mut self,
        id: usize,
        fd: RawFd,
        ptr: *const u8,
        len: usize,
    ) -> Result<()> {
        let token = self.next_token(id as u32, OpKind::Write, Payload::None)?;
        let write = opcode::Write::new(types::Fd(fd), ptr, len as u32)
            .build()
            .user_data(token);
        self.push(&write, token)
    }

    /// Submit a vectored write over the given readable regions.
    pub(crate) fn submit_writev(
        &mut self,
        id: usize,
        fd: RawFd,
        parts: &[(*const u8, usize)],
    ) -> Result<()> {
        let iovecs: Box<[libc::iovec]> = parts
            .iter()
            .map(|&(ptr, len)| libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: len,
            })
            .collect();
        let iov_ptr = iovecs.as_ptr();
        let iov_len = iovecs.len() as u32;
        let token = self.next_token(id as u32, OpKind::Writev, Payload::Iovecs(iovecs))?;
        let writev = opcode::Writev::new(types::Fd(fd), iov_ptr, iov_len)
            .build()
            .user_data(token);
        self.push(&writev, token)
    }

    /// Submit a non-blocking connect op.
    pub(crate) fn submit_connect(
        &mut self,
        id: usize,
        fd: RawFd,
        addr: &std::net::SocketAddr,
    ) -> Result<()> {
        let addr = Box::new(socket2::SockAddr::from(*addr));
        let addr_ptr = addr.as_ptr() as *const libc::sockaddr;
        let addr_len = addr.len();
        let token = self.next_token(id as u32, OpKind::Connect, Payload::SockAddr(addr))?;
        let connect = opcode::Connect::new(types::Fd(fd), addr_ptr, addr_len)
            .build()
            .user_data(token);
        self.push(&connect, token)
    }

    /// Close a registration's fd through the ring, preserving ordering with
    /// in-flight reads and writes.
    pub(crate) fn submit_close(&mut self, id: usize, fd: RawFd) -> Result<()> {
        let token = self.next_token(id as u32, OpKind::Close, Payload::None)?;
        let close = opcode::Close::new(types::Fd(fd)).build().user_data(token);
        self.push(&close, token)
    }

    /// Take a trampoline pipe from the pool.
    pub(crate) fn acquire_pipe(&mut self) -> Result<Pipe> {
        self.pipes.acquire()
    }

    /// Return a trampoline pipe to the pool.
    pub(crate) fn release_pipe(&mut self, pipe: Pipe) {
        self.pipes.release(pipe);
    }

    fn ready_of(revents: u32) -> Ready {
        let mut ready = Ready::empty();
        if revents & (libc::POLLIN as u32) != 0 {
            ready = ready | Ready::READABLE;
        }
        if revents & (libc::POLLOUT as u32) != 0 {
            ready = ready | Ready::WRITABLE;
        }
        if revents & (libc::POLLHUP as u32 | libc::POLLRDHUP as u32 | libc::POLLERR as u32) != 0 {
            ready = ready | Ready::READABLE | Ready::HANG_UP;
        }
        ready
    }

    /// Drain the completion queue into readiness/completion events.
    fn drain_completions(&mut self, events: &mut Vec<IoEvent>) {
        loop {
            let cqe = match self.ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };
            let token = cqe.user_data();
            let result = cqe.result();
            let (reg, op, seq) = unpack_token(token);
            let pending = match self.pending.try_remove(seq as usize) {
                Some(pending) => pending,
                None => {
                    warn!(token, "unknown completion token");
                    continue;
                }
            };
            debug_assert_eq!(pending.reg, reg);
            let op = match op {
                Some(op) => op,
                None => {
                    warn!(token, "completion with unknown op code");
                    continue;
                }
            };
            match op {
                OpKind::Wake => {
                    if let Err(e) = self.arm_wake() {
                        warn!(error = %e, "re-arming wake failed");
                    }
                }
                OpKind::Timeout | OpKind::Cancel => {}
                OpKind::Poll => {
                    let id = reg as usize;
                    let stale = match self.regs.get_mut(&id) {
                        Some(state) if state.poll_seq == Some(seq) => {
                            state.poll_seq = None;
                            false
                        }
                        _ => true,
                    };
                    if stale || result == -libc::ECANCELED {
                        continue;
                    }
                    let ready = if result >= 0 {
                        Self::ready_of(result as u32)
                    } else {
                        Ready::HANG_UP
                    };
                    if !ready.is_empty() {
                        events.push(IoEvent {
                            id,
                            payload: IoPayload::Ready(ready),
                        });
                    }
                    // Oneshot poll: readiness interest persists until the
                    // registration says otherwise.
                    if let Err(e) = self.arm_poll(id) {
                        warn!(error = %e, "re-arming poll failed");
                    }
                }
                op => {
                    events.push(IoEvent {
                        id: reg as usize,
                        payload: IoPayload::Completion { op, result },
                    });
                }
            }
        }
    }
}

impl IoBackend for UringBackend {
    fn register(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        if self.regs.contains_key(&id) {
            return Err(Error::IllegalState(format!("id {id} already registered")));
        }
        self.regs.insert(
            id,
            RegState {
                fd,
                interest,
                poll_seq: None,
            },
        );
        self.arm_poll(id)
    }

    fn modify(&mut self, fd: RawFd, id: usize, interest: Interest) -> Result<()> {
        let armed = {
            let reg = self
                .regs
                .get_mut(&id)
                .ok_or_else(|| Error::IllegalState(format!("id {id} is not registered")))?;
            if reg.interest == interest {
                return Ok(());
            }
            reg.fd = fd;
            reg.interest = interest;
            reg.poll_seq.take()
        };
        // An armed poll watches the old mask: cancel it and re-arm. The old
        // completion is recognized as stale by its sequence and dropped.
        if let Some(seq) = armed {
            self.cancel_token(pack_token(id as u32, OpKind::Poll, seq))?;
        }
        self.arm_poll(id)
    }

    fn deregister(&mut self, _fd: RawFd, id: usize) -> Result<()> {
        let reg = self
            .regs
            .remove(&id)
            .ok_or_else(|| Error::IllegalState(format!("id {id} is not registered")))?;
        if let Some(seq) = reg.poll_seq {
            let _ = self.cancel_token(pack_token(id as u32, OpKind::Poll, seq));
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<IoEvent>) -> Result<()> {
        // Hand queued SQEs to the kernel, then serve whatever already
        // completed without blocking.
        self.ring.submit()?;
        if !self.ring.completion().is_empty() {
            self.drain_completions(events);
            return Ok(());
        }
        match timeout {
            Some(timeout) if timeout.is_zero() => {
                self.drain_completions(events);
                return Ok(());
            }
            Some(timeout) => {
                *self.timeout_ts = types::Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let token = self.next_token(INTERNAL_REG, OpKind::Timeout, Payload::None)?;
                let entry = opcode::Timeout::new(&*self.timeout_ts)
                    .build()
                    .user_data(token);
                self.push(&entry, token)?;
            }
            None => {}
        }
        match self.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
        self.drain_completions(events);
        Ok(())
    }

    fn waker(&self) -> IoWaker {
        let eventfd = Arc::clone(&self.eventfd);
        IoWaker::new(move || {
            let one: u64 = 1;
            let n = unsafe {
                libc::write(eventfd.0, &one as *const u64 as *const libc::c_void, 8)
            };
            if n < 0 {
                debug!("eventfd wake failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_packing_round_trip() {
        for (reg, op, seq) in [
            (0u32, OpKind::Poll, 0u32),
            (7, OpKind::Writev, 12345),
            (u32::MAX, OpKind::Wake, (1 << 24) - 1),
        ] {
            let token = pack_token(reg, op, seq);
            let (r, o, s) = unpack_token(token);
            assert_eq!(r, reg);
            assert_eq!(o, Some(op));
            assert_eq!(s, seq);
        }
    }

    #[test]
    fn test_tokens_are_distinct_across_ops() {
        let a = pack_token(1, OpKind::SpliceToPipe, 5);
        let b = pack_token(1, OpKind::SpliceFromPipe, 5);
        let c = pack_token(2, OpKind::SpliceToPipe, 5);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ready_mapping() {
        let r = UringBackend::ready_of(libc::POLLIN as u32 | libc::POLLOUT as u32);
        assert!(r.contains(Ready::READABLE));
        assert!(r.contains(Ready::WRITABLE));
        let hup = UringBackend::ready_of(libc::POLLHUP as u32);
        assert!(hup.contains(Ready::HANG_UP));
        assert!(hup.contains(Ready::READABLE));
    }

    // Ring-backed tests run only where io_uring is actually available.
    fn ring_available() -> Option<UringBackend> {
        UringBackend::new(64).ok()
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut backend = match ring_available() {
            Some(backend) => backend,
            None => return,
        };
        let waker = backend.waker();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });
        let mut events = Vec::new();
        backend
            .wait(Some(Duration::from_secs(5)), &mut events)
            .unwrap();
        assert!(events.is_empty());
        t.join().unwrap();
    }

    #[test]
    fn test_exactly_one_completion_per_submission() {
        let mut backend = match ring_available() {
            Some(backend) => backend,
            None => return,
        };
        // A write to an invalid fd still completes, exactly once, with a
        // negated errno.
        backend.register(-1, 3, Interest::empty()).unwrap();
        let data = [0u8; 4];
        backend.submit_write(3, -1, data.as_ptr(), 4).unwrap();
        assert_eq!(backend.pending_ops(3), 1);
        let mut events = Vec::new();
        for _ in 0..50 {
            backend
                .wait(Some(Duration::from_millis(100)), &mut events)
                .unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert_eq!(events.len(), 1);
        match events[0].payload {
            IoPayload::Completion { op, result } => {
                assert_eq!(op, OpKind::Write);
                assert!(result < 0);
            }
            _ => panic!("expected completion"),
        }
        assert_eq!(backend.pending_ops(3), 0);
    }

    #[test]
    fn test_poll_readiness_synthesis() {
        use std::io::Write as _;
        use std::os::unix::io::AsRawFd;

        let mut backend = match ring_available() {
            Some(backend) => backend,
            None => return,
        };
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        backend
            .register(server.as_raw_fd(), 9, Interest::READ)
            .unwrap();
        client.write_all(b"ping").unwrap();

        let mut events = Vec::new();
        for _ in 0..50 {
            backend
                .wait(Some(Duration::from_millis(100)), &mut events)
                .unwrap();
            if !events.is_empty() {
                break;
            }
        }
        assert!(events.iter().any(|e| {
            e.id == 9
                && matches!(e.payload, IoPayload::Ready(r) if r.contains(Ready::READABLE))
        }));
        backend.deregister(server.as_raw_fd(), 9).unwrap();
    }
}
