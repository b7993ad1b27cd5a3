//! Splice-based sendfile.
//!
//! Sending a file region to a socket without user-space copies uses a pipe
//! as a kernel-side trampoline: splice file -> pipe, then pipe -> socket,
//! chunk by chunk. One transfer per handle; reentry fails with `Busy`. The
//! pipe comes from a per-loop pool when the machine leaves IDLE and goes
//! back on every path that returns to IDLE.

use super::{Payload, UringBackend};
use crate::error::{Error, Result};
use crate::io::OpKind;
use crate::promise::Promise;
use io_uring::{opcode, types};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::warn;

/// Bytes moved through the pipe per hop, sized to the default pipe buffer.
const SPLICE_CHUNK: u32 = 64 * 1024;

/// Pipes kept idle in the pool.
const POOL_CAP: usize = 8;

/// A kernel pipe used as a splice trampoline.
pub(crate) struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe {
    fn new() -> Result<Pipe> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(Error::NativeIo(io::Error::last_os_error()));
        }
        Ok(Pipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Pool of idle trampoline pipes, one per event loop.
pub(crate) struct PipePool {
    free: Vec<Pipe>,
}

impl PipePool {
    pub(crate) fn new() -> PipePool {
        PipePool { free: Vec::new() }
    }

    pub(crate) fn acquire(&mut self) -> Result<Pipe> {
        match self.free.pop() {
            Some(pipe) => Ok(pipe),
            None => Pipe::new(),
        }
    }

    pub(crate) fn release(&mut self, pipe: Pipe) {
        if self.free.len() < POOL_CAP {
            self.free.push(pipe);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }
}

/// Submission surface the machine drives; the adapter implements it over
/// the ring, tests over a recorder.
pub(crate) trait SpliceSubmit {
    /// Splice `len` bytes from a file offset into the pipe's write end.
    fn splice_to_pipe(
        &mut self,
        reg: usize,
        file_fd: RawFd,
        offset: i64,
        pipe_w: RawFd,
        len: u32,
    ) -> Result<()>;

    /// Splice `len` bytes from the pipe's read end into the socket.
    fn splice_from_pipe(
        &mut self,
        reg: usize,
        pipe_r: RawFd,
        sock_fd: RawFd,
        len: u32,
    ) -> Result<()>;
}

impl SpliceSubmit for UringBackend {
    fn splice_to_pipe(
        &mut self,
        reg: usize,
        file_fd: RawFd,
        offset: i64,
        pipe_w: RawFd,
        len: u32,
    ) -> Result<()> {
        let token = self.next_token(reg as u32, OpKind::SpliceToPipe, Payload::None)?;
        let sqe = opcode::Splice::new(types::Fd(file_fd), offset, types::Fd(pipe_w), -1, len)
            .build()
            .user_data(token);
        self.push(&sqe, token)
    }

    fn splice_from_pipe(
        &mut self,
        reg: usize,
        pipe_r: RawFd,
        sock_fd: RawFd,
        len: u32,
    ) -> Result<()> {
        let token = self.next_token(reg as u32, OpKind::SpliceFromPipe, Payload::None)?;
        let sqe = opcode::Splice::new(types::Fd(pipe_r), -1, types::Fd(sock_fd), -1, len)
            .build()
            .user_data(token);
        self.push(&sqe, token)
    }
}

/// Machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Nothing in flight.
    Idle,
    /// Waiting for the file -> pipe splice.
    SpliceToPipe,
    /// Waiting for the pipe -> socket splice.
    SpliceFromPipe,
}

/// Terminal result of one transfer, handed back for completion after all
/// loop-local borrows are released.
pub(crate) struct SpliceDone {
    /// Pipe to return to the pool.
    pub(crate) pipe: Pipe,
    /// The transfer's promise.
    pub(crate) promise: Promise<u64>,
    /// Transferred byte count, or the failure.
    pub(crate) outcome: Result<u64>,
}

/// Per-registration sendfile state machine.
pub(crate) struct SendFile {
    reg: usize,
    sock_fd: RawFd,
    stage: Stage,
    pipe: Option<Pipe>,
    file: Option<File>,
    offset: u64,
    remaining: u64,
    transferred: u64,
    /// Bytes sitting in the pipe awaiting the second hop.
    in_pipe: u32,
    promise: Option<Promise<u64>>,
}

impl SendFile {
    pub(crate) fn new(reg: usize, sock_fd: RawFd) -> SendFile {
        SendFile {
            reg,
            sock_fd,
            stage: Stage::Idle,
            pipe: None,
            file: None,
            offset: 0,
            remaining: 0,
            transferred: 0,
            in_pipe: 0,
            promise: None,
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }

    /// Begin a transfer. One per handle: reentry fails with `Busy`.
    pub(crate) fn start(
        &mut self,
        file: File,
        offset: u64,
        len: u64,
        promise: Promise<u64>,
        pipe: Pipe,
        sub: &mut dyn SpliceSubmit,
    ) -> Result<()> {
        if self.stage != Stage::Idle {
            return Err(Error::Busy);
        }
        let file_fd = file.as_raw_fd();
        let chunk = len.min(SPLICE_CHUNK as u64) as u32;
        self.stage = Stage::SpliceToPipe;
        self.offset = offset;
        self.remaining = len;
        self.transferred = 0;
        self.in_pipe = 0;
        self.promise = Some(promise);
        let pipe_w = pipe.write_fd();
        self.pipe = Some(pipe);
        self.file = Some(file);
        if let Err(e) = sub.splice_to_pipe(self.reg, file_fd, offset as i64, pipe_w, chunk) {
            self.stage = Stage::Idle;
            self.file = None;
            self.promise = None;
            return Err(e);
        }
        Ok(())
    }

    fn finish(&mut self, outcome: Result<u64>) -> Option<SpliceDone> {
        self.stage = Stage::Idle;
        self.file = None;
        self.in_pipe = 0;
        let pipe = self.pipe.take()?;
        let promise = self.promise.take()?;
        Some(SpliceDone {
            pipe,
            promise,
            outcome,
        })
    }

    /// Completion of the file -> pipe hop.
    pub(crate) fn on_splice_to_pipe(
        &mut self,
        result: i32,
        sub: &mut dyn SpliceSubmit,
    ) -> Option<SpliceDone> {
        if self.stage != Stage::SpliceToPipe {
            warn!(stage = ?self.stage, "unexpected splice-to-pipe completion");
            return None;
        }
        if result < 0 {
            return self.finish(Err(Error::from_errno(-result)));
        }
        if result == 0 {
            // File ran out early: the transfer ends at what was moved.
            return self.finish(Ok(self.transferred));
        }
        let moved = result as u32;
        self.in_pipe = moved;
        self.offset += moved as u64;
        self.remaining = self.remaining.saturating_sub(moved as u64);
        self.stage = Stage::SpliceFromPipe;
        let pipe_r = self.pipe.as_ref().expect("pipe held while active").read_fd();
        if let Err(e) = sub.splice_from_pipe(self.reg, pipe_r, self.sock_fd, moved) {
            return self.finish(Err(e));
        }
        None
    }

    /// Completion of the pipe -> socket hop.
    pub(crate) fn on_splice_from_pipe(
        &mut self,
        result: i32,
        sub: &mut dyn SpliceSubmit,
    ) -> Option<SpliceDone> {
        if self.stage != Stage::SpliceFromPipe {
            warn!(stage = ?self.stage, "unexpected splice-from-pipe completion");
            return None;
        }
        if result < 0 {
            return self.finish(Err(Error::from_errno(-result)));
        }
        if result == 0 && self.in_pipe > 0 {
            return self.finish(Err(Error::from_errno(libc::EPIPE)));
        }
        let moved = result as u32;
        self.transferred += moved as u64;
        self.in_pipe = self.in_pipe.saturating_sub(moved);
        if self.in_pipe > 0 {
            // Short second hop: drain the rest of this chunk first.
            let pipe_r = self.pipe.as_ref().expect("pipe held while active").read_fd();
            if let Err(e) = sub.splice_from_pipe(self.reg, pipe_r, self.sock_fd, self.in_pipe) {
                return self.finish(Err(e));
            }
            return None;
        }
        if self.remaining > 0 {
            let chunk = self.remaining.min(SPLICE_CHUNK as u64) as u32;
            let file_fd = self.file.as_ref().expect("file held while active").as_raw_fd();
            let pipe_w = self.pipe.as_ref().expect("pipe held while active").write_fd();
            self.stage = Stage::SpliceToPipe;
            if let Err(e) =
                sub.splice_to_pipe(self.reg, file_fd, self.offset as i64, pipe_w, chunk)
            {
                return self.finish(Err(e));
            }
            return None;
        }
        self.finish(Ok(self.transferred))
    }

    /// Abandon the transfer on channel close. The caller cancels the
    /// outstanding splice op first; the pipe and promise come back here for
    /// release and failure.
    pub(crate) fn close(&mut self) -> (Option<Pipe>, Option<Promise<u64>>) {
        self.stage = Stage::Idle;
        self.file = None;
        self.in_pipe = 0;
        (self.pipe.take(), self.promise.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// Records submissions instead of touching a ring.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(&'static str, u32)>,
        fail_next: bool,
    }

    impl SpliceSubmit for Recorder {
        fn splice_to_pipe(
            &mut self,
            _reg: usize,
            _file_fd: RawFd,
            _offset: i64,
            _pipe_w: RawFd,
            len: u32,
        ) -> Result<()> {
            if self.fail_next {
                return Err(Error::NativeIo(io::Error::other("boom")));
            }
            self.calls.push(("to_pipe", len));
            Ok(())
        }

        fn splice_from_pipe(
            &mut self,
            _reg: usize,
            _pipe_r: RawFd,
            _sock_fd: RawFd,
            len: u32,
        ) -> Result<()> {
            if self.fail_next {
                return Err(Error::NativeIo(io::Error::other("boom")));
            }
            self.calls.push(("from_pipe", len));
            Ok(())
        }
    }

    fn temp_file(len: usize) -> File {
        let mut file = tempfile();
        file.write_all(&vec![7u8; len]).unwrap();
        file
    }

    fn tempfile() -> File {
        // Unlinked named temp; unique per call so tests can run in parallel.
        static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let path = std::env::temp_dir().join(format!(
            "hawser-sendfile-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }

    #[test]
    fn test_two_chunk_transfer_returns_to_idle() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        let promise: Promise<u64> = Promise::new();
        let len = SPLICE_CHUNK as u64 + 32 * 1024;
        machine
            .start(temp_file(96), 0, len, promise.clone(), Pipe::new().unwrap(), &mut sub)
            .unwrap();
        assert_eq!(machine.stage(), Stage::SpliceToPipe);
        assert_eq!(sub.calls.last(), Some(&("to_pipe", SPLICE_CHUNK)));

        assert!(machine
            .on_splice_to_pipe(SPLICE_CHUNK as i32, &mut sub)
            .is_none());
        assert_eq!(machine.stage(), Stage::SpliceFromPipe);
        assert_eq!(sub.calls.last(), Some(&("from_pipe", SPLICE_CHUNK)));

        assert!(machine
            .on_splice_from_pipe(SPLICE_CHUNK as i32, &mut sub)
            .is_none());
        assert_eq!(sub.calls.last(), Some(&("to_pipe", 32 * 1024)));

        assert!(machine.on_splice_to_pipe(32 * 1024, &mut sub).is_none());
        let done = machine
            .on_splice_from_pipe(32 * 1024, &mut sub)
            .expect("transfer complete");
        assert_eq!(done.outcome.unwrap(), len);
        assert_eq!(machine.stage(), Stage::Idle);
        done.promise.try_success(len);
    }

    #[test]
    fn test_reentry_is_busy() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        machine
            .start(
                temp_file(8),
                0,
                8,
                Promise::new(),
                Pipe::new().unwrap(),
                &mut sub,
            )
            .unwrap();
        let again = machine.start(
            temp_file(8),
            0,
            8,
            Promise::new(),
            Pipe::new().unwrap(),
            &mut sub,
        );
        assert!(matches!(again, Err(Error::Busy)));
        assert_eq!(machine.stage(), Stage::SpliceToPipe);
    }

    #[test]
    fn test_failure_releases_pipe_and_fails() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        machine
            .start(
                temp_file(8),
                0,
                8,
                Promise::new(),
                Pipe::new().unwrap(),
                &mut sub,
            )
            .unwrap();
        let done = machine
            .on_splice_to_pipe(-libc::EIO, &mut sub)
            .expect("failed transfer completes");
        assert!(done.outcome.is_err());
        assert_eq!(machine.stage(), Stage::Idle);
    }

    #[test]
    fn test_short_second_hop_drains_chunk() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        machine
            .start(
                temp_file(64),
                0,
                1024,
                Promise::new(),
                Pipe::new().unwrap(),
                &mut sub,
            )
            .unwrap();
        assert!(machine.on_splice_to_pipe(1024, &mut sub).is_none());
        // Socket took only 100 bytes: the remaining 924 go out first.
        assert!(machine.on_splice_from_pipe(100, &mut sub).is_none());
        assert_eq!(sub.calls.last(), Some(&("from_pipe", 924)));
        let done = machine
            .on_splice_from_pipe(924, &mut sub)
            .expect("transfer complete");
        assert_eq!(done.outcome.unwrap(), 1024);
    }

    #[test]
    fn test_eof_completes_with_transferred() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        machine
            .start(
                temp_file(0),
                0,
                4096,
                Promise::new(),
                Pipe::new().unwrap(),
                &mut sub,
            )
            .unwrap();
        let done = machine
            .on_splice_to_pipe(0, &mut sub)
            .expect("EOF completes");
        assert_eq!(done.outcome.unwrap(), 0);
        assert_eq!(machine.stage(), Stage::Idle);
    }

    #[test]
    fn test_close_mid_transfer_returns_pipe() {
        let mut machine = SendFile::new(1, 10);
        let mut sub = Recorder::default();
        let promise: Promise<u64> = Promise::new();
        machine
            .start(
                temp_file(8),
                0,
                8,
                promise.clone(),
                Pipe::new().unwrap(),
                &mut sub,
            )
            .unwrap();
        let (pipe, pending) = machine.close();
        assert!(pipe.is_some());
        assert!(pending.is_some());
        assert_eq!(machine.stage(), Stage::Idle);
    }

    #[test]
    fn test_pipe_pool_reuses() {
        let mut pool = PipePool::new();
        let pipe = pool.acquire().unwrap();
        let fd = pipe.read_fd();
        pool.release(pipe);
        assert_eq!(pool.idle(), 1);
        let again = pool.acquire().unwrap();
        assert_eq!(again.read_fd(), fd);
        assert_eq!(pool.idle(), 0);
    }
}
