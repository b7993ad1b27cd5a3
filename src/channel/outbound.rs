//! Per-channel outbound buffer.
//!
//! A FIFO of pending write entries, each holding the message, its promise,
//! and a size estimate. `write` adds entries, `flush` marks them flushed,
//! and the backend removes them as the kernel accepts bytes. Pending-byte
//! accounting reports writability changes when crossing the configured
//! high/low watermarks, one event per crossing.
//!
//! Mutating methods return the promises they retired instead of completing
//! them: the channel completes them after releasing its borrows, so a
//! listener may immediately issue new channel operations.

use crate::buffer::ByteBuf;
use crate::promise::Promise;
use std::collections::VecDeque;

pub(crate) struct WriteEntry {
    pub(crate) buf: ByteBuf,
    promise: Promise<()>,
}

/// Result of an outbound-buffer mutation: the writability transition, if
/// one crossed a watermark, plus the promises now ready to complete.
#[derive(Default)]
pub(crate) struct Retired {
    pub(crate) writability: Option<bool>,
    pub(crate) promises: Vec<Promise<()>>,
}

pub(crate) struct OutboundBuffer {
    queue: VecDeque<WriteEntry>,
    /// Number of entries at the front already marked flushed.
    flushed: usize,
    pending_bytes: usize,
    writable: bool,
    high_water_mark: usize,
    low_water_mark: usize,
}

impl OutboundBuffer {
    pub(crate) fn new(high_water_mark: usize, low_water_mark: usize) -> OutboundBuffer {
        OutboundBuffer {
            queue: VecDeque::new(),
            flushed: 0,
            pending_bytes: 0,
            writable: true,
            high_water_mark,
            low_water_mark,
        }
    }

    /// Queue one message. Returns `Some(false)` when the add crossed the
    /// high watermark.
    pub(crate) fn add(&mut self, buf: ByteBuf, promise: Promise<()>) -> Option<bool> {
        let size = buf.readable_bytes();
        self.queue.push_back(WriteEntry { buf, promise });
        self.pending_bytes += size;
        self.check_watermarks()
    }

    /// Mark everything queued so far as flushed.
    pub(crate) fn add_flush(&mut self) {
        self.flushed = self.queue.len();
    }

    /// Whether flushed entries are waiting for the kernel.
    pub(crate) fn has_flushed(&self) -> bool {
        self.flushed > 0
    }

    /// Whether nothing at all is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes not yet accepted by the kernel.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Whether the channel currently reports writable.
    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    /// Readable (pointer, length) pairs of the flushed entries, for building
    /// an iovec array. Entries stay queued; the pointers remain valid until
    /// `progress` or a failure drains them.
    pub(crate) fn flushed_parts(&self, max: usize) -> Vec<(*const u8, usize)> {
        self.queue
            .iter()
            .take(self.flushed.min(max))
            .filter_map(|e| e.buf.readable_parts().ok())
            .filter(|&(_, len)| len > 0)
            .collect()
    }

    /// Retained views over the flushed entries, pinning their memory across
    /// an async submission until its completion releases them.
    pub(crate) fn retain_flushed(&self, max: usize) -> Vec<ByteBuf> {
        self.queue
            .iter()
            .take(self.flushed.min(max))
            .filter_map(|e| e.buf.retained_duplicate().ok())
            .collect()
    }

    /// Account `n` bytes accepted by the kernel: completed entries leave the
    /// queue with their promises handed back for success, a partially
    /// written head entry advances its reader index.
    pub(crate) fn progress(&mut self, mut n: usize) -> Retired {
        self.pending_bytes = self.pending_bytes.saturating_sub(n);
        let mut retired = Retired::default();
        loop {
            let readable = match self.queue.front() {
                Some(entry) if self.flushed > 0 => entry.buf.readable_bytes(),
                _ => break,
            };
            if readable == 0 || n >= readable {
                n -= readable;
                let entry = self.queue.pop_front().unwrap();
                self.flushed -= 1;
                if entry.buf.is_accessible() {
                    let _ = entry.buf.release();
                }
                retired.promises.push(entry.promise);
            } else if n > 0 {
                let entry = self.queue.front_mut().unwrap();
                let _ = entry.buf.skip_bytes(n);
                n = 0;
            } else {
                break;
            }
        }
        retired.writability = self.check_watermarks();
        retired
    }

    /// Drop the flushed entries; their promises come back to be failed.
    pub(crate) fn fail_flushed(&mut self) -> Retired {
        let mut retired = Retired::default();
        let mut drained = 0;
        while self.flushed > 0 {
            let entry = self.queue.pop_front().unwrap();
            self.flushed -= 1;
            drained += entry.buf.readable_bytes();
            if entry.buf.is_accessible() {
                let _ = entry.buf.release();
            }
            retired.promises.push(entry.promise);
        }
        self.pending_bytes = self.pending_bytes.saturating_sub(drained);
        retired.writability = self.check_watermarks();
        retired
    }

    /// Drop the entries not yet marked flushed, keeping flushed ones
    /// draining. Used by graceful close.
    pub(crate) fn fail_unflushed(&mut self) -> Retired {
        let mut retired = Retired::default();
        let mut drained = 0;
        while self.queue.len() > self.flushed {
            let entry = self.queue.pop_back().unwrap();
            drained += entry.buf.readable_bytes();
            if entry.buf.is_accessible() {
                let _ = entry.buf.release();
            }
            retired.promises.push(entry.promise);
        }
        self.pending_bytes = self.pending_bytes.saturating_sub(drained);
        retired.writability = self.check_watermarks();
        retired
    }

    /// Drop everything, flushed or not; all promises come back to be failed.
    pub(crate) fn fail_all(&mut self) -> Retired {
        let mut retired = Retired::default();
        while let Some(entry) = self.queue.pop_front() {
            if entry.buf.is_accessible() {
                let _ = entry.buf.release();
            }
            retired.promises.push(entry.promise);
        }
        self.flushed = 0;
        self.pending_bytes = 0;
        retired.writability = self.check_watermarks();
        retired
    }

    /// Apply a watermark transition. `Some(new_writability)` at most once
    /// per crossing.
    fn check_watermarks(&mut self) -> Option<bool> {
        if self.writable && self.pending_bytes > self.high_water_mark {
            self.writable = false;
            return Some(false);
        }
        if !self.writable && self.pending_bytes < self.low_water_mark {
            self.writable = true;
            return Some(true);
        }
        None
    }
}
