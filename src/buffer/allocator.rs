//! Buffer allocation: unpooled heap/direct memory and arena-backed pooling.
//!
//! Every buffer's bytes live behind a `RootMem`: the reference count, the
//! current memory region, and the optional leak tracker. Views share the
//! root; the count reaching zero runs the deallocator exactly once and the
//! root becomes inaccessible.

use crate::buffer::arena::{Arena, Run};
use crate::buffer::composite::CompositeBuf;
use crate::buffer::leak::{LeakDetector, LeakLevel, LeakTracker};
use crate::buffer::ByteBuf;
use crate::cleaner::{Cleaner, CleanerPool};
use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Growth doubles up to this size, then advances in steps of it.
const GROWTH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Alignment for unpooled direct regions.
const DIRECT_ALIGN: usize = 8;

/// One memory region backing a buffer root.
pub(crate) struct Mem {
    ptr: *mut u8,
    cap: usize,
    kind: MemKind,
}

pub(crate) enum MemKind {
    /// Boxed slice on the Rust heap.
    Heap,
    /// Raw allocation with a stable address for kernel submission.
    Direct { layout: Layout },
    /// Run carved out of a pooled arena chunk.
    Pooled { arena: Arc<Arena>, run: Run },
    /// Already freed.
    Empty,
}

// The region is exclusively owned by the root; raw pointers move with it.
unsafe impl Send for Mem {}

impl Mem {
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    pub(crate) fn is_direct(&self) -> bool {
        !matches!(self.kind, MemKind::Heap)
    }

    fn empty() -> Mem {
        Mem {
            ptr: std::ptr::null_mut(),
            cap: 0,
            kind: MemKind::Empty,
        }
    }

    /// Release the region. Heap memory drops inline; native regions go
    /// through the given cleaner when one is present.
    fn free(self, cleaner: Option<&Cleaner>) {
        match self.kind {
            MemKind::Heap | MemKind::Empty => free_inline(self),
            MemKind::Direct { .. } | MemKind::Pooled { .. } => match cleaner {
                Some(c) => c.submit(move || free_inline(self)),
                None => free_inline(self),
            },
        }
    }
}

fn free_inline(mem: Mem) {
    match mem.kind {
        MemKind::Heap => {
            let slice = std::ptr::slice_from_raw_parts_mut(mem.ptr, mem.cap);
            drop(unsafe { Box::from_raw(slice) });
        }
        MemKind::Direct { layout } => unsafe { dealloc(mem.ptr, layout) },
        MemKind::Pooled { arena, run } => arena.free(run),
        MemKind::Empty => {}
    }
}

/// Shared state behind a buffer and all of its views.
pub(crate) struct RootMem {
    refs: AtomicUsize,
    mem: UnsafeCell<Mem>,
    leak: Option<LeakTracker>,
    cleaner: Option<Cleaner>,
}

// Views may live on other threads. Byte access is governed by the ownership
// contract on the reference count; the runtime never hands the same count
// unit to two writers.
unsafe impl Send for RootMem {}
unsafe impl Sync for RootMem {}

impl RootMem {
    pub(crate) fn new(mem: Mem, leak: Option<LeakTracker>, cleaner: Option<Cleaner>) -> Arc<RootMem> {
        Arc::new(RootMem {
            refs: AtomicUsize::new(1),
            mem: UnsafeCell::new(mem),
            leak,
            cleaner,
        })
    }

    pub(crate) fn ref_cnt(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        unsafe { (*self.mem.get()).ptr() }
    }

    pub(crate) fn cap(&self) -> usize {
        unsafe { (*self.mem.get()).cap() }
    }

    pub(crate) fn is_direct(&self) -> bool {
        unsafe { (*self.mem.get()).is_direct() }
    }

    pub(crate) fn leak(&self) -> Option<&LeakTracker> {
        self.leak.as_ref()
    }

    pub(crate) fn check_accessible(&self) -> Result<()> {
        let count = self.ref_cnt();
        if count == 0 {
            return Err(Error::IllegalReferenceCount { count });
        }
        Ok(())
    }

    pub(crate) fn try_retain(&self, n: usize) -> Result<()> {
        let mut cur = self.refs.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(Error::IllegalReferenceCount { count: 0 });
            }
            match self.refs.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Drop one reference. Returns true when this call freed the memory.
    pub(crate) fn try_release(&self) -> Result<bool> {
        let mut cur = self.refs.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return Err(Error::IllegalReferenceCount { count: 0 });
            }
            match self.refs.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        if cur == 1 {
            let mem = unsafe { std::ptr::replace(self.mem.get(), Mem::empty()) };
            mem.free(self.cleaner.as_ref());
            if let Some(leak) = &self.leak {
                leak.close();
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Swap in a grown region, returning the old one for release.
    ///
    /// Caller must hold exclusive ownership of the buffer while growing.
    pub(crate) unsafe fn swap_mem(&self, new: Mem) -> Mem {
        std::ptr::replace(self.mem.get(), new)
    }

    pub(crate) fn free_replaced(&self, old: Mem) {
        old.free(self.cleaner.as_ref());
    }
}

impl Drop for RootMem {
    fn drop(&mut self) {
        let remaining = self.ref_cnt();
        let mem = unsafe { std::ptr::replace(self.mem.get(), Mem::empty()) };
        if !matches!(mem.kind, MemKind::Empty) {
            if let Some(leak) = &self.leak {
                leak.report_if_leaked(remaining);
            }
            // Reclaim regardless so an abandoned buffer never pins a run.
            mem.free(self.cleaner.as_ref());
        }
    }
}

/// Buffer type an allocator hands out by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatorType {
    /// Arena-backed direct buffers.
    #[default]
    Pooled,
    /// Plain per-buffer allocations.
    Unpooled,
}

impl AllocatorType {
    /// Parse the `allocator.type` property value.
    pub fn parse(s: &str) -> Option<AllocatorType> {
        match s.to_ascii_lowercase().as_str() {
            "pooled" => Some(AllocatorType::Pooled),
            "unpooled" => Some(AllocatorType::Unpooled),
            _ => None,
        }
    }
}

struct AllocatorInner {
    pool: Option<Arc<Arena>>,
    leak: Arc<LeakDetector>,
    cleaners: Option<Arc<CleanerPool>>,
}

/// Front-end for buffer allocation.
///
/// Cheap to clone; clones share the same arena, leak detector, and cleaner
/// pool.
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    /// Pooled allocator over one arena with `PAGE_SIZE << max_order` chunks.
    pub fn pooled(
        max_order: u32,
        leak: Arc<LeakDetector>,
        cleaners: Option<Arc<CleanerPool>>,
    ) -> Allocator {
        Allocator {
            inner: Arc::new(AllocatorInner {
                pool: Some(Arena::new(max_order)),
                leak,
                cleaners,
            }),
        }
    }

    /// Unpooled allocator: every buffer owns its region.
    pub fn unpooled(leak: Arc<LeakDetector>) -> Allocator {
        Allocator {
            inner: Arc::new(AllocatorInner {
                pool: None,
                leak,
                cleaners: None,
            }),
        }
    }

    /// Unpooled allocator with paranoid leak tracking, for tests.
    pub fn for_tests() -> Allocator {
        Allocator::unpooled(LeakDetector::new(LeakLevel::Paranoid))
    }

    /// The leak detector observing this allocator's buffers.
    pub fn leak_detector(&self) -> &Arc<LeakDetector> {
        &self.inner.leak
    }

    /// Whether this allocator pools memory.
    pub fn is_pooled(&self) -> bool {
        self.inner.pool.is_some()
    }

    /// Allocate with the allocator's default ownership type: direct when
    /// pooled, heap when unpooled.
    pub fn buffer(&self, initial: usize, max: usize) -> Result<ByteBuf> {
        if self.is_pooled() {
            self.direct(initial, max)
        } else {
            self.heap(initial, max)
        }
    }

    /// Allocate a heap buffer.
    pub fn heap(&self, initial: usize, max: usize) -> Result<ByteBuf> {
        check_bounds(initial, max)?;
        let mem = new_heap_mem(initial);
        Ok(self.make_root(mem, max, "heap"))
    }

    /// Allocate a direct buffer with a stable memory address.
    pub fn direct(&self, initial: usize, max: usize) -> Result<ByteBuf> {
        check_bounds(initial, max)?;
        let mem = self.new_mem(initial, true)?;
        Ok(self.make_root(mem, max, "direct"))
    }

    /// Start an empty composite buffer.
    pub fn compose(&self) -> CompositeBuf {
        CompositeBuf::new(self.clone())
    }

    fn make_root(&self, mem: Mem, max: usize, hint: &'static str) -> ByteBuf {
        let leak = self.inner.leak.track(hint);
        let cleaner = self.inner.cleaners.as_ref().map(|p| p.cleaner());
        ByteBuf::new_root(RootMem::new(mem, leak, cleaner), max, self.clone())
    }

    /// Allocate a raw region of exactly-or-more than `cap` bytes.
    pub(crate) fn new_mem(&self, cap: usize, direct: bool) -> Result<Mem> {
        if !direct {
            return Ok(new_heap_mem(cap));
        }
        if let Some(arena) = &self.inner.pool {
            if cap <= arena.chunk_size() {
                let run = arena.allocate(cap)?;
                return Ok(Mem {
                    ptr: run.ptr(),
                    cap: run.len(),
                    kind: MemKind::Pooled {
                        arena: Arc::clone(arena),
                        run,
                    },
                });
            }
            // Larger than a chunk: fall through to a dedicated region.
        }
        new_direct_mem(cap)
    }
}

fn check_bounds(initial: usize, max: usize) -> Result<()> {
    if initial > max {
        return Err(Error::IllegalState(format!(
            "initial capacity {initial} exceeds max capacity {max}"
        )));
    }
    Ok(())
}

fn new_heap_mem(cap: usize) -> Mem {
    let boxed: Box<[u8]> = vec![0u8; cap].into_boxed_slice();
    let ptr = Box::into_raw(boxed) as *mut u8;
    Mem {
        ptr,
        cap,
        kind: MemKind::Heap,
    }
}

fn new_direct_mem(cap: usize) -> Result<Mem> {
    let layout = Layout::from_size_align(cap.max(1), DIRECT_ALIGN)
        .map_err(|e| Error::AllocationFailed(e.to_string()))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(Error::AllocationFailed(format!(
            "cannot reserve {cap} direct bytes"
        )));
    }
    Ok(Mem {
        ptr,
        cap,
        kind: MemKind::Direct { layout },
    })
}

/// Capacity for a write that needs `needed` bytes: double up to the
/// threshold, then grow in fixed threshold-sized steps, clamped to
/// `max_capacity`.
pub(crate) fn calculate_new_capacity(needed: usize, max_capacity: usize) -> usize {
    debug_assert!(needed <= max_capacity);
    if needed == GROWTH_THRESHOLD {
        return GROWTH_THRESHOLD;
    }
    if needed > GROWTH_THRESHOLD {
        let base = needed / GROWTH_THRESHOLD * GROWTH_THRESHOLD;
        if base > max_capacity - GROWTH_THRESHOLD {
            return max_capacity;
        }
        return base + GROWTH_THRESHOLD;
    }
    let mut cap = 64usize;
    while cap < needed {
        cap <<= 1;
    }
    cap.min(max_capacity)
}
