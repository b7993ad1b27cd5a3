//! Pooled memory arenas.
//!
//! A chunk is one large page-aligned region carved into page runs. Free runs
//! are indexed by run length so allocation picks the smallest free run that
//! fits, splits it, and returns a handle; deallocation merges the run with
//! free neighbors. A per-thread cache keeps small runs out of the arena lock
//! on the hot path and is flushed back when the thread exits.

use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Page granularity of a chunk.
pub(crate) const PAGE_SIZE: usize = 8192;

/// Alignment for chunk memory, matching kernel page expectations.
const CHUNK_ALIGN: usize = 4096;

/// Runs of at most this many pages go through the per-thread cache.
const CACHE_MAX_PAGES: usize = 8;

/// Cached runs kept per size class before overflowing back to the arena.
const CACHE_SHARD_CAP: usize = 32;

/// A run of pages handed out by an arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Run {
    chunk: usize,
    page_off: usize,
    pub(crate) pages: usize,
    ptr: *mut u8,
}

impl Run {
    /// Base address of the run.
    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Usable length in bytes.
    pub(crate) fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }
}

// Runs move between threads when a buffer is released off its allocating
// thread; the arena mutex guards the backing bookkeeping.
unsafe impl Send for Run {}

struct Chunk {
    ptr: *mut u8,
    layout: Layout,
    /// Free runs keyed by (length, offset): range scans find the smallest fit.
    free_by_len: BTreeSet<(usize, usize)>,
    /// Free runs keyed by page offset, for neighbor merging.
    free_by_off: BTreeMap<usize, usize>,
    used_pages: usize,
}

unsafe impl Send for Chunk {}

impl Chunk {
    fn new(pages: usize) -> Result<Chunk> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, CHUNK_ALIGN)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::AllocationFailed(format!(
                "cannot reserve {} byte chunk",
                pages * PAGE_SIZE
            )));
        }
        let mut free_by_len = BTreeSet::new();
        free_by_len.insert((pages, 0));
        let mut free_by_off = BTreeMap::new();
        free_by_off.insert(0, pages);
        Ok(Chunk {
            ptr,
            layout,
            free_by_len,
            free_by_off,
            used_pages: 0,
        })
    }

    fn is_unused(&self) -> bool {
        self.used_pages == 0
    }

    /// Take the smallest free run of at least `pages`, splitting the rest.
    fn take(&mut self, pages: usize) -> Option<usize> {
        let &(run_pages, off) = self.free_by_len.range((pages, 0)..).next()?;
        self.free_by_len.remove(&(run_pages, off));
        self.free_by_off.remove(&off);
        if run_pages > pages {
            let rest_off = off + pages;
            let rest_pages = run_pages - pages;
            self.free_by_len.insert((rest_pages, rest_off));
            self.free_by_off.insert(rest_off, rest_pages);
        }
        self.used_pages += pages;
        Some(off)
    }

    /// Return a run, merging with adjacent free runs.
    fn give_back(&mut self, page_off: usize, pages: usize) {
        self.used_pages -= pages;
        let mut off = page_off;
        let mut len = pages;

        // Merge with the preceding free run.
        if let Some((&prev_off, &prev_len)) = self.free_by_off.range(..off).next_back() {
            if prev_off + prev_len == off {
                self.free_by_off.remove(&prev_off);
                self.free_by_len.remove(&(prev_len, prev_off));
                off = prev_off;
                len += prev_len;
            }
        }
        // Merge with the following free run.
        if let Some(&next_len) = self.free_by_off.get(&(off + len)) {
            let next_off = off + len;
            self.free_by_off.remove(&next_off);
            self.free_by_len.remove(&(next_len, next_off));
            len += next_len;
        }

        self.free_by_off.insert(off, len);
        self.free_by_len.insert((len, off));
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

struct ArenaInner {
    chunks: slab::Slab<Chunk>,
}

/// A pooled arena: chunks plus the run bookkeeping over them.
pub(crate) struct Arena {
    inner: Mutex<ArenaInner>,
    chunk_pages: usize,
}

impl Arena {
    /// Create an arena whose chunks hold `PAGE_SIZE << max_order` bytes.
    pub(crate) fn new(max_order: u32) -> Arc<Arena> {
        Arc::new(Arena {
            inner: Mutex::new(ArenaInner {
                chunks: slab::Slab::new(),
            }),
            chunk_pages: 1usize << max_order,
        })
    }

    /// Largest request the arena serves; bigger allocations go unpooled.
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_pages * PAGE_SIZE
    }

    /// Allocate a run of at least `bytes`.
    pub(crate) fn allocate(self: &Arc<Self>, bytes: usize) -> Result<Run> {
        debug_assert!(bytes <= self.chunk_size());
        let pages = Self::pages_for(bytes);
        if pages <= CACHE_MAX_PAGES {
            if let Some(run) = cache_take(self, pages) {
                return Ok(run);
            }
        }
        self.allocate_locked(pages)
    }

    /// Return a run to the arena, via the thread cache when it fits.
    pub(crate) fn free(self: &Arc<Self>, run: Run) {
        if run.pages <= CACHE_MAX_PAGES && cache_put(self, run) {
            return;
        }
        self.free_locked(run);
    }

    /// Pages for a request, rounded to a power of two within the cacheable
    /// range so cache classes match exactly.
    fn pages_for(bytes: usize) -> usize {
        let pages = bytes.div_ceil(PAGE_SIZE).max(1);
        if pages <= CACHE_MAX_PAGES {
            pages.next_power_of_two()
        } else {
            pages
        }
    }

    fn allocate_locked(self: &Arc<Self>, pages: usize) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        for (chunk_id, chunk) in inner.chunks.iter_mut() {
            if let Some(off) = chunk.take(pages) {
                let ptr = unsafe { chunk.ptr.add(off * PAGE_SIZE) };
                return Ok(Run {
                    chunk: chunk_id,
                    page_off: off,
                    pages,
                    ptr,
                });
            }
        }
        // No chunk has room: reserve a new one.
        let mut chunk = Chunk::new(self.chunk_pages)?;
        let off = chunk
            .take(pages)
            .expect("fresh chunk cannot fail a fitting request");
        let ptr = unsafe { chunk.ptr.add(off * PAGE_SIZE) };
        let chunk_id = inner.chunks.insert(chunk);
        debug!(chunk_id, chunk_bytes = self.chunk_size(), "arena grew");
        Ok(Run {
            chunk: chunk_id,
            page_off: off,
            pages,
            ptr,
        })
    }

    fn free_locked(&self, run: Run) {
        let mut inner = self.inner.lock().unwrap();
        let release = {
            let chunk = &mut inner.chunks[run.chunk];
            chunk.give_back(run.page_off, run.pages);
            chunk.is_unused()
        };
        // Keep one idle chunk around; release the rest to the OS.
        if release {
            let idle = inner
                .chunks
                .iter()
                .filter(|(_, c)| c.is_unused())
                .count();
            if idle > 1 {
                inner.chunks.remove(run.chunk);
            }
        }
    }

    /// Pages currently handed out, for tests and introspection.
    pub(crate) fn used_pages(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.chunks.iter().map(|(_, c)| c.used_pages).sum()
    }
}

// Per-thread cache: stacks of runs per power-of-two size class. The entry
// drop returns everything to the arena when the thread exits.

struct CacheEntry {
    arena: Arc<Arena>,
    shards: Vec<Vec<Run>>,
}

impl CacheEntry {
    fn shard_index(pages: usize) -> usize {
        pages.trailing_zeros() as usize
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        for shard in &mut self.shards {
            for run in shard.drain(..) {
                self.arena.free_locked(run);
            }
        }
    }
}

thread_local! {
    static TLS_CACHE: RefCell<Vec<CacheEntry>> = const { RefCell::new(Vec::new()) };
}

fn cache_take(arena: &Arc<Arena>, pages: usize) -> Option<Run> {
    TLS_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let entry = cache.iter_mut().find(|e| Arc::ptr_eq(&e.arena, arena))?;
        entry.shards[CacheEntry::shard_index(pages)].pop()
    })
}

fn cache_put(arena: &Arc<Arena>, run: Run) -> bool {
    TLS_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let entry = match cache.iter_mut().find(|e| Arc::ptr_eq(&e.arena, arena)) {
            Some(entry) => entry,
            None => {
                let shards = (0..=CacheEntry::shard_index(CACHE_MAX_PAGES))
                    .map(|_| Vec::new())
                    .collect();
                cache.push(CacheEntry {
                    arena: Arc::clone(arena),
                    shards,
                });
                cache.last_mut().unwrap()
            }
        };
        let shard = &mut entry.shards[CacheEntry::shard_index(run.pages)];
        if shard.len() >= CACHE_SHARD_CAP {
            return false;
        }
        shard.push(run);
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let arena = Arena::new(4); // 16-page chunks
        let run = arena.allocate(PAGE_SIZE).unwrap();
        assert_eq!(run.pages, 1);
        assert!(!run.ptr().is_null());
        assert_eq!(arena.used_pages(), 1);
        arena.free(run);
    }

    #[test]
    fn test_smallest_fit_and_split() {
        let arena = Arena::new(4);
        // Bypass the cache to observe arena bookkeeping directly.
        let a = arena.allocate_locked(2).unwrap();
        let b = arena.allocate_locked(4).unwrap();
        assert_eq!(a.page_off, 0);
        assert_eq!(b.page_off, 2);
        assert_eq!(arena.used_pages(), 6);
        arena.free_locked(a);
        // The freed two-page run is the smallest fit for a one-page request.
        let c = arena.allocate_locked(1).unwrap();
        assert_eq!(c.page_off, 0);
        arena.free_locked(b);
        arena.free_locked(c);
        assert_eq!(arena.used_pages(), 0);
    }

    #[test]
    fn test_merge_restores_full_run() {
        let arena = Arena::new(4);
        let a = arena.allocate_locked(4).unwrap();
        let b = arena.allocate_locked(4).unwrap();
        let c = arena.allocate_locked(8).unwrap();
        arena.free_locked(b);
        arena.free_locked(c);
        arena.free_locked(a);
        // All neighbors merged back: a full-chunk run must fit again.
        let full = arena.allocate_locked(16).unwrap();
        assert_eq!(full.page_off, 0);
        arena.free_locked(full);
    }

    #[test]
    fn test_second_chunk_when_first_is_full() {
        let arena = Arena::new(2); // 4-page chunks
        let a = arena.allocate_locked(4).unwrap();
        let b = arena.allocate_locked(4).unwrap();
        assert_ne!(a.chunk, b.chunk);
        arena.free_locked(a);
        arena.free_locked(b);
    }

    #[test]
    fn test_cache_round_trip() {
        let arena = Arena::new(4);
        let run = arena.allocate(PAGE_SIZE).unwrap();
        let ptr = run.ptr();
        arena.free(run);
        // Same thread gets the cached run back without touching the lock.
        let again = arena.allocate(PAGE_SIZE).unwrap();
        assert_eq!(again.ptr(), ptr);
        arena.free(again);
    }
}
