//! Adaptive receive-buffer sizing.
//!
//! Guesses the size of the next read buffer from observed read sizes over a
//! size table: small steps of 16 bytes up to 512, then powers of two. A read
//! that fills its buffer grows the guess immediately; two consecutive reads
//! below the next-smaller slot shrink it. A per-turn read budget preserves
//! fairness across channels on the loop.

use crate::channel::config::RecvAllocatorSpec;

/// Table index step when growing.
const INDEX_INCREMENT: usize = 4;
/// Table index step when shrinking.
const INDEX_DECREMENT: usize = 1;

fn size_table() -> &'static [usize] {
    // 16, 32, .. 512, then 1024, 2048, .. 1 MiB.
    static TABLE: std::sync::OnceLock<Vec<usize>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Vec<usize> = (1..=32).map(|i| i * 16).collect();
        let mut size = 1024usize;
        while size <= 1024 * 1024 {
            table.push(size);
            size <<= 1;
        }
        table
    })
}

fn index_at_or_above(size: usize) -> usize {
    let table = size_table();
    table
        .iter()
        .position(|&s| s >= size)
        .unwrap_or(table.len() - 1)
}

fn index_at_or_below(size: usize) -> usize {
    let table = size_table();
    match table.iter().rposition(|&s| s <= size) {
        Some(i) => i,
        None => 0,
    }
}

/// Per-channel adaptive sizing state.
pub(crate) struct AdaptiveRecv {
    min_index: usize,
    max_index: usize,
    index: usize,
    next_size: usize,
    shrink_pending: bool,
    /// Reads performed in the current event-loop turn.
    reads_this_turn: usize,
}

impl AdaptiveRecv {
    pub(crate) fn new(spec: RecvAllocatorSpec) -> AdaptiveRecv {
        let min_index = index_at_or_above(spec.minimum);
        let max_index = index_at_or_below(spec.maximum).max(min_index);
        let index = index_at_or_above(spec.initial).clamp(min_index, max_index);
        AdaptiveRecv {
            min_index,
            max_index,
            index,
            next_size: size_table()[index],
            shrink_pending: false,
            reads_this_turn: 0,
        }
    }

    /// The size to allocate for the next read.
    pub(crate) fn next_size(&self) -> usize {
        self.next_size
    }

    /// Record a completed read of `actual` bytes.
    pub(crate) fn record(&mut self, actual: usize) {
        self.reads_this_turn += 1;
        let table = size_table();
        let shrink_slot = self.index.saturating_sub(INDEX_DECREMENT).max(self.min_index);
        if actual <= table[shrink_slot] {
            if self.shrink_pending {
                self.index = shrink_slot;
                self.next_size = table[self.index];
                self.shrink_pending = false;
            } else {
                self.shrink_pending = true;
            }
        } else {
            self.shrink_pending = false;
            if actual >= self.next_size {
                self.index = (self.index + INDEX_INCREMENT).min(self.max_index);
                self.next_size = table[self.index];
            }
        }
    }

    /// Whether another read may run this turn, given the configured budget.
    pub(crate) fn continue_reading(&self, max_messages: usize, last_read_filled: bool) -> bool {
        last_read_filled && self.reads_this_turn < max_messages
    }

    /// Reset the per-turn read counter.
    pub(crate) fn start_turn(&mut self) {
        self.reads_this_turn = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv() -> AdaptiveRecv {
        AdaptiveRecv::new(RecvAllocatorSpec::default())
    }

    #[test]
    fn test_initial_guess() {
        assert_eq!(recv().next_size(), 2048);
    }

    #[test]
    fn test_full_read_grows_immediately() {
        let mut r = recv();
        let before = r.next_size();
        r.record(before);
        assert!(r.next_size() > before);
    }

    #[test]
    fn test_shrinks_after_two_small_reads() {
        let mut r = recv();
        let before = r.next_size();
        r.record(16);
        assert_eq!(r.next_size(), before, "one small read must not shrink");
        r.record(16);
        assert!(r.next_size() < before, "two consecutive small reads shrink");
    }

    #[test]
    fn test_large_read_between_small_ones_resets_shrink() {
        let mut r = recv();
        let before = r.next_size();
        r.record(16);
        r.record(before - 1); // not small, not full
        r.record(16);
        assert_eq!(r.next_size(), before);
    }

    #[test]
    fn test_respects_bounds() {
        let mut r = AdaptiveRecv::new(RecvAllocatorSpec {
            minimum: 64,
            initial: 64,
            maximum: 256,
        });
        for _ in 0..16 {
            let size = r.next_size();
            r.record(size);
        }
        assert!(r.next_size() <= 256);
        for _ in 0..32 {
            r.record(1);
        }
        assert!(r.next_size() >= 64);
    }

    #[test]
    fn test_read_budget() {
        let mut r = recv();
        r.start_turn();
        r.record(r.next_size());
        r.record(r.next_size());
        assert!(r.continue_reading(16, true));
        assert!(!r.continue_reading(2, true));
        assert!(!r.continue_reading(16, false));
    }
}
