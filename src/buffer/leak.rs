//! Sampled leak detection for reference-counted buffers.
//!
//! A fraction of allocations gets a tracker attached to the buffer's root
//! memory. If the root is dropped while its reference count is still
//! nonzero, the buffer was abandoned without release: the detector logs the
//! acquisition record and bumps a counter that tests can read.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Sampling interval for `Simple` and `Advanced` levels: 1 in N allocations.
const SAMPLE_INTERVAL: usize = 128;

/// How many touch records a tracker keeps before dropping the oldest.
const MAX_RECORDS: usize = 4;

/// Leak detection level, ordered by cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakLevel {
    /// No tracking at all.
    Disabled,
    /// Sample a fraction of allocations, report leaks without touch records.
    #[default]
    Simple,
    /// Sampled, with touch records along the buffer's path.
    Advanced,
    /// Track every allocation, with touch records.
    Paranoid,
}

impl LeakLevel {
    /// Parse the `leakDetection.level` property value.
    pub fn parse(s: &str) -> Option<LeakLevel> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Some(LeakLevel::Disabled),
            "simple" => Some(LeakLevel::Simple),
            "advanced" => Some(LeakLevel::Advanced),
            "paranoid" => Some(LeakLevel::Paranoid),
            _ => None,
        }
    }
}

/// Process-level leak detector, shared by one allocator.
pub struct LeakDetector {
    level: LeakLevel,
    allocations: AtomicUsize,
    leaked: AtomicUsize,
}

impl LeakDetector {
    /// Create a detector at the given level.
    pub fn new(level: LeakLevel) -> Arc<Self> {
        Arc::new(LeakDetector {
            level,
            allocations: AtomicUsize::new(0),
            leaked: AtomicUsize::new(0),
        })
    }

    /// The configured level.
    pub fn level(&self) -> LeakLevel {
        self.level
    }

    /// Number of leaks reported so far.
    pub fn leaked(&self) -> usize {
        self.leaked.load(Ordering::Acquire)
    }

    /// Decide whether to track the next allocation.
    ///
    /// Returns a tracker to attach to the buffer's root, or `None` when this
    /// allocation is not sampled.
    pub fn track(self: &Arc<Self>, hint: &'static str) -> Option<LeakTracker> {
        let sample = match self.level {
            LeakLevel::Disabled => false,
            LeakLevel::Paranoid => true,
            LeakLevel::Simple | LeakLevel::Advanced => {
                self.allocations.fetch_add(1, Ordering::Relaxed) % SAMPLE_INTERVAL == 0
            }
        };
        if !sample {
            return None;
        }
        Some(LeakTracker {
            detector: Arc::clone(self),
            acquired_at: hint,
            records: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }
}

/// Tracker attached to a sampled buffer's root memory.
pub struct LeakTracker {
    detector: Arc<LeakDetector>,
    acquired_at: &'static str,
    records: Mutex<Vec<String>>,
    disposed: AtomicBool,
}

impl LeakTracker {
    /// Record a point the buffer passed through (`Advanced` and up).
    pub fn touch(&self, hint: &str) {
        if !matches!(
            self.detector.level,
            LeakLevel::Advanced | LeakLevel::Paranoid
        ) {
            return;
        }
        let mut records = self.records.lock().unwrap();
        if records.len() == MAX_RECORDS {
            records.remove(0);
        }
        records.push(hint.to_string());
    }

    /// Mark the buffer as properly released; the tracker stays silent.
    pub fn close(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Report a leak if the buffer was never released.
    ///
    /// Called from the root's drop path with the count observed there.
    pub fn report_if_leaked(&self, remaining: usize) {
        if self.disposed.load(Ordering::Acquire) || remaining == 0 {
            return;
        }
        let records = self.records.lock().unwrap();
        error!(
            acquired_at = self.acquired_at,
            remaining,
            path = ?*records,
            "buffer leaked: dropped without reaching reference count 0"
        );
        self.detector.leaked.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LeakLevel::parse("simple"), Some(LeakLevel::Simple));
        assert_eq!(LeakLevel::parse("PARANOID"), Some(LeakLevel::Paranoid));
        assert_eq!(LeakLevel::parse("bogus"), None);
    }

    #[test]
    fn test_paranoid_tracks_everything() {
        let detector = LeakDetector::new(LeakLevel::Paranoid);
        for _ in 0..16 {
            assert!(detector.track("test").is_some());
        }
    }

    #[test]
    fn test_disabled_tracks_nothing() {
        let detector = LeakDetector::new(LeakLevel::Disabled);
        for _ in 0..16 {
            assert!(detector.track("test").is_none());
        }
    }

    #[test]
    fn test_leak_reported_once() {
        let detector = LeakDetector::new(LeakLevel::Paranoid);
        let tracker = detector.track("test").unwrap();
        tracker.touch("read");
        tracker.report_if_leaked(1);
        assert_eq!(detector.leaked(), 1);
    }

    #[test]
    fn test_closed_tracker_is_silent() {
        let detector = LeakDetector::new(LeakLevel::Paranoid);
        let tracker = detector.track("test").unwrap();
        tracker.close();
        tracker.report_if_leaked(1);
        assert_eq!(detector.leaked(), 0);
    }
}
