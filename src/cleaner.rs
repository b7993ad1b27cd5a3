//! Cleaner pool: background workers that release native resources.
//!
//! Freeing direct memory or closing kernel handles is kept off hot I/O
//! threads. Each event-loop thread gets a dedicated single-threaded cleaner
//! unless configured to share; external threads share a small pool
//! round-robin to cap thread counts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Policy knobs, mirrored from the `cleanerpool.*` runtime properties.
#[derive(Debug, Clone)]
pub struct CleanerPoolConfig {
    /// Shared cleaner count; 0 picks a size from available parallelism.
    pub pool_size: usize,
    /// Event-loop threads share the pool instead of getting dedicated cleaners.
    pub event_loop_uses_pool: bool,
    /// Request green threads where the platform offers them.
    pub use_green_threads: bool,
}

impl Default for CleanerPoolConfig {
    fn default() -> Self {
        CleanerPoolConfig {
            pool_size: 1,
            event_loop_uses_pool: false,
            use_green_threads: false,
        }
    }
}

/// Handle to one cleaner worker.
#[derive(Clone)]
pub struct Cleaner {
    tx: Sender<Job>,
}

impl Cleaner {
    fn spawn(name: String) -> Cleaner {
        let (tx, rx) = channel::<Job>();
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
            debug!(cleaner = %name, "cleaner exiting");
        });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn cleaner thread; jobs will run inline");
        }
        Cleaner { tx }
    }

    /// Submit a release job. Runs inline if the worker is gone.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(returned) = self.tx.send(Box::new(job)) {
            (returned.0)();
        }
    }
}

/// Pool assigning cleaners to requesting threads.
pub struct CleanerPool {
    shared: Vec<Cleaner>,
    next: AtomicUsize,
    event_loop_uses_pool: bool,
    dedicated: Mutex<HashMap<ThreadId, Cleaner>>,
}

impl CleanerPool {
    /// Build the pool. Workers spawn lazily for dedicated cleaners but
    /// eagerly for the shared set.
    pub fn new(config: &CleanerPoolConfig) -> Arc<CleanerPool> {
        if config.use_green_threads {
            // No green-thread facility on this platform; fall back quietly.
            debug!("green threads requested but unavailable; using platform threads");
        }
        let size = if config.pool_size == 0 {
            thread::available_parallelism()
                .map(|n| n.get().div_ceil(2))
                .unwrap_or(1)
        } else {
            config.pool_size
        };
        let shared = (0..size)
            .map(|i| Cleaner::spawn(format!("cleaner-{i}")))
            .collect();
        Arc::new(CleanerPool {
            shared,
            next: AtomicUsize::new(0),
            event_loop_uses_pool: config.event_loop_uses_pool,
            dedicated: Mutex::new(HashMap::new()),
        })
    }

    /// The cleaner serving the calling thread.
    ///
    /// Event-loop threads receive a dedicated single-threaded cleaner unless
    /// the pool policy says otherwise; every other thread shares the pool
    /// round-robin.
    pub fn cleaner(&self) -> Cleaner {
        if crate::executor::on_event_loop() && !self.event_loop_uses_pool {
            let id = thread::current().id();
            let mut dedicated = self.dedicated.lock().unwrap();
            return dedicated
                .entry(id)
                .or_insert_with(|| {
                    let name = thread::current()
                        .name()
                        .unwrap_or("loop")
                        .to_string();
                    Cleaner::spawn(format!("cleaner-{name}"))
                })
                .clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.shared.len();
        self.shared[i].clone()
    }

    /// Number of shared workers, for introspection.
    pub fn shared_size(&self) -> usize {
        self.shared.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_jobs_run() {
        let pool = CleanerPool::new(&CleanerPoolConfig::default());
        let (tx, rx) = mpsc::channel();
        let cleaner = pool.cleaner();
        cleaner.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn test_external_threads_share_round_robin() {
        let pool = CleanerPool::new(&CleanerPoolConfig {
            pool_size: 2,
            ..Default::default()
        });
        assert_eq!(pool.shared_size(), 2);
        // Two consecutive requests from a non-loop thread alternate workers.
        let (tx, rx) = mpsc::channel();
        for i in 0..2 {
            let tx = tx.clone();
            pool.cleaner().submit(move || tx.send(i).unwrap());
        }
        let mut got: Vec<i32> = (0..2)
            .map(|_| rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
    }

    #[test]
    fn test_auto_size_is_positive() {
        let pool = CleanerPool::new(&CleanerPoolConfig {
            pool_size: 0,
            ..Default::default()
        });
        assert!(pool.shared_size() >= 1);
    }
}
