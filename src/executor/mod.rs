//! Event loops and loop groups.
//!
//! Each loop owns a thread, an MPSC task queue, a deadline-ordered
//! scheduled-task queue, the set of registered channels, and one I/O
//! backend. One turn runs due scheduled tasks, polls the backend with a
//! timeout bounded by the next deadline, dispatches ready events, and drains
//! the task queue under a budget of roughly half the turn. All I/O and all
//! handler callbacks of a channel run on its loop's thread; cross-thread
//! submissions enqueue a task and wake the backend.

use crate::buffer::Allocator;
use crate::channel::ChannelCore;
use crate::cleaner::CleanerPool;
use crate::config::Runtime;
use crate::error::{Error, Result};
use crate::io::{Backend, BackendKind, IoBackend, IoEvent, IoWaker};
use crate::promise::{Promise, PromiseCombiner};
use slab::Slab;
use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest a loop blocks in the backend before re-checking state.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Tasks between deadline checks while draining the queue.
const TASKS_PER_BUDGET_CHECK: usize = 64;

/// Share of a turn spent on tasks: equal split with I/O.
const MIN_TASK_BUDGET: Duration = Duration::from_millis(1);

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type LocalTask = Box<dyn FnOnce() + 'static>;

const STATE_RUNNING: u8 = 0;
const STATE_SHUTTING_DOWN: u8 = 1;
const STATE_TERMINATED: u8 = 2;
const STATE_DETACHED: u8 = 3;

static NEXT_LOOP_SERIAL: AtomicU64 = AtomicU64::new(1);
static NEXT_GROUP: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT: RefCell<Option<(EventLoop, LoopRef)>> = const { RefCell::new(None) };
}

/// Whether the calling thread is an event-loop thread.
pub fn on_event_loop() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// The event loop of the calling thread, if any.
pub fn current_event_loop() -> Option<EventLoop> {
    CURRENT.with(|current| current.borrow().as_ref().map(|(handle, _)| handle.clone()))
}

/// The loop-local context of the calling thread, if any.
pub(crate) fn current_loop_ctx() -> Option<LoopRef> {
    CURRENT.with(|current| current.borrow().as_ref().map(|(_, ctx)| Rc::clone(ctx)))
}

struct ShutdownRequest {
    quiet: Duration,
    hard_deadline: Instant,
}

struct LoopShared {
    name: String,
    serial: u64,
    state: AtomicU8,
    queue: Mutex<VecDeque<Task>>,
    waker: OnceLock<IoWaker>,
    termination: Promise<()>,
    shutdown: Mutex<Option<ShutdownRequest>>,
}

/// Handle to one event loop. Cloneable and Send.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &Self) -> bool {
        self.shared.serial == other.shared.serial
    }
}
impl Eq for EventLoop {}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl EventLoop {
    /// Spawn a loop thread with its own backend instance.
    pub fn spawn(
        name: String,
        kind: BackendKind,
        allocator: Allocator,
        max_events: usize,
        cleaners: Option<Arc<CleanerPool>>,
    ) -> Result<EventLoop> {
        let backend = Backend::new(kind, max_events)?;
        let shared = Arc::new(LoopShared {
            name: name.clone(),
            serial: NEXT_LOOP_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(STATE_RUNNING),
            queue: Mutex::new(VecDeque::new()),
            waker: OnceLock::new(),
            termination: Promise::new(),
            shutdown: Mutex::new(None),
        });
        shared
            .waker
            .set(backend.waker())
            .ok()
            .expect("waker set once");
        let handle = EventLoop {
            shared: Arc::clone(&shared),
        };
        let thread_handle = handle.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(thread_handle, backend, allocator, cleaners))
            .map_err(|e| Error::IllegalState(format!("cannot spawn loop thread: {e}")))?;
        Ok(handle)
    }

    /// A handle with no thread behind it; submissions run inline. Tests use
    /// this where loop affinity does not matter.
    #[doc(hidden)]
    pub fn detached(name: &str) -> EventLoop {
        EventLoop {
            shared: Arc::new(LoopShared {
                name: name.to_string(),
                serial: NEXT_LOOP_SERIAL.fetch_add(1, Ordering::Relaxed),
                state: AtomicU8::new(STATE_DETACHED),
                queue: Mutex::new(VecDeque::new()),
                waker: OnceLock::new(),
                termination: Promise::new(),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// The loop thread's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|(handle, _)| handle.shared.serial == self.shared.serial)
                .unwrap_or(false)
        })
    }

    /// Submit a task. Tasks submitted by one thread run in submission
    /// order; a rejected task (loop shutting down or detached) runs inline
    /// on the caller.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        if let Err(rejected) = self.try_execute(Box::new(f)) {
            rejected();
        }
    }

    /// Submit a task, handing it back when the loop no longer accepts work.
    pub(crate) fn try_execute(&self, task: Task) -> std::result::Result<(), Task> {
        if self.shared.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(task);
        }
        self.shared.queue.lock().unwrap().push_back(task);
        if let Some(waker) = self.shared.waker.get() {
            waker.wake();
        }
        Ok(())
    }

    /// Schedule a task after `delay`. The handle cancels it; a task that
    /// already started runs to completion.
    pub fn schedule(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> ScheduledHandle {
        let handle = ScheduledHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let deadline = Instant::now() + delay;
        let cancelled = Arc::clone(&handle.cancelled);
        let push = move || match current_loop_ctx() {
            Some(ctx) => ctx
                .borrow_mut()
                .push_scheduled(deadline, Box::new(f), cancelled),
            None => {
                warn!("scheduled task dropped: no event loop on this thread");
            }
        };
        if self.in_event_loop() {
            push();
        } else {
            self.execute(push);
        }
        handle
    }

    /// Begin graceful shutdown: no new tasks, drain within the quiet
    /// window, close registered channels, exit the thread. Returns the
    /// termination future; repeated calls return the same one.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> Promise<()> {
        let state = &self.shared.state;
        if state
            .compare_exchange(
                STATE_RUNNING,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            *self.shared.shutdown.lock().unwrap() = Some(ShutdownRequest {
                quiet,
                hard_deadline: Instant::now() + timeout,
            });
            if let Some(waker) = self.shared.waker.get() {
                waker.wake();
            }
        } else if state.load(Ordering::Acquire) == STATE_DETACHED {
            self.shared.termination.try_success(());
        }
        self.shared.termination.clone()
    }

    /// Whether shutdown was requested or completed.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) != STATE_RUNNING
    }

    /// Promise completing when the loop thread has exited.
    pub fn termination_future(&self) -> Promise<()> {
        self.shared.termination.clone()
    }
}

/// Cancellation handle for a scheduled task.
#[derive(Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    /// Prevent the task from starting. A task already running finishes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: LocalTask,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; earliest deadline must sort greatest.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Loop-thread state shared between the turn driver and the channels.
pub(crate) type LoopRef = Rc<RefCell<LoopCtx>>;

pub(crate) struct LoopCtx {
    pub(crate) backend: Backend,
    pub(crate) allocator: Allocator,
    channels: Slab<Rc<ChannelCore>>,
    local: VecDeque<LocalTask>,
    scheduled: BinaryHeap<Scheduled>,
    sched_seq: u64,
    handle: EventLoop,
}

impl LoopCtx {
    /// The loop's public handle.
    pub(crate) fn handle(&self) -> EventLoop {
        self.handle.clone()
    }

    /// Register a channel, returning its registration id.
    pub(crate) fn insert_channel(&mut self, core: Rc<ChannelCore>) -> usize {
        self.channels.insert(core)
    }

    /// Drop a channel's registration.
    pub(crate) fn remove_channel(&mut self, id: usize) {
        if self.channels.contains(id) {
            self.channels.remove(id);
        }
    }

    /// Look up a registered channel, validating its serial against handle
    /// reuse of slab slots.
    pub(crate) fn channel(&self, id: usize, serial: u64) -> Option<Rc<ChannelCore>> {
        self.channels
            .get(id)
            .filter(|core| core.serial() == serial)
            .cloned()
    }

    /// Queue a non-Send task on this loop; runs in the same drain as
    /// cross-thread tasks.
    pub(crate) fn execute_local(&mut self, task: LocalTask) {
        self.local.push_back(task);
    }

    fn push_scheduled(&mut self, deadline: Instant, task: LocalTask, cancelled: Arc<AtomicBool>) {
        let seq = self.sched_seq;
        self.sched_seq += 1;
        self.scheduled.push(Scheduled {
            deadline,
            seq,
            task,
            cancelled,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.peek().map(|s| s.deadline)
    }

    fn registered_channels(&self) -> Vec<Rc<ChannelCore>> {
        self.channels.iter().map(|(_, core)| Rc::clone(core)).collect()
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn run_loop(
    handle: EventLoop,
    backend: Backend,
    allocator: Allocator,
    cleaners: Option<Arc<CleanerPool>>,
) {
    let shared = Arc::clone(&handle.shared);
    let ctx: LoopRef = Rc::new(RefCell::new(LoopCtx {
        backend,
        allocator,
        channels: Slab::new(),
        local: VecDeque::new(),
        scheduled: BinaryHeap::new(),
        sched_seq: 0,
        handle: handle.clone(),
    }));
    CURRENT.with(|current| {
        *current.borrow_mut() = Some((handle.clone(), Rc::clone(&ctx)));
    });
    // Bind this thread's cleaner up front so releases never race the pool.
    if let Some(pool) = &cleaners {
        let _ = pool.cleaner();
    }
    info!(name = %shared.name, "event loop started");

    let mut events: Vec<IoEvent> = Vec::new();
    let mut last_activity = Instant::now();
    loop {
        let now = Instant::now();
        if run_due_scheduled(&ctx, now) {
            last_activity = now;
        }

        let timeout = wait_timeout(&shared, &ctx, now);
        events.clear();
        let io_started = Instant::now();
        let wait_result = ctx.borrow_mut().backend.wait(timeout, &mut events);
        if let Err(e) = wait_result {
            error!(name = %shared.name, error = %e, "backend wait failed");
            break;
        }
        let io_time = io_started.elapsed();

        if !events.is_empty() {
            last_activity = Instant::now();
        }
        for event in &events {
            let core = ctx.borrow().channels.get(event.id).cloned();
            match core {
                Some(core) => core.on_io_event(event.payload),
                None => {
                    debug!(id = event.id, "event for unknown registration");
                }
            }
        }

        if drain_tasks(&shared, &ctx, io_time.max(MIN_TASK_BUDGET)) {
            last_activity = Instant::now();
        }

        if shared.state.load(Ordering::Acquire) == STATE_SHUTTING_DOWN
            && shutdown_ready(&shared, &ctx, last_activity)
        {
            break;
        }
    }

    terminate(&shared, &ctx);
    CURRENT.with(|current| {
        *current.borrow_mut() = None;
    });
    shared.state.store(STATE_TERMINATED, Ordering::Release);
    shared.termination.try_success(());
    info!(name = %shared.name, "event loop terminated");
}

/// Run scheduled tasks whose deadline passed. Returns whether any ran.
fn run_due_scheduled(ctx: &LoopRef, now: Instant) -> bool {
    let mut ran = false;
    loop {
        let due = {
            let mut ctx = ctx.borrow_mut();
            match ctx.scheduled.peek() {
                Some(next) if next.deadline <= now => ctx.scheduled.pop(),
                _ => None,
            }
        };
        match due {
            Some(scheduled) => {
                if !scheduled.cancelled.load(Ordering::Acquire) {
                    (scheduled.task)();
                    ran = true;
                }
            }
            None => break,
        }
    }
    ran
}

fn wait_timeout(shared: &Arc<LoopShared>, ctx: &LoopRef, now: Instant) -> Option<Duration> {
    let tasks_pending =
        !ctx.borrow().local.is_empty() || !shared.queue.lock().unwrap().is_empty();
    if tasks_pending {
        return Some(Duration::ZERO);
    }
    if shared.state.load(Ordering::Acquire) != STATE_RUNNING {
        // Quiet-period countdown: short waits keep the loop responsive
        // without spinning.
        return Some(Duration::from_millis(10));
    }
    match ctx.borrow().next_deadline() {
        Some(deadline) => Some(deadline.saturating_duration_since(now).min(MAX_WAIT)),
        None => Some(MAX_WAIT),
    }
}

/// Drain local and cross-thread tasks for up to `budget`. Returns whether
/// any task ran.
fn drain_tasks(shared: &Arc<LoopShared>, ctx: &LoopRef, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    let mut ran = false;
    let mut since_check = 0usize;
    loop {
        let task: Option<LocalTask> = {
            let local = ctx.borrow_mut().local.pop_front();
            match local {
                Some(task) => Some(task),
                None => shared
                    .queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .map(|task| -> LocalTask { task }),
            }
        };
        match task {
            Some(task) => {
                task();
                ran = true;
                since_check += 1;
                if since_check >= TASKS_PER_BUDGET_CHECK {
                    since_check = 0;
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
            None => break,
        }
    }
    ran
}

fn shutdown_ready(shared: &Arc<LoopShared>, ctx: &LoopRef, last_activity: Instant) -> bool {
    let request = shared.shutdown.lock().unwrap();
    let request = match &*request {
        Some(request) => request,
        None => return true,
    };
    let now = Instant::now();
    if now >= request.hard_deadline {
        return true;
    }
    let queues_empty =
        ctx.borrow().local.is_empty() && shared.queue.lock().unwrap().is_empty();
    queues_empty && now.saturating_duration_since(last_activity) >= request.quiet
}

/// Close every registered channel and drain until they are gone or the
/// grace window lapses.
fn terminate(shared: &Arc<LoopShared>, ctx: &LoopRef) {
    let cores = ctx.borrow().registered_channels();
    let open = cores.len();
    if open > 0 {
        debug!(name = %shared.name, open, "closing channels on shutdown");
    }
    for core in cores {
        core.unsafe_close(Promise::new());
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events: Vec<IoEvent> = Vec::new();
    while ctx.borrow().channel_count() > 0 && Instant::now() < deadline {
        events.clear();
        let wait = ctx
            .borrow_mut()
            .backend
            .wait(Some(Duration::from_millis(20)), &mut events);
        if wait.is_err() {
            break;
        }
        for event in &events {
            let core = ctx.borrow().channels.get(event.id).cloned();
            if let Some(core) = core {
                core.on_io_event(event.payload);
            }
        }
        drain_tasks(shared, ctx, MIN_TASK_BUDGET);
    }
    // Anything still open gets torn down without draining.
    for core in ctx.borrow().registered_channels() {
        core.unsafe_close_forced(Arc::new(Error::ShuttingDown));
    }
    drain_tasks(shared, ctx, MIN_TASK_BUDGET);
}

struct GroupInner {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

/// A fixed set of event loops with round-robin channel assignment.
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl EventLoopGroup {
    /// Spawn `n` loops (0 picks the available parallelism) on the given
    /// backend.
    pub fn new(n: usize, kind: BackendKind, runtime: &Runtime) -> Result<EventLoopGroup> {
        let n = if n == 0 {
            thread::available_parallelism().map(|p| p.get()).unwrap_or(1)
        } else {
            n
        };
        let group = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
        let mut loops = Vec::with_capacity(n);
        for i in 0..n {
            loops.push(EventLoop::spawn(
                format!("loop-{group}-{i}"),
                kind,
                runtime.allocator().clone(),
                runtime.config().max_events_per_poll,
                Some(Arc::clone(runtime.cleaners())),
            )?);
        }
        Ok(EventLoopGroup {
            inner: Arc::new(GroupInner {
                loops,
                next: AtomicUsize::new(0),
            }),
        })
    }

    /// The next loop, round-robin.
    pub fn next(&self) -> &EventLoop {
        let i = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.loops.len();
        &self.inner.loops[i]
    }

    /// All loops in the group.
    pub fn loops(&self) -> &[EventLoop] {
        &self.inner.loops
    }

    /// Gracefully shut down every loop; completes when all terminated.
    pub fn shutdown_gracefully(&self, quiet: Duration, timeout: Duration) -> Promise<()> {
        let combiner = PromiseCombiner::new();
        for event_loop in &self.inner.loops {
            combiner.add(&event_loop.shutdown_gracefully(quiet, timeout));
        }
        let aggregate = Promise::new();
        combiner.finish(aggregate.clone());
        aggregate
    }

    /// `shutdown_gracefully` with the default quiet period and timeout.
    pub fn shutdown(&self) -> Promise<()> {
        self.shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Runtime, RuntimeConfig};
    use std::sync::mpsc;

    fn test_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::for_tests())
    }

    fn one_loop(runtime: &Runtime) -> EventLoopGroup {
        EventLoopGroup::new(1, BackendKind::Poll, runtime).unwrap()
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            group.next().execute(move || {
                tx.send(i).unwrap();
            });
        }
        let got: Vec<i32> = (0..100).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_in_event_loop_detection() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let event_loop = group.next().clone();
        let probe = event_loop.clone();
        let (tx, rx) = mpsc::channel();
        assert!(!event_loop.in_event_loop());
        event_loop.execute(move || {
            tx.send((probe.in_event_loop(), on_event_loop())).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), (true, true));
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_scheduled_task_fires_after_deadline() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        group.next().schedule(Duration::from_millis(50), move || {
            tx.send(Instant::now()).unwrap();
        });
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(started) >= Duration::from_millis(50));
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_cancelled_task_does_not_run() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = group.next().schedule(Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        });
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_scheduled_ordering_by_deadline() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let (tx, rx) = mpsc::channel();
        let event_loop = group.next().clone();
        let tx_b = tx.clone();
        event_loop.schedule(Duration::from_millis(80), move || {
            tx_b.send("late").unwrap();
        });
        event_loop.schedule(Duration::from_millis(20), move || {
            tx.send("early").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let event_loop = group.next().clone();
        group.shutdown().sync().unwrap();
        assert!(event_loop.is_shutting_down());
        // Rejected tasks run inline on the caller.
        let (tx, rx) = mpsc::channel();
        event_loop.execute(move || {
            tx.send(thread::current().id()).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), thread::current().id());
    }

    #[test]
    fn test_await_from_loop_fails_fast() {
        let runtime = test_runtime();
        let group = one_loop(&runtime);
        let (tx, rx) = mpsc::channel();
        group.next().execute(move || {
            let promise: Promise<()> = Promise::new();
            tx.send(matches!(
                promise.await_done(),
                Err(Error::BlockingOperation)
            ))
            .unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        group.shutdown().sync().unwrap();
    }

    #[test]
    fn test_round_robin_assignment() {
        let runtime = test_runtime();
        let group = EventLoopGroup::new(3, BackendKind::Poll, &runtime).unwrap();
        let a = group.next().name().to_string();
        let b = group.next().name().to_string();
        let c = group.next().name().to_string();
        let d = group.next().name().to_string();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
        group.shutdown().sync().unwrap();
    }
}
