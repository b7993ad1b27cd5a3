//! Single-assignment promises with listeners.
//!
//! A promise moves atomically from uncompleted to exactly one of success,
//! failure, or cancelled. Listeners fire in addition order on the promise's
//! executor; listeners added after completion fire immediately. Blocking on
//! a promise from inside an event loop would deadlock the loop, so it fails
//! fast with `BlockingOperation`.

use crate::error::{Error, Result, SharedError};
use crate::executor::{on_event_loop, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::warn;

/// Terminal state of a promise.
#[derive(Debug)]
pub enum Outcome<T> {
    /// Completed with a value.
    Success(T),
    /// Completed with a cause.
    Failure(SharedError),
    /// Cancelled before completion.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<SharedError> {
        match self {
            Outcome::Failure(e) => Some(Arc::clone(e)),
            _ => None,
        }
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Done(Arc<Outcome<T>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
    executor: Option<EventLoop>,
    void: bool,
    observed: AtomicBool,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.void || self.observed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(state) = self.state.get_mut() {
            if let State::Done(outcome) = state {
                if let Some(cause) = outcome.cause() {
                    warn!(%cause, "promise failed without an observer");
                }
            }
        }
    }
}

/// A single-assignment completion variable.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// A promise with no executor; listeners run on the completing thread.
    pub fn new() -> Promise<T> {
        Promise::build(None, false)
    }

    /// A promise whose listeners run on the given event loop.
    pub fn with_executor(executor: EventLoop) -> Promise<T> {
        Promise::build(Some(executor), false)
    }

    fn build(executor: Option<EventLoop>, void: bool) -> Promise<T> {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                done: Condvar::new(),
                executor,
                void,
                observed: AtomicBool::new(void),
            }),
        }
    }

    /// Complete successfully. Returns false if already terminal.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Complete with a failure cause. Returns false if already terminal.
    pub fn try_failure(&self, cause: Error) -> bool {
        self.complete(Outcome::Failure(Arc::new(cause)))
    }

    /// Complete with an already-shared cause. Returns false if already
    /// terminal.
    pub fn try_failure_shared(&self, cause: SharedError) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    /// Cancel. Distinguishable from failure; propagates to awaiters.
    /// Returns false if already terminal.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Done(Arc::new(outcome));
                    listeners
                }
            }
        };
        self.inner.done.notify_all();
        if !listeners.is_empty() {
            self.dispatch(listeners);
        }
        true
    }

    fn dispatch(&self, listeners: Vec<Listener<T>>) {
        self.inner.observed.store(true, Ordering::Release);
        let outcome = self.outcome_arc().expect("dispatch after completion");
        match &self.inner.executor {
            Some(executor) if !executor.in_event_loop() => {
                executor.execute(move || {
                    for listener in listeners {
                        listener(&outcome);
                    }
                });
            }
            _ => {
                for listener in listeners {
                    listener(&outcome);
                }
            }
        }
    }

    /// Register a listener. Fires immediately (on the executor) when the
    /// promise is already terminal. Void promises accept no listeners.
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome<T>) + Send + 'static) {
        if self.inner.void {
            warn!("listener added to a void promise; dropped");
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if let State::Pending(listeners) = &mut *state {
                listeners.push(Box::new(listener));
                return;
            }
        }
        self.dispatch(vec![Box::new(listener)]);
    }

    /// Whether the promise reached a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done(_))
    }

    /// Whether the promise completed successfully.
    pub fn is_success(&self) -> bool {
        self.outcome_arc().map_or(false, |o| o.is_success())
    }

    /// Whether the promise was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.outcome_arc()
            .map_or(false, |o| matches!(&*o, Outcome::Cancelled))
    }

    /// The failure cause, if the promise failed.
    pub fn cause(&self) -> Option<SharedError> {
        self.inner.observed.store(true, Ordering::Release);
        self.outcome_arc().and_then(|o| o.cause())
    }

    fn outcome_arc(&self) -> Option<Arc<Outcome<T>>> {
        match &*self.inner.state.lock().unwrap() {
            State::Done(outcome) => Some(Arc::clone(outcome)),
            State::Pending(_) => None,
        }
    }

    /// Block until terminal and return the outcome.
    ///
    /// Illegal from an event-loop thread: fails with `BlockingOperation`
    /// instead of deadlocking. Void promises never block.
    pub fn await_done(&self) -> Result<Arc<Outcome<T>>> {
        if self.inner.void {
            return Err(Error::IllegalState(
                "void promise has no observable outcome".into(),
            ));
        }
        if on_event_loop() {
            return Err(Error::BlockingOperation);
        }
        self.inner.observed.store(true, Ordering::Release);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let State::Done(outcome) = &*state {
                return Ok(Arc::clone(outcome));
            }
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Block until terminal; `Ok` on success, the cause on failure, and an
    /// `IllegalState` on cancellation.
    pub fn sync(&self) -> Result<()> {
        match &*self.await_done()? {
            Outcome::Success(_) => Ok(()),
            Outcome::Failure(cause) => Err(Error::IllegalState(format!(
                "promise failed: {cause}"
            ))),
            Outcome::Cancelled => Err(Error::IllegalState("promise was cancelled".into())),
        }
    }
}

impl Promise<()> {
    /// A void promise: completion is fire-and-forget, it accepts no
    /// listeners, and it never blocks.
    pub fn void() -> Promise<()> {
        Promise::build(None, true)
    }

    /// Whether this is a void promise.
    pub fn is_void(&self) -> bool {
        self.inner.void
    }
}

/// Aggregates N promises into one: the aggregate completes when all added
/// promises complete, failing with the first observed cause.
pub struct PromiseCombiner {
    shared: Arc<Mutex<CombinerState>>,
}

struct CombinerState {
    pending: usize,
    finished: bool,
    first_failure: Option<SharedError>,
    failures: usize,
    aggregate: Option<Promise<()>>,
}

impl Default for PromiseCombiner {
    fn default() -> Self {
        PromiseCombiner::new()
    }
}

impl PromiseCombiner {
    /// An empty combiner.
    pub fn new() -> PromiseCombiner {
        PromiseCombiner {
            shared: Arc::new(Mutex::new(CombinerState {
                pending: 0,
                finished: false,
                first_failure: None,
                failures: 0,
                aggregate: None,
            })),
        }
    }

    /// Track one more promise. Must happen before `finish`.
    pub fn add<T: Send + Sync + 'static>(&self, promise: &Promise<T>) {
        {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.finished, "add after finish");
            state.pending += 1;
        }
        let shared = Arc::clone(&self.shared);
        promise.add_listener(move |outcome| {
            let ready = {
                let mut state = shared.lock().unwrap();
                state.pending -= 1;
                match outcome {
                    Outcome::Success(_) => {}
                    Outcome::Failure(cause) => {
                        state.failures += 1;
                        if state.first_failure.is_none() {
                            state.first_failure = Some(Arc::clone(cause));
                        }
                    }
                    Outcome::Cancelled => {
                        state.failures += 1;
                        if state.first_failure.is_none() {
                            state.first_failure =
                                Some(Arc::new(Error::IllegalState("cancelled".into())));
                        }
                    }
                }
                if state.finished && state.pending == 0 {
                    state.aggregate.take()
                } else {
                    None
                }
            };
            if let Some(aggregate) = ready {
                Self::complete(&shared, &aggregate);
            }
        });
    }

    /// Arm the aggregate promise. Completes immediately when nothing is
    /// pending.
    pub fn finish(self, aggregate: Promise<()>) {
        let ready = {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.finished, "finish called twice");
            state.finished = true;
            if state.pending == 0 {
                None
            } else {
                state.aggregate = Some(aggregate.clone());
                Some(())
            }
        };
        if ready.is_none() {
            Self::complete(&self.shared, &aggregate);
        }
    }

    fn complete(shared: &Arc<Mutex<CombinerState>>, aggregate: &Promise<()>) {
        let failure = shared.lock().unwrap().first_failure.clone();
        match failure {
            Some(cause) => {
                aggregate.try_failure_shared(cause);
            }
            None => {
                aggregate.try_success(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_assignment() {
        let p: Promise<u32> = Promise::new();
        assert!(p.try_success(1));
        assert!(!p.try_success(2));
        assert!(!p.try_failure(Error::ClosedChannel));
        assert!(!p.cancel());
        assert!(p.is_success());
        match &*p.await_done().unwrap() {
            Outcome::Success(v) => assert_eq!(*v, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_listeners_fire_in_addition_order() {
        let p: Promise<()> = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            p.add_listener(move |_| order.lock().unwrap().push(i));
        }
        p.try_success(());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_late_listener_fires_immediately() {
        let p: Promise<u32> = Promise::new();
        p.try_success(9);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        p.add_listener(move |o| {
            if o.is_success() {
                seen2.store(1, Ordering::SeqCst);
            }
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_await_from_other_thread() {
        let p: Promise<u32> = Promise::new();
        let p2 = p.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            p2.try_success(5);
        });
        let outcome = p.await_done().unwrap();
        assert!(outcome.is_success());
        t.join().unwrap();
    }

    #[test]
    fn test_cancel_is_distinct_from_failure() {
        let p: Promise<()> = Promise::new();
        assert!(p.cancel());
        assert!(p.is_cancelled());
        assert!(!p.is_success());
        assert!(p.cause().is_none());
    }

    #[test]
    fn test_void_promise_accepts_no_listeners() {
        let p = Promise::void();
        assert!(p.is_void());
        p.add_listener(|_| panic!("listener on a void promise"));
        p.try_success(());
    }

    #[test]
    fn test_combiner_waits_for_all() {
        let a: Promise<()> = Promise::new();
        let b: Promise<()> = Promise::new();
        let combiner = PromiseCombiner::new();
        combiner.add(&a);
        combiner.add(&b);
        let aggregate: Promise<()> = Promise::new();
        combiner.finish(aggregate.clone());
        a.try_success(());
        assert!(!aggregate.is_done());
        b.try_success(());
        assert!(aggregate.is_success());
    }

    #[test]
    fn test_combiner_aggregates_failures() {
        let a: Promise<()> = Promise::new();
        let b: Promise<()> = Promise::new();
        let combiner = PromiseCombiner::new();
        combiner.add(&a);
        combiner.add(&b);
        let aggregate: Promise<()> = Promise::new();
        combiner.finish(aggregate.clone());
        a.try_failure(Error::ClosedChannel);
        b.try_success(());
        assert!(aggregate.is_done());
        assert!(aggregate.cause().is_some());
    }

    #[test]
    fn test_combiner_with_nothing_pending() {
        let combiner = PromiseCombiner::new();
        let aggregate: Promise<()> = Promise::new();
        combiner.finish(aggregate.clone());
        assert!(aggregate.is_success());
    }
}
