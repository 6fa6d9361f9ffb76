//! The deferred core: lifecycle state machine, callback drain loop,
//! continuation protocol and blocking joins.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::chain::{Chain, Link, SuccessFn};
use crate::failure::{Failure, JoinError};
use crate::outcome::{downcast, Outcome, Reply, Value};

/// No result has been posted yet.
const PENDING: usize = 0;

/// A thread owns the deferred and is draining its callback chain.
const RUNNING: usize = 1;

/// The chain is suspended, waiting on an inner deferred.
const PAUSED: usize = 2;

/// The chain has drained; the carried outcome is terminal.
const DONE: usize = 3;

fn state_name(state: usize) -> &'static str {
    match state {
        PENDING => "pending",
        RUNNING => "running",
        PAUSED => "paused",
        DONE => "done",
        _ => "corrupt",
    }
}

/// Residual wait below which a timed join is deemed expired.
const MIN_WAIT: Duration = Duration::from_nanos(100);

/// Timeouts beyond this are accepted, but almost certainly a bug.
const ONE_YEAR_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// A thread-safe asynchronous result with a dynamic chain of
/// transformations.
///
/// Transformations ("links") are appended in pairs, one for the
/// success path and one for the error path. They run in append order
/// once a result is posted with [`complete`](Deferred::complete). Appending
/// to an already-completed deferred runs the new links immediately on
/// the appending thread. A link that returns another deferred suspends
/// the chain until that inner deferred settles, and its outcome is
/// inlined transparently.
///
/// `Deferred` is a cheap clonable handle; clones observe the same
/// underlying chain and result. The crate never creates threads: links
/// execute on whichever thread delivers a result.
pub struct Deferred {
    inner: Arc<Inner>,
}

struct Inner {
    /// Lifecycle tag. Conditional transitions go through
    /// `compare_exchange`; this word is the synchronization point that
    /// publishes `result` between threads.
    state: AtomicUsize,

    /// Registered pairs plus their window indices. The mutex also
    /// serializes appends against the drain loop's pops and against the
    /// terminal-state store, so neither side can terminate or enqueue
    /// blindly.
    chain: Mutex<Chain>,

    /// The carried outcome. Taken and stored only by the thread that
    /// owns the RUNNING state (including a thread that has just stolen
    /// DONE -> RUNNING).
    result: AtomicCell<Option<Outcome>>,
}

impl Deferred {
    /// Creates a deferred whose result has not been posted yet.
    pub fn new() -> Deferred {
        Deferred {
            inner: Arc::new(Inner {
                state: AtomicUsize::new(PENDING),
                chain: Mutex::new(Chain::new()),
                result: AtomicCell::new(None),
            }),
        }
    }

    /// Creates an already-completed deferred carrying `value`.
    ///
    /// Links appended later run immediately on the appending thread.
    pub fn of_value<T: Any + Send + Sync>(value: T) -> Deferred {
        Deferred::settled(Ok(Arc::new(value)))
    }

    /// Creates an already-completed deferred carrying a failure.
    pub fn of_error(failure: impl Into<Failure>) -> Deferred {
        Deferred::settled(Err(failure.into()))
    }

    fn settled(outcome: Outcome) -> Deferred {
        Deferred {
            inner: Arc::new(Inner {
                state: AtomicUsize::new(DONE),
                chain: Mutex::new(Chain::new()),
                result: AtomicCell::new(Some(outcome)),
            }),
        }
    }

    /// Posts the result and drains the chain on the calling thread.
    ///
    /// The reply may be a settled outcome, or another deferred, in
    /// which case this deferred pauses, before any of its links run,
    /// until the inner one settles.
    ///
    /// # Panics
    ///
    /// Panics when called a second time, or when `reply` is this
    /// deferred itself.
    pub fn complete(&self, reply: impl Into<Reply>) {
        let reply = reply.into();
        if let Err(actual) =
            self.inner
                .state
                .compare_exchange(PENDING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            panic!(
                "complete called on a deferred that is already {}",
                state_name(actual)
            );
        }
        debug!("{:?}: completing with {:?}", self, reply);
        if self.settle(reply) {
            self.run();
        }
    }

    /// Appends a success-path transformation; failures pass through to
    /// the next pair untouched.
    ///
    /// The carried value is handed to `f` as an `Arc<T>`; expecting the
    /// wrong type is a programming error.
    pub fn on_success<T, F>(&self, f: F) -> &Self
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> Reply + Send + 'static,
    {
        self.push(Link::Callbacks {
            ok: Some(success_fn::<T, F>(f)),
            err: None,
        });
        self
    }

    /// Appends an error-path transformation; successes pass through to
    /// the next pair untouched. Returning a non-failure reply moves the
    /// chain back onto the success path.
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Failure) -> Reply + Send + 'static,
    {
        self.push(Link::Callbacks {
            ok: None,
            err: Some(Box::new(f)),
        });
        self
    }

    /// Appends a transformation that runs on whichever path the chain
    /// is on when the outcome reaches it.
    pub fn on_both<F>(&self, f: F) -> &Self
    where
        F: FnOnce(Outcome) -> Reply + Send + 'static,
    {
        self.push(Link::Both(Box::new(f)));
        self
    }

    /// Appends independent success and error transformations as one
    /// pair.
    pub fn add_callbacks<T, F, G>(&self, on_success: F, on_error: G) -> &Self
    where
        T: Any + Send + Sync,
        F: FnOnce(Arc<T>) -> Reply + Send + 'static,
        G: FnOnce(Failure) -> Reply + Send + 'static,
    {
        self.push(Link::Callbacks {
            ok: Some(success_fn::<T, F>(on_success)),
            err: Some(Box::new(on_error)),
        });
        self
    }

    /// Appends a link that completes `other` with the outcome flowing
    /// through this deferred, leaving the outcome itself unchanged.
    ///
    /// # Panics
    ///
    /// Panics when `other` is this deferred.
    pub fn chain(&self, other: &Deferred) -> &Self {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            panic!("a deferred cannot be chained to itself");
        }
        let target = other.clone();
        self.on_both(move |outcome: Outcome| {
            target.complete(Reply::Settled(outcome.clone()));
            Reply::Settled(outcome)
        })
    }

    /// Multiplexes `children` into one deferred that completes, once
    /// every child has, with the `Vec<Outcome>` of their results in
    /// completion order. If any child failed, the parent carries a
    /// [`Failure::Grouped`] holding the full outcome list and the first
    /// failure.
    pub fn group(children: Vec<Deferred>) -> Deferred {
        crate::group::demux(children, false)
    }

    /// As [`group`](Deferred::group), but outcome `i` always belongs to
    /// child `i`, regardless of completion order.
    pub fn group_in_order(children: Vec<Deferred>) -> Deferred {
        crate::group::demux(children, true)
    }

    /// Blocks until the deferred is terminal; returns the carried value
    /// or the carried failure.
    ///
    /// Never call this from inside one of this deferred's own links:
    /// the chain cannot finish while a link blocks it, so the call
    /// deadlocks.
    pub fn join(&self) -> Result<Value, Failure> {
        match self.wait(None) {
            Some(outcome) => outcome,
            None => unreachable!("unbounded wait cannot expire"),
        }
    }

    /// As [`join`](Deferred::join), giving up after `millis`
    /// milliseconds. A timeout of 0 waits unboundedly; timeouts longer
    /// than a year are accepted with a warning. Timing out does not
    /// stop the deferred from progressing.
    ///
    /// # Panics
    ///
    /// Panics when the timeout overflows nanosecond precision.
    pub fn join_timeout(&self, millis: u64) -> Result<Value, JoinError> {
        if millis == 0 {
            return self.join().map_err(JoinError::from);
        }
        if millis > ONE_YEAR_MS {
            warn!("join timeout of {} ms is longer than a year", millis);
        }
        let nanos = match millis.checked_mul(1_000_000) {
            Some(nanos) => nanos,
            None => panic!("join timeout of {} ms overflows nanosecond precision", millis),
        };
        let deadline = Instant::now() + Duration::from_nanos(nanos);
        match self.wait(Some(deadline)) {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(JoinError::Failed(failure)),
            None => Err(JoinError::TimedOut(millis)),
        }
    }

    /// Records a pair or, when the deferred is already terminal, runs
    /// it immediately on the calling thread and keeps draining until
    /// the chain is empty again.
    pub(crate) fn push(&self, link: Link) {
        {
            let mut chain = self.inner.chain.lock();
            // The lock serializes appenders, but joiners and
            // continuations steal DONE -> RUNNING without it; the
            // transition goes through a CAS so exactly one owner
            // emerges. A losing append is enqueued and picked up by the
            // owner's under-lock re-check.
            if self
                .inner
                .state
                .compare_exchange(DONE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                chain.push(link);
                return;
            }
        }
        debug!("{:?}: appended after terminal, running here", self);
        let outcome = self.take_result();
        let reply = link.invoke(outcome);
        if self.settle(reply) {
            self.run();
        }
    }

    /// Drain loop. The caller owns RUNNING and `result` holds the
    /// carried outcome.
    ///
    /// The lock is released while each link runs, which lets appends
    /// interleave with the drain; the terminal transition is made under
    /// the same lock acquisition that observed the empty chain, so no
    /// appended pair is ever stranded.
    fn run(&self) {
        loop {
            let link = {
                let mut chain = self.inner.chain.lock();
                match chain.pop() {
                    Some(link) => link,
                    None => {
                        self.inner.state.store(DONE, Ordering::SeqCst);
                        drop(chain);
                        debug!("{:?}: chain drained", self);
                        return;
                    }
                }
            };
            let outcome = self.take_result();
            let reply = link.invoke(outcome);
            if !self.settle(reply) {
                return;
            }
        }
    }

    /// Adopts a link's reply as the carried outcome. Returns `false`
    /// when the chain suspended on an inner deferred (or when an
    /// already-settled continuation finished the drain inline).
    fn settle(&self, reply: Reply) -> bool {
        let mut reply = reply;
        loop {
            let inner = match reply {
                Reply::Settled(outcome) => {
                    self.inner.result.store(Some(outcome));
                    return true;
                }
                Reply::Deferred(inner) => inner,
            };
            if Arc::ptr_eq(&self.inner, &inner.inner) {
                panic!("a deferred cannot use itself as a result");
            }
            // Fast path: the inner deferred has already settled, so its
            // outcome can be adopted without registering a resume link.
            if inner
                .inner
                .state
                .compare_exchange(DONE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                reply = Reply::Settled(inner.adopt_settled());
                continue;
            }
            // Suspend until `inner` settles. PAUSED must be visible
            // before the resume link is registered; the link asserts
            // the PAUSED -> RUNNING transition when it fires.
            self.inner.state.store(PAUSED, Ordering::SeqCst);
            debug!("{:?}: paused on {:?}", self, inner);
            let outer = self.clone();
            inner.push(Link::Both(Box::new(move |outcome: Outcome| {
                outer.resume(outcome.clone());
                Reply::Settled(outcome)
            })));
            return false;
        }
    }

    /// Resumes a chain that paused on an inner deferred, carrying that
    /// deferred's outcome.
    fn resume(&self, outcome: Outcome) {
        if let Err(actual) =
            self.inner
                .state
                .compare_exchange(PAUSED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            panic!("deferred resumed while {}", state_name(actual));
        }
        debug!("{:?}: resumed", self);
        self.inner.result.store(Some(outcome));
        self.run();
    }

    /// Clones the terminal outcome out of a deferred this thread just
    /// took from DONE to RUNNING, then releases it. If an append
    /// slipped in while the deferred was held, drain it rather than
    /// terminating over a non-empty chain.
    fn adopt_settled(&self) -> Outcome {
        let outcome = self.take_result();
        self.inner.result.store(Some(outcome.clone()));
        let chain = self.inner.chain.lock();
        if chain.is_empty() {
            self.inner.state.store(DONE, Ordering::SeqCst);
            drop(chain);
        } else {
            drop(chain);
            self.run();
        }
        outcome
    }

    fn take_result(&self) -> Outcome {
        self.inner
            .result
            .take()
            .expect("bug: running deferred has no result")
    }

    /// Blocks until terminal or until `deadline` expires (`None` return
    /// value). With no deadline, waits unboundedly.
    fn wait(&self, deadline: Option<Instant>) -> Option<Outcome> {
        // Already terminal: read the outcome directly instead of paying
        // for a signal link.
        if self
            .inner
            .state
            .compare_exchange(DONE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(self.adopt_settled());
        }
        debug!("{:?}: blocking until terminal", self);
        let signal = Arc::new((Mutex::new(None::<Outcome>), Condvar::new()));
        let cell = signal.clone();
        self.push(Link::Both(Box::new(move |outcome: Outcome| {
            let (slot, condvar) = &*cell;
            *slot.lock() = Some(outcome.clone());
            condvar.notify_all();
            Reply::Settled(outcome)
        })));
        let (slot, condvar) = &*signal;
        let mut guard = slot.lock();
        loop {
            if let Some(outcome) = guard.take() {
                return Some(outcome);
            }
            match deadline {
                None => condvar.wait(&mut guard),
                Some(deadline) => {
                    // Elapsed time is accounted across spurious
                    // wakeups; a residue under MIN_WAIT counts as
                    // expired.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining < MIN_WAIT {
                        return None;
                    }
                    let _ = condvar.wait_for(&mut guard, remaining);
                }
            }
        }
    }
}

fn success_fn<T, F>(f: F) -> SuccessFn
where
    T: Any + Send + Sync,
    F: FnOnce(Arc<T>) -> Reply + Send + 'static,
{
    Box::new(move |value| f(downcast::<T>(value)))
}

impl Clone for Deferred {
    /// Returns another handle to the same deferred.
    fn clone(&self) -> Deferred {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Deferred {
    fn default() -> Deferred {
        Deferred::new()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.load(Ordering::SeqCst);
        let mut repr = fmt.debug_struct("Deferred");
        repr.field("state", &state_name(state));
        // The chain lock may be held by the very caller formatting us,
        // e.g. from a panic message inside the drain loop.
        match self.inner.chain.try_lock() {
            Some(chain) => repr.field("pending", &chain.len()),
            None => repr.field("pending", &"<locked>"),
        };
        repr.finish()
    }
}
