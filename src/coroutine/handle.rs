//! The coroutine handle and its lifecycle state machine.
//!
//! A [`Coroutine`] couples a raw execution context (a parked thread with its
//! own stack) to the serial [`ExecutionContext`] it was created on. Driving
//! happens exclusively on that context: resumes and wakes enqueue a drive
//! job, the drive switches into the raw context until the body suspends or
//! finishes, and the context's serial order makes each coroutine's steps
//! totally ordered without any stack-level locking.
//!
//! Wakes are matched to suspensions by an epoch counter. Arming a suspension
//! bumps the epoch; a wake carries the epoch it was issued for and is dropped
//! when stale. A wake that lands between arming and parking is flagged and
//! consumed without parking, so the race loses at most a park, never a wake.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::awaitable::{AwaitKind, Awaitable, ClaimOrRegister, Waiter};
use crate::cfg;
use crate::coroutine::{clear_current, current, set_current};
use crate::dispatch::{self, ExecutionContext};
use crate::error::{CoroError, Result};
use crate::local::LocalValue;
use crate::stack::{self, ThreadStack, YieldStatus};

/// Observable lifecycle state of a [`Coroutine`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoState {
    /// Built but never scheduled.
    Created,
    /// Queued on its context, waiting for a drive.
    Runnable,
    /// Body executing right now.
    Running,
    /// Parked on an awaitable.
    Suspended,
    /// Cancellation requested but the body has not unwound yet.
    Cancelling,
    /// Body done; the raw context is released.
    Finished,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Created,
    Runnable,
    Running,
    Suspended,
    Finished,
}

#[derive(PartialEq)]
enum WakeOutcome {
    /// Finished, wrong epoch, or a wake already pending.
    Stale,
    /// Noted for a coroutine that has not parked yet.
    Noted,
    /// Moved to runnable; the caller owns scheduling the drive.
    Runnable,
}

type Body = Box<dyn FnOnce() -> Result<()> + Send + 'static>;
type FinishHook = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct State {
    phase: Phase,
    resumed: bool,
    epoch: u64,
    wake_pending: bool,
    raw: Option<ThreadStack>,
    body: Option<Body>,
    /// Terminal outcome of the body; `None` means it returned cleanly.
    completion: Option<CoroError>,
    last_error: Option<CoroError>,
    blocked_on: Option<AwaitKind>,
    locals: HashMap<String, LocalValue>,
    finished_hook: Option<FinishHook>,
    join_waiters: Vec<Waiter<()>>,
}

pub(crate) struct Inner {
    id: u64,
    ctx: ExecutionContext,
    stack_size: usize,
    cancelled: AtomicBool,
    state: Mutex<State>,
    finished: Condvar,
}

/// Cloneable handle to one coroutine.
///
/// Handles are weak in spirit: dropping every handle of a coroutine that was
/// never resumed releases its raw context without running the body, while a
/// coroutine that is mid-flight keeps itself alive until it finishes.
#[derive(Clone)]
pub struct Coroutine {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakCoroutine(Weak<Inner>);

impl WeakCoroutine {
    pub(crate) fn upgrade(&self) -> Option<Coroutine> {
        self.0.upgrade().map(|inner| Coroutine { inner })
    }
}

impl Coroutine {
    /// Creates a coroutine on `ctx` with the configured default stack size.
    /// The coroutine starts in [`CoState::Created`] and runs nothing until
    /// resumed.
    pub fn new<F>(ctx: &ExecutionContext, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self::with_stack_size(ctx, cfg::config_stack_size(), body)
    }

    /// Creates a coroutine with an explicit stack size for its raw context.
    /// Sizes below [`cfg::MIN_STACK_SIZE`] are raised to the minimum.
    pub fn with_stack_size<F>(ctx: &ExecutionContext, stack_size: usize, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let stack_size = stack_size.max(cfg::MIN_STACK_SIZE);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Inner {
            id,
            ctx: ctx.clone(),
            stack_size,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(State {
                phase: Phase::Created,
                resumed: false,
                epoch: 0,
                wake_pending: false,
                raw: None,
                body: Some(Box::new(body)),
                completion: None,
                last_error: None,
                blocked_on: None,
                locals: HashMap::new(),
                finished_hook: None,
                join_waiters: Vec::new(),
            }),
            finished: Condvar::new(),
        });
        let weak = Arc::downgrade(&inner);
        let raw = ThreadStack::new(format!("coroutine-{id}"), stack_size, move || {
            context_main(weak)
        });
        inner.state.lock().raw = Some(raw);
        trace!("created coroutine {} on context '{}'", id, ctx.name());
        Coroutine { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The serial context this coroutine is pinned to.
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.ctx
    }

    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    pub fn state(&self) -> CoState {
        let state = self.inner.state.lock();
        match state.phase {
            Phase::Finished => CoState::Finished,
            _ if self.inner.cancelled.load(Ordering::Acquire) => CoState::Cancelling,
            Phase::Created => CoState::Created,
            Phase::Runnable => CoState::Runnable,
            Phase::Running => CoState::Running,
            Phase::Suspended => CoState::Suspended,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().phase == Phase::Finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// True once the coroutine has been scheduled at least once.
    pub fn is_resumed(&self) -> bool {
        self.inner.state.lock().resumed
    }

    /// The most recent error recorded in this coroutine's body.
    pub fn last_error(&self) -> Option<CoroError> {
        self.inner.state.lock().last_error.clone()
    }

    /// What the coroutine is suspended on right now, if anything.
    pub fn blocked_on(&self) -> Option<AwaitKind> {
        self.inner.state.lock().blocked_on
    }

    /// Reads a coroutine-local value from outside the body. Locals are
    /// released when the coroutine finishes.
    pub fn get_specific(&self, key: &str) -> Option<LocalValue> {
        self.inner.state.lock().locals.get(key).cloned()
    }

    pub fn same_handle(&self, other: &Coroutine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Requests execution. The first resume schedules the body; a resume of a
    /// suspended coroutine is an ordinary wake and at worst a spurious one.
    /// No-op while queued, running, or finished.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Created => {
                state.phase = Phase::Runnable;
                state.resumed = true;
                drop(state);
                trace!("coroutine {} scheduled for its first run", self.id());
                self.schedule_drive();
            }
            Phase::Suspended => {
                let epoch = state.epoch;
                drop(state);
                self.try_wake(epoch);
            }
            Phase::Runnable | Phase::Running | Phase::Finished => {}
        }
    }

    /// Like [`resume`](Self::resume), but when called on the owning context
    /// it drives the coroutine in place instead of going through the queue.
    pub fn resume_now(&self) {
        if !self.inner.ctx.is_current() {
            return self.resume();
        }
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Created => {
                state.phase = Phase::Runnable;
                state.resumed = true;
                drop(state);
                self.drive();
            }
            Phase::Suspended => {
                let epoch = state.epoch;
                drop(state);
                if self.wake_to_runnable(epoch) == WakeOutcome::Runnable {
                    self.drive();
                }
            }
            Phase::Runnable | Phase::Running | Phase::Finished => {}
        }
    }

    /// [`resume`](Self::resume) under its scheduler-facing name; contexts
    /// wake their worker on enqueue, so there is no separate nudge.
    pub fn add_to_scheduler(&self) {
        self.resume();
    }

    /// Requests cooperative cancellation: the flag is observable through
    /// [`is_cancelled`](Self::is_cancelled) and [`is_active`](crate::is_active),
    /// and a suspended coroutine is woken to observe it. Idempotent.
    pub fn cancel(&self) {
        let state = self.inner.state.lock();
        if state.phase == Phase::Finished || self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("coroutine {} cancel requested", self.id());
        if state.phase == Phase::Suspended {
            let epoch = state.epoch;
            drop(state);
            self.try_wake(epoch);
        }
    }

    /// Suspends the calling coroutine until this one finishes. Returns the
    /// body's terminal outcome; an error outcome is also recorded as the
    /// caller's last error. Returns immediately when already finished, and
    /// fails with [`CoroError::InvalidContext`] outside a coroutine body.
    ///
    /// # Panics
    ///
    /// Panics when a coroutine joins itself.
    pub fn join(&self) -> Result<()> {
        if let Some(current) = current() {
            if current.same_handle(self) {
                panic!("cannot join a coroutine from inside its own body");
            }
        }
        crate::awaitable::co_await(self)
    }

    /// [`cancel`](Self::cancel) followed by [`join`](Self::join).
    pub fn cancel_and_join(&self) -> Result<()> {
        self.cancel();
        self.join()
    }

    /// Blocks the calling OS thread until the coroutine finishes. For the
    /// world outside coroutines; inside one, use [`join`](Self::join).
    ///
    /// # Panics
    ///
    /// Panics when called on the coroutine's owning execution context while
    /// it is unfinished: that context is the only place it can make progress.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Finished {
            return;
        }
        self.forbid_blocking_own_context();
        while state.phase != Phase::Finished {
            self.inner.finished.wait(&mut state);
        }
    }

    /// [`wait`](Self::wait) with a deadline. Returns `false` on timeout.
    ///
    /// # Panics
    ///
    /// Panics on the owning execution context, like [`wait`](Self::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Finished {
            return true;
        }
        self.forbid_blocking_own_context();
        while state.phase != Phase::Finished {
            if self
                .inner
                .finished
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.phase == Phase::Finished;
            }
        }
        true
    }

    /// On the owning context the worker is either this thread or blocked
    /// driving it; a wait here can never be woken.
    fn forbid_blocking_own_context(&self) {
        if self.inner.ctx.is_current() {
            panic!("cannot wait for a coroutine from its own execution context");
        }
    }

    /// Registers the completion callback, run exactly once on the owning
    /// context once the coroutine finishes. Registering after completion
    /// schedules it immediately; registering twice replaces the first.
    pub fn on_finished<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Finished {
            drop(state);
            self.inner.ctx.schedule(hook);
        } else {
            state.finished_hook = Some(Box::new(hook));
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCoroutine {
        WeakCoroutine(Arc::downgrade(&self.inner))
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn record_error(&self, err: &CoroError) {
        self.inner.state.lock().last_error = Some(err.clone());
    }

    pub(crate) fn set_local(&self, key: String, value: LocalValue) {
        self.inner.state.lock().locals.insert(key, value);
    }

    /// Arms a suspension: bumps the wake epoch and clears any stale pending
    /// wake. Runs on the coroutine's own context thread while Running.
    pub(crate) fn prepare_suspend(&self) -> u64 {
        let mut state = self.inner.state.lock();
        debug_assert_eq!(state.phase, Phase::Running);
        state.epoch += 1;
        state.wake_pending = false;
        state.epoch
    }

    /// Ends an armed suspension that never parked.
    pub(crate) fn finish_wait(&self) {
        let mut state = self.inner.state.lock();
        state.wake_pending = false;
        state.blocked_on = None;
    }

    /// Parks the raw context until a wake for the armed epoch arrives. A wake
    /// that already landed, or a pending cancel request, is consumed without
    /// parking.
    pub(crate) fn suspend_current(&self, kind: AwaitKind) {
        {
            let mut state = self.inner.state.lock();
            if state.wake_pending {
                state.wake_pending = false;
                return;
            }
            // cancel() synthesizes a wake only for a parked coroutine;
            // between arming and parking the flag itself is the wake.
            // cancel() writes it under this lock.
            if self.inner.cancelled.load(Ordering::Acquire) {
                return;
            }
            state.blocked_on = Some(kind);
            state.phase = Phase::Suspended;
        }
        stack::suspend_in_place();
        let mut state = self.inner.state.lock();
        debug_assert_eq!(state.phase, Phase::Running);
        state.wake_pending = false;
        state.blocked_on = None;
    }

    /// Delivers a wake for the given epoch, scheduling a drive when the
    /// coroutine is parked. Returns `false` for a dropped stale wake.
    pub(crate) fn try_wake(&self, epoch: u64) -> bool {
        match self.wake_to_runnable(epoch) {
            WakeOutcome::Stale => false,
            WakeOutcome::Noted => true,
            WakeOutcome::Runnable => {
                self.schedule_drive();
                true
            }
        }
    }

    fn wake_to_runnable(&self, epoch: u64) -> WakeOutcome {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Finished || state.epoch != epoch || state.wake_pending {
            return WakeOutcome::Stale;
        }
        state.wake_pending = true;
        if state.phase == Phase::Suspended {
            state.phase = Phase::Runnable;
            WakeOutcome::Runnable
        } else {
            // Armed but not parked yet; suspend_current consumes the flag.
            WakeOutcome::Noted
        }
    }

    fn schedule_drive(&self) {
        let co = self.clone();
        self.inner.ctx.schedule(move || co.drive());
    }

    /// Runs on the owning context: switches into the raw context until the
    /// body suspends or finishes.
    fn drive(&self) {
        let mut raw = {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Runnable {
                trace!(
                    "coroutine {} drive skipped in phase {:?}",
                    self.id(),
                    state.phase
                );
                return;
            }
            state.phase = Phase::Running;
            match state.raw.take() {
                Some(raw) => raw,
                None => panic!("[BUG] a runnable coroutine without a raw context. Please report this issue."),
            }
        };
        match raw.resume() {
            YieldStatus::Suspended => {
                self.inner.state.lock().raw = Some(raw);
            }
            YieldStatus::Finished => self.finish(raw),
        }
    }

    fn finish(&self, raw: ThreadStack) {
        let (hook, joiners, outcome) = {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Finished;
            state.blocked_on = None;
            state.wake_pending = false;
            state.locals.clear();
            let outcome = match &state.completion {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            (
                state.finished_hook.take(),
                std::mem::take(&mut state.join_waiters),
                outcome,
            )
        };
        raw.release();
        trace!(
            "coroutine {} finished ({})",
            self.id(),
            if outcome.is_ok() { "ok" } else { "err" }
        );
        self.inner.finished.notify_all();
        for waiter in joiners {
            waiter.complete(outcome.clone());
        }
        if let Some(hook) = hook {
            self.inner.ctx.schedule(hook);
        }
    }
}

/// Awaiting a coroutine settles with its terminal outcome when it finishes.
/// Awaiting your own handle, directly or inside a batch, is the self-join
/// misuse and panics.
impl Awaitable for Coroutine {
    type Output = ();

    fn kind(&self) -> AwaitKind {
        AwaitKind::Join
    }

    fn claim_or_register(&self, waiter: Waiter<()>) -> ClaimOrRegister<()> {
        if waiter.is_for(self) {
            panic!("cannot join a coroutine from inside its own body");
        }
        let mut state = self.inner.state.lock();
        if state.phase == Phase::Finished {
            let outcome = match &state.completion {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            ClaimOrRegister::Claimed(outcome)
        } else {
            state.join_waiters.push(waiter);
            ClaimOrRegister::Registered
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Entry function of every raw context: runs the body with the
/// current-coroutine and current-context slots set for its thread.
fn context_main(weak: Weak<Inner>) {
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    let co = Coroutine { inner };
    dispatch::enter_context(co.context().clone());
    set_current(co.clone());

    let body = co.inner.state.lock().body.take();
    let outcome = match body {
        Some(body) if !co.inner.cancelled.load(Ordering::Acquire) => {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(res) => res,
                Err(payload) => Err(CoroError::Panicked(panic_message(payload))),
            }
        }
        // Cancelled before the body ever ran.
        Some(_) => Err(CoroError::Cancelled),
        None => Ok(()),
    };
    if let Err(err) = outcome {
        let mut state = co.inner.state.lock();
        state.last_error = Some(err.clone());
        state.completion = Some(err);
    }
    clear_current();
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
