//! Single-shot promises: deferred values settled exactly once.
//!
//! A [`Promise`] starts pending and moves to fulfilled or rejected at most
//! once; later settle attempts are ignored. Coroutines block on one through
//! [`co_await`](crate::co_await), plain callers attach continuations with
//! [`on_settle`](Promise::on_settle). Continuations never run inline on the
//! settling thread, they are scheduled onto an execution context.

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use parking_lot::Mutex;

use crate::awaitable::{AwaitKind, Awaitable, ClaimOrRegister, Waiter};
use crate::dispatch::{current_context, Dispatcher, ExecutionContext};
use crate::error::{CoroError, Result};

enum PromiseState<T> {
    Pending(Vec<PromiseWaiter<T>>),
    Fulfilled(T),
    Rejected(CoroError),
}

enum PromiseWaiter<T> {
    Coroutine(Waiter<T>),
    Continuation {
        ctx: ExecutionContext,
        run: Box<dyn FnOnce(Result<T>) + Send + 'static>,
    },
}

/// Single-shot deferred value. Cloning is cheap; every clone observes the
/// same settle.
pub struct Promise<T> {
    inner: Arc<Mutex<PromiseState<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Promise<T> {
    /// A pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PromiseState::Pending(Vec::new()))),
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.inner.lock(), PromiseState::Pending(_))
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.inner.lock(), PromiseState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.lock(), PromiseState::Rejected(_))
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    /// Peeks at the settled payload without consuming anything. `None` while
    /// pending.
    pub fn try_value(&self) -> Option<Result<T>> {
        match &*self.inner.lock() {
            PromiseState::Pending(_) => None,
            PromiseState::Fulfilled(value) => Some(Ok(value.clone())),
            PromiseState::Rejected(err) => Some(Err(err.clone())),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Settles with a value, waking every waiter. Returns `false` (and does
    /// nothing) when already settled.
    pub fn fulfill(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with an application error, carried to waiters as
    /// [`CoroError::Rejected`]. Idempotent like [`fulfill`](Self::fulfill).
    pub fn reject<E>(&self, error: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.settle(Err(CoroError::rejected(error)))
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let waiters = {
            let mut state = self.inner.lock();
            match &mut *state {
                PromiseState::Pending(waiters) => {
                    let waiters = std::mem::take(waiters);
                    *state = match &outcome {
                        Ok(value) => PromiseState::Fulfilled(value.clone()),
                        Err(err) => PromiseState::Rejected(err.clone()),
                    };
                    waiters
                }
                _ => return false,
            }
        };
        trace!("promise settled with {} waiters", waiters.len());
        for waiter in waiters {
            Self::deliver(waiter, outcome.clone());
        }
        true
    }

    fn deliver(waiter: PromiseWaiter<T>, outcome: Result<T>) {
        match waiter {
            PromiseWaiter::Coroutine(waiter) => {
                waiter.complete(outcome);
            }
            PromiseWaiter::Continuation { ctx, run } => ctx.schedule(move || run(outcome)),
        }
    }

    /// Attaches a continuation that runs exactly once with the settled
    /// payload. It runs on the context current at registration time (or a
    /// global pool context when there is none), never inline on the settling
    /// thread. Registering on a settled promise schedules it immediately.
    pub fn on_settle<F>(&self, run: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let ctx = current_context().unwrap_or_else(|| Dispatcher::global().next());
        let mut state = self.inner.lock();
        match &mut *state {
            PromiseState::Pending(waiters) => waiters.push(PromiseWaiter::Continuation {
                ctx,
                run: Box::new(run),
            }),
            PromiseState::Fulfilled(value) => {
                let outcome = Ok(value.clone());
                drop(state);
                ctx.schedule(move || run(outcome));
            }
            PromiseState::Rejected(err) => {
                let outcome = Err(err.clone());
                drop(state);
                ctx.schedule(move || run(outcome));
            }
        }
    }

    /// A promise a timer thread fulfills with `value` after `delay`; the
    /// building block for timeouts and sleeps.
    pub fn delayed(delay: Duration, value: T) -> Self {
        let promise = Self::new();
        let settler = promise.clone();
        std::thread::Builder::new()
            .name("cokit-timer".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                settler.fulfill(value);
            })
            .expect("failed to create a timer thread");
        promise
    }
}

impl<T: Clone> Awaitable for Promise<T> {
    type Output = T;

    fn kind(&self) -> AwaitKind {
        AwaitKind::Promise
    }

    fn claim_or_register(&self, waiter: Waiter<T>) -> ClaimOrRegister<T> {
        let mut state = self.inner.lock();
        match &mut *state {
            PromiseState::Pending(waiters) => {
                waiters.push(PromiseWaiter::Coroutine(waiter));
                ClaimOrRegister::Registered
            }
            PromiseState::Fulfilled(value) => ClaimOrRegister::Claimed(Ok(value.clone())),
            PromiseState::Rejected(err) => ClaimOrRegister::Claimed(Err(err.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::co_await;
    use crate::coroutine::{CoState, Coroutine};
    use crate::error::CoroError;
    use crossbeam::channel::unbounded;
    use std::io;
    use std::time::Instant;

    fn io_error(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Other, msg.to_string())
    }

    fn wait_for(mut pred: impl FnMut() -> bool) {
        for _ in 0..400 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_settles_only_once() {
        let promise = Promise::new();
        assert!(!promise.is_settled());
        assert!(promise.fulfill(1));
        assert!(!promise.fulfill(2));
        assert!(!promise.reject(io_error("late")));
        assert!(promise.is_fulfilled());
        assert_eq!(promise.try_value().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_reject_wins_over_later_fulfill() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.reject(io_error("broken")));
        assert!(!promise.fulfill(3));
        assert!(promise.is_rejected());
        assert!(matches!(
            promise.try_value(),
            Some(Err(CoroError::Rejected(_)))
        ));
    }

    #[test]
    fn test_try_value_pending_is_none() {
        let promise: Promise<i32> = Promise::new();
        assert!(promise.try_value().is_none());
    }

    #[test]
    fn test_await_rejected_promise_surfaces_rejection() {
        let dispatcher = Dispatcher::new(1);
        let promise: Promise<i32> = Promise::new();
        promise.reject(io_error("no luck"));
        let awaited = promise.clone();
        let (tx, rx) = unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            tx.send(co_await(&awaited)).unwrap();
            Ok(())
        });
        co.resume();
        co.wait();
        match rx.recv().unwrap() {
            Err(CoroError::Rejected(source)) => {
                assert!(source.to_string().contains("no luck"));
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_waiters_resume_in_registration_order() {
        let dispatcher = Dispatcher::new(1);
        let ctx = dispatcher.next();
        let promise: Promise<i32> = Promise::new();
        let (tx, rx) = unbounded();

        for i in 0..3 {
            let awaited = promise.clone();
            let tx = tx.clone();
            let co = Coroutine::new(&ctx, move || {
                let value = co_await(&awaited)?;
                tx.send((i, value)).unwrap();
                Ok(())
            });
            co.resume();
            // One context: each registration lands before the next body starts.
            wait_for(|| co.state() == CoState::Suspended);
        }

        promise.fulfill(40);
        for i in 0..3 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(1)).unwrap(),
                (i, 40)
            );
        }
    }

    #[test]
    fn test_on_settle_runs_once_with_value() {
        let promise = Promise::new();
        let (tx, rx) = unbounded();
        promise.on_settle(move |outcome| {
            tx.send(outcome).unwrap();
        });
        promise.fulfill(12);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap(),
            12
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_on_settle_never_runs_inline() {
        let promise = Promise::new();
        promise.fulfill(5);
        let caller = std::thread::current().id();
        let (tx, rx) = unbounded();
        promise.on_settle(move |outcome| {
            tx.send((std::thread::current().id(), outcome)).unwrap();
        });
        let (settled_on, outcome) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(settled_on, caller);
        assert_eq!(outcome.unwrap(), 5);
    }

    #[test]
    fn test_on_settle_runs_on_registration_context() {
        let dispatcher = Dispatcher::new(1);
        let ctx = dispatcher.serial("continuations");
        let promise: Promise<i32> = Promise::new();
        let (tx, rx) = unbounded();
        let registered = promise.clone();
        let probe = ctx.clone();
        ctx.schedule(move || {
            registered.on_settle(move |_| {
                tx.send(probe.is_current()).unwrap();
            });
        });
        std::thread::sleep(Duration::from_millis(20));
        promise.fulfill(0);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_delayed_fulfills_after_the_delay() {
        let dispatcher = Dispatcher::new(1);
        let started = Instant::now();
        let promise = Promise::delayed(Duration::from_millis(40), 99);
        let awaited = promise.clone();
        let (tx, rx) = unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            tx.send(co_await(&awaited)?).unwrap();
            Ok(())
        });
        co.resume();
        co.wait();
        assert_eq!(rx.recv().unwrap(), 99);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
