//! The await orchestrator: the [`Awaitable`] contract, waiter plumbing, and
//! the [`co_await`] / [`co_batch_await`] entry points.
//!
//! Every await follows the same shape: the caller arms a suspension epoch,
//! then asks the target to either claim an already-settled payload or queue a
//! [`Waiter`], in one atomic step under the target's own lock, so a settle
//! can never fall between the check and the registration. A queued waiter carries
//! a delivery slot plus a wake route back to the suspended coroutine; the
//! slot's `Dead` marking lets an abandoning awaiter refuse late deliveries so
//! a channel value is never consumed by a receiver that already gave up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::coroutine::{current, Coroutine, WeakCoroutine};
use crate::error::{CoroError, Result};

/// What kind of target a coroutine is suspended on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AwaitKind {
    Promise,
    Receive,
    Send,
    Join,
    Batch,
}

/// Delivery slot shared between one registration and its completer.
pub(crate) enum Slot<T> {
    Empty,
    Ready(Result<T>),
    /// The registration was abandoned; deliveries must be refused.
    Dead,
}

pub(crate) type SharedSlot<T> = Arc<Mutex<Slot<T>>>;

pub(crate) fn new_slot<T>() -> SharedSlot<T> {
    Arc::new(Mutex::new(Slot::Empty))
}

/// Takes a delivered payload out of the slot, if one arrived.
pub(crate) fn take_ready<T>(slot: &SharedSlot<T>) -> Option<Result<T>> {
    let mut guard = slot.lock();
    match std::mem::replace(&mut *guard, Slot::Empty) {
        Slot::Ready(res) => Some(res),
        Slot::Empty => None,
        Slot::Dead => {
            *guard = Slot::Dead;
            None
        }
    }
}

/// Marks the registration dead. A payload that raced in first wins and is
/// returned instead.
pub(crate) fn abandon_slot<T>(slot: &SharedSlot<T>) -> Option<Result<T>> {
    match std::mem::replace(&mut *slot.lock(), Slot::Dead) {
        Slot::Ready(res) => Some(res),
        _ => None,
    }
}

enum WaiterNotify {
    Single { co: WeakCoroutine, epoch: u64 },
    Batch(Arc<BatchCore>),
}

/// One armed registration: where to put the payload and whom to wake.
///
/// Opaque outside the crate; [`Awaitable`] implementations hold waiters in
/// their own queues and fire them through [`Waiter::complete`].
pub struct Waiter<T> {
    slot: SharedSlot<T>,
    notify: WaiterNotify,
}

impl<T> Waiter<T> {
    pub(crate) fn single(co: &Coroutine, epoch: u64, slot: SharedSlot<T>) -> Self {
        Self {
            slot,
            notify: WaiterNotify::Single {
                co: co.downgrade(),
                epoch,
            },
        }
    }

    pub(crate) fn batch(core: Arc<BatchCore>, slot: SharedSlot<T>) -> Self {
        Self {
            slot,
            notify: WaiterNotify::Batch(core),
        }
    }

    /// Whether this registration would wake `co` itself.
    pub(crate) fn is_for(&self, co: &Coroutine) -> bool {
        let weak = match &self.notify {
            WaiterNotify::Single { co, .. } => co,
            WaiterNotify::Batch(core) => &core.co,
        };
        weak.upgrade().map_or(false, |waiting| waiting.same_handle(co))
    }

    /// Delivers the payload and wakes the waiting side. A dead registration
    /// refuses the delivery and hands the payload back, so the completer can
    /// give it to someone else.
    pub(crate) fn complete(self, outcome: Result<T>) -> Option<Result<T>> {
        {
            let mut guard = self.slot.lock();
            match &*guard {
                Slot::Dead => return Some(outcome),
                Slot::Empty => *guard = Slot::Ready(outcome),
                Slot::Ready(_) => {
                    panic!("[BUG] double delivery to one waiter. Please report this issue.")
                }
            }
        }
        match self.notify {
            WaiterNotify::Single { co, epoch } => {
                if let Some(co) = co.upgrade() {
                    co.try_wake(epoch);
                }
            }
            WaiterNotify::Batch(core) => core.arrived(),
        }
        None
    }

    /// [`complete`](Self::complete) for a plain value; a refused delivery
    /// hands the value itself back.
    pub(crate) fn complete_value(self, value: T) -> Option<T> {
        match self.complete(Ok(value)) {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(_)) => None,
        }
    }
}

/// Shared countdown for one batch await: the waiter whose delivery drops
/// `pending` to zero wakes the coroutine.
pub(crate) struct BatchCore {
    pending: AtomicUsize,
    co: WeakCoroutine,
    epoch: u64,
}

impl BatchCore {
    fn arrived(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(co) = self.co.upgrade() {
                co.try_wake(self.epoch);
            }
        }
    }
}

/// Outcome of [`Awaitable::claim_or_register`].
pub enum ClaimOrRegister<T> {
    /// The target was already settled; the payload was claimed synchronously.
    Claimed(Result<T>),
    /// Not settled yet; the waiter is queued.
    Registered,
}

/// Something a coroutine can suspend on.
///
/// A registration settles exactly once with a value or an error. Implemented
/// by [`Promise`](crate::Promise), [`Channel`](crate::Channel) (receiving)
/// and [`Coroutine`] (completion).
pub trait Awaitable {
    type Output;

    /// The kind tag recorded while a coroutine is suspended on this target.
    fn kind(&self) -> AwaitKind;

    /// In one atomic step: claim the settled payload, or queue `waiter` for
    /// delivery on settle.
    fn claim_or_register(&self, waiter: Waiter<Self::Output>) -> ClaimOrRegister<Self::Output>;
}

/// Suspends the calling coroutine on `target` until it settles, returning the
/// settled payload.
///
/// Returns synchronously when `target` is already settled. Fails with
/// [`CoroError::InvalidContext`] outside a coroutine body; cancellation of
/// the caller surfaces as [`CoroError::Cancelled`], except that a payload
/// delivered before the cancellation was observed still wins. Every error
/// outcome is also recorded as the caller's last error.
pub fn co_await<A>(target: &A) -> Result<A::Output>
where
    A: Awaitable + ?Sized,
{
    let co = match current() {
        Some(co) => co,
        None => return Err(CoroError::InvalidContext("await")),
    };
    if co.cancel_requested() {
        let err = CoroError::Cancelled;
        co.record_error(&err);
        return Err(err);
    }

    let kind = target.kind();
    let epoch = co.prepare_suspend();
    let slot = new_slot::<A::Output>();
    match target.claim_or_register(Waiter::single(&co, epoch, slot.clone())) {
        ClaimOrRegister::Claimed(res) => {
            co.finish_wait();
            if let Err(err) = &res {
                co.record_error(err);
            }
            return res;
        }
        ClaimOrRegister::Registered => {}
    }

    trace!("coroutine {} awaiting {:?}", co.id(), kind);
    loop {
        co.suspend_current(kind);
        if let Some(res) = take_ready(&slot) {
            if let Err(err) = &res {
                co.record_error(err);
            }
            return res;
        }
        if co.cancel_requested() {
            if let Some(res) = abandon_slot(&slot) {
                if let Err(err) = &res {
                    co.record_error(err);
                }
                return res;
            }
            let err = CoroError::Cancelled;
            co.record_error(&err);
            return Err(err);
        }
        // Spurious wake; the registration is still armed.
    }
}

/// Suspends the calling coroutine once on every target and resumes only
/// after **all** of them settled.
///
/// Results preserve input order and each position carries its own payload or
/// error; one rejection does not disturb the others. The call itself fails
/// only outside a coroutine body or when the caller is cancelled mid-wait.
/// An empty batch returns immediately.
pub fn co_batch_await<T>(targets: &[&dyn Awaitable<Output = T>]) -> Result<Vec<Result<T>>> {
    let co = match current() {
        Some(co) => co,
        None => return Err(CoroError::InvalidContext("batch_await")),
    };
    if co.cancel_requested() {
        let err = CoroError::Cancelled;
        co.record_error(&err);
        return Err(err);
    }
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let epoch = co.prepare_suspend();
    let core = Arc::new(BatchCore {
        pending: AtomicUsize::new(targets.len()),
        co: co.downgrade(),
        epoch,
    });
    let slots: Vec<SharedSlot<T>> = (0..targets.len()).map(|_| new_slot()).collect();
    for (target, slot) in targets.iter().zip(&slots) {
        match target.claim_or_register(Waiter::batch(core.clone(), slot.clone())) {
            ClaimOrRegister::Claimed(res) => {
                *slot.lock() = Slot::Ready(res);
                core.arrived();
            }
            ClaimOrRegister::Registered => {}
        }
    }

    trace!(
        "coroutine {} batch-awaiting {} targets",
        co.id(),
        targets.len()
    );
    while core.pending.load(Ordering::Acquire) != 0 {
        co.suspend_current(AwaitKind::Batch);
        if core.pending.load(Ordering::Acquire) == 0 {
            break;
        }
        if co.cancel_requested() {
            for slot in &slots {
                abandon_slot(slot);
            }
            let err = CoroError::Cancelled;
            co.record_error(&err);
            return Err(err);
        }
    }
    co.finish_wait();

    let mut results = Vec::with_capacity(slots.len());
    for slot in &slots {
        match take_ready(slot) {
            Some(res) => {
                if let Err(err) = &res {
                    co.record_error(err);
                }
                results.push(res);
            }
            None => panic!("[BUG] a settled batch slot without a payload. Please report this issue."),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::coroutine::Coroutine;
    use crate::dispatch::Dispatcher;
    use crate::error::CoroError;
    use crate::promise::Promise;
    use std::time::Duration;

    fn wait_for(mut pred: impl FnMut() -> bool) {
        for _ in 0..400 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    /// Dwells before handing the waiter on, keeping the caller between its
    /// entry checks and the park long enough for outside events to land.
    struct SlowRegistration {
        target: Promise<i32>,
        dwell: Duration,
    }

    impl Awaitable for SlowRegistration {
        type Output = i32;

        fn kind(&self) -> AwaitKind {
            AwaitKind::Promise
        }

        fn claim_or_register(&self, waiter: Waiter<i32>) -> ClaimOrRegister<i32> {
            std::thread::sleep(self.dwell);
            self.target.claim_or_register(waiter)
        }
    }

    #[test]
    fn test_await_outside_coroutine_fails() {
        let promise: Promise<i32> = Promise::new();
        assert!(matches!(
            co_await(&promise),
            Err(CoroError::InvalidContext(_))
        ));
        assert!(matches!(
            co_batch_await::<i32>(&[&promise]),
            Err(CoroError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_await_settled_promise_returns_synchronously() {
        let dispatcher = Dispatcher::new(1);
        let promise = Promise::new();
        promise.fulfill(41);
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            tx.send(co_await(&promise)).unwrap();
            Ok(())
        });
        co.resume();
        co.wait();
        assert_eq!(rx.recv().unwrap().unwrap(), 41);
    }

    #[test]
    fn test_empty_batch_returns_immediately() {
        let dispatcher = Dispatcher::new(1);
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            let results = co_batch_await::<i32>(&[])?;
            tx.send(results.len()).unwrap();
            Ok(())
        });
        co.resume();
        co.wait();
        assert_eq!(rx.recv().unwrap(), 0);
    }

    #[test]
    fn test_batch_preserves_input_order() {
        let dispatcher = Dispatcher::new(1);
        let first: Promise<i32> = Promise::new();
        let second: Promise<i32> = Promise::new();
        let third: Promise<i32> = Promise::new();
        let (p1, p2, p3) = (first.clone(), second.clone(), third.clone());
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            let results = co_batch_await(&[&p1, &p2, &p3])?;
            tx.send(results).unwrap();
            Ok(())
        });
        co.resume();
        wait_for(|| co.blocked_on() == Some(AwaitKind::Batch));

        // Settle out of order; one rejection among fulfilments.
        second.fulfill(2);
        third.reject(std::io::Error::new(std::io::ErrorKind::Other, "nope"));
        first.fulfill(1);
        co.wait();

        let results = rx.recv().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert_eq!(*results[1].as_ref().unwrap(), 2);
        assert!(matches!(results[2], Err(CoroError::Rejected(_))));
        assert!(matches!(co.last_error(), Some(CoroError::Rejected(_))));
    }

    #[test]
    fn test_batch_over_mixed_target_kinds() {
        let dispatcher = Dispatcher::new(1);
        let chan: Channel<i32> = Channel::unbounded();
        assert!(chan.try_send(10).unwrap().is_none());
        let promise = Promise::new();
        promise.fulfill(20);
        let (c, p) = (chan.clone(), promise.clone());
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            let targets: [&dyn Awaitable<Output = i32>; 2] = [&c, &p];
            let results = co_batch_await(&targets)?;
            tx.send(results).unwrap();
            Ok(())
        });
        co.resume();
        co.wait();
        let results = rx.recv().unwrap();
        assert_eq!(*results[0].as_ref().unwrap(), 10);
        assert_eq!(*results[1].as_ref().unwrap(), 20);
    }

    #[test]
    fn test_batch_cancel_while_waiting() {
        let dispatcher = Dispatcher::new(1);
        let never: Promise<i32> = Promise::new();
        let also_never: Promise<i32> = Promise::new();
        let (p1, p2) = (never.clone(), also_never.clone());
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            tx.send(co_batch_await(&[&p1, &p2]).is_err()).unwrap();
            Ok(())
        });
        co.resume();
        wait_for(|| co.blocked_on() == Some(AwaitKind::Batch));
        co.cancel();
        co.wait();
        assert!(rx.recv().unwrap());
        assert!(matches!(co.last_error(), Some(CoroError::Cancelled)));
        assert!(!never.is_settled());
    }

    #[test]
    fn test_cancel_while_registering_wakes_with_cancelled() {
        let dispatcher = Dispatcher::new(1);
        let never: Promise<i32> = Promise::new();
        let slow = SlowRegistration {
            target: never.clone(),
            dwell: Duration::from_millis(100),
        };
        let (ready_tx, ready_rx) = crossbeam::channel::unbounded();
        let (tx, rx) = crossbeam::channel::unbounded();
        let co = Coroutine::new(&dispatcher.next(), move || {
            ready_tx.send(()).unwrap();
            tx.send(co_await(&slow)).unwrap();
            Ok(())
        });
        co.resume();
        // Land the cancel while the await is still inside the registration.
        ready_rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        co.cancel();
        assert!(co.wait_timeout(Duration::from_secs(2)));
        assert!(matches!(rx.recv().unwrap(), Err(CoroError::Cancelled)));
        assert!(matches!(co.last_error(), Some(CoroError::Cancelled)));
        assert!(!never.is_settled());
    }

    #[test]
    fn test_batch_containing_own_handle_panics() {
        let dispatcher = Dispatcher::new(1);
        let pending: Promise<()> = Promise::new();
        let first = pending.clone();
        let co = Coroutine::new(&dispatcher.next(), move || {
            let me = current().expect("inside a body");
            let targets: [&dyn Awaitable<Output = ()>; 2] = [&first, &me];
            co_batch_await(&targets)?;
            Ok(())
        });
        co.resume();
        co.wait();
        match co.last_error() {
            Some(CoroError::Panicked(msg)) => assert!(msg.contains("own body")),
            other => panic!("expected a captured panic, got {other:?}"),
        }
        assert!(!pending.is_settled());
    }

    #[test]
    fn test_dead_registration_refuses_delivery() {
        let slot = new_slot::<i32>();
        assert!(abandon_slot(&slot).is_none());
        let dispatcher = Dispatcher::new(1);
        let co = Coroutine::new(&dispatcher.next(), || Ok(()));
        let waiter = Waiter::single(&co, 1, slot.clone());
        assert_eq!(waiter.complete_value(9), Some(9));
        assert!(take_ready(&slot).is_none());
    }

    #[test]
    fn test_delivery_beats_late_abandon() {
        let slot = new_slot::<i32>();
        let dispatcher = Dispatcher::new(1);
        let co = Coroutine::new(&dispatcher.next(), || Ok(()));
        let waiter = Waiter::single(&co, 1, slot.clone());
        assert!(waiter.complete_value(5).is_none());
        match abandon_slot(&slot) {
            Some(Ok(value)) => assert_eq!(value, 5),
            other => panic!("expected the delivered value, got {:?}", other.map(|r| r.ok())),
        }
    }
}
