//! FIFO channels between coroutines.
//!
//! A [`Channel`] carries values in send order through a bounded buffer. Full
//! channels park their senders, empty ones their receivers; capacity zero
//! makes every send a rendezvous that completes only once a receiver has
//! taken the value. Delivery prefers a parked receiver over the buffer, and a
//! receiver that gave up (cancelled mid-receive) refuses the handoff so the
//! value goes to the next taker instead of vanishing.
//!
//! A sender's `Ok` means its value was handed to a receiver or buffered,
//! never dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::awaitable::{self, AwaitKind, Awaitable, ClaimOrRegister, Waiter};
use crate::coroutine::current;
use crate::error::{CoroError, Result};

struct BlockedSend<T> {
    value: Option<T>,
    waiter: Waiter<()>,
}

struct ChanState<T> {
    buffer: VecDeque<T>,
    recv_waiters: VecDeque<Waiter<T>>,
    send_waiters: VecDeque<BlockedSend<T>>,
    closed: bool,
}

struct ChanInner<T> {
    /// `None` is unbounded; `Some(0)` is a rendezvous channel.
    capacity: Option<usize>,
    state: Mutex<ChanState<T>>,
}

enum TakeNow<T> {
    Value(T),
    Closed,
    Nothing,
}

/// FIFO channel between coroutines. Cloning is cheap; clones share the queue.
pub struct Channel<T> {
    inner: Arc<ChanInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Channel<T> {
    /// A channel buffering up to `capacity` values. Capacity `0` is a
    /// rendezvous channel: every send waits for its receiver.
    pub fn new(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    /// A channel whose sends never block.
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(ChanInner {
                capacity,
                state: Mutex::new(ChanState {
                    buffer: VecDeque::new(),
                    recv_waiters: VecDeque::new(),
                    send_waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// `None` for an unbounded channel.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Buffered values; parked senders' values are not counted.
    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Sends a value, suspending the calling coroutine while the channel is
    /// full (or, on a rendezvous channel, until a receiver takes the value).
    /// Fails with [`CoroError::ClosedChannel`] on a closed channel, with
    /// [`CoroError::InvalidContext`] outside a coroutine body, and with
    /// [`CoroError::Cancelled`] when cancelled while parked; the value is
    /// not delivered in any error case.
    pub fn send(&self, value: T) -> Result<()> {
        let co = match current() {
            Some(co) => co,
            None => return Err(CoroError::InvalidContext("send")),
        };
        if co.cancel_requested() {
            let err = CoroError::Cancelled;
            co.record_error(&err);
            return Err(err);
        }

        let epoch = co.prepare_suspend();
        let slot = awaitable::new_slot::<()>();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                co.finish_wait();
                let err = CoroError::ClosedChannel;
                co.record_error(&err);
                return Err(err);
            }
            let mut value = value;
            // A parked receiver takes the value directly, bypassing the buffer.
            while let Some(waiter) = state.recv_waiters.pop_front() {
                match waiter.complete_value(value) {
                    None => {
                        drop(state);
                        co.finish_wait();
                        return Ok(());
                    }
                    Some(refused) => value = refused,
                }
            }
            if self
                .inner
                .capacity
                .map_or(true, |cap| state.buffer.len() < cap)
            {
                state.buffer.push_back(value);
                drop(state);
                co.finish_wait();
                return Ok(());
            }
            let waiter = Waiter::single(&co, epoch, slot.clone());
            state.send_waiters.push_back(BlockedSend {
                value: Some(value),
                waiter,
            });
        }

        trace!("coroutine {} parked sending on a full channel", co.id());
        loop {
            co.suspend_current(AwaitKind::Send);
            if let Some(res) = awaitable::take_ready(&slot) {
                if let Err(err) = &res {
                    co.record_error(err);
                }
                return res;
            }
            if co.cancel_requested() {
                if let Some(res) = awaitable::abandon_slot(&slot) {
                    if let Err(err) = &res {
                        co.record_error(err);
                    }
                    return res;
                }
                let err = CoroError::Cancelled;
                co.record_error(&err);
                return Err(err);
            }
        }
    }

    /// Receives the next value, suspending the calling coroutine while the
    /// channel is empty. A closed channel stays receivable until drained,
    /// then fails with [`CoroError::ClosedChannel`].
    pub fn receive(&self) -> Result<T> {
        awaitable::co_await(self)
    }

    /// Non-suspending send, usable from any thread: gives the value back as
    /// `Ok(Some(value))` when it would have parked.
    pub fn try_send(&self, value: T) -> Result<Option<T>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(CoroError::ClosedChannel);
        }
        let mut value = value;
        while let Some(waiter) = state.recv_waiters.pop_front() {
            match waiter.complete_value(value) {
                None => return Ok(None),
                Some(refused) => value = refused,
            }
        }
        if self
            .inner
            .capacity
            .map_or(true, |cap| state.buffer.len() < cap)
        {
            state.buffer.push_back(value);
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Non-suspending receive, usable from any thread: `Ok(None)` when
    /// nothing is deliverable right now.
    pub fn try_receive(&self) -> Result<Option<T>> {
        let mut state = self.inner.state.lock();
        match Self::take_now(&self.inner.capacity, &mut state) {
            TakeNow::Value(value) => Ok(Some(value)),
            TakeNow::Closed => Err(CoroError::ClosedChannel),
            TakeNow::Nothing => Ok(None),
        }
    }

    /// Closes the channel. Parked senders and receivers wake with
    /// [`CoroError::ClosedChannel`]; buffered values remain receivable.
    /// Idempotent.
    pub fn close(&self) {
        let (senders, receivers) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.send_waiters),
                std::mem::take(&mut state.recv_waiters),
            )
        };
        trace!(
            "channel closed with {} parked senders, {} parked receivers",
            senders.len(),
            receivers.len()
        );
        for blocked in senders {
            blocked.waiter.complete(Err(CoroError::ClosedChannel));
        }
        for waiter in receivers {
            waiter.complete(Err(CoroError::ClosedChannel));
        }
    }

    /// Takes the next deliverable value: the buffer head, else a parked
    /// sender's value. Accepting a sender completes its send.
    fn take_now(capacity: &Option<usize>, state: &mut ChanState<T>) -> TakeNow<T> {
        if let Some(value) = state.buffer.pop_front() {
            Self::refill_from_senders(capacity, state);
            return TakeNow::Value(value);
        }
        while let Some(mut blocked) = state.send_waiters.pop_front() {
            let value = match blocked.value.take() {
                Some(value) => value,
                None => continue,
            };
            match blocked.waiter.complete(Ok(())) {
                None => return TakeNow::Value(value),
                // The sender gave up; its value dies with the send.
                Some(_) => {}
            }
        }
        if state.closed {
            TakeNow::Closed
        } else {
            TakeNow::Nothing
        }
    }

    /// Moves parked senders' values into freed buffer space, completing their
    /// sends in order.
    fn refill_from_senders(capacity: &Option<usize>, state: &mut ChanState<T>) {
        let cap = match capacity {
            Some(cap) => *cap,
            // Unbounded channels never park senders.
            None => return,
        };
        while state.buffer.len() < cap {
            let mut blocked = match state.send_waiters.pop_front() {
                Some(blocked) => blocked,
                None => return,
            };
            let value = match blocked.value.take() {
                Some(value) => value,
                None => continue,
            };
            match blocked.waiter.complete(Ok(())) {
                None => state.buffer.push_back(value),
                Some(_) => {}
            }
        }
    }
}

/// Awaiting a channel is receiving from it.
impl<T> Awaitable for Channel<T> {
    type Output = T;

    fn kind(&self) -> AwaitKind {
        AwaitKind::Receive
    }

    fn claim_or_register(&self, waiter: Waiter<T>) -> ClaimOrRegister<T> {
        let mut state = self.inner.state.lock();
        match Self::take_now(&self.inner.capacity, &mut state) {
            TakeNow::Value(value) => ClaimOrRegister::Claimed(Ok(value)),
            TakeNow::Closed => ClaimOrRegister::Claimed(Err(CoroError::ClosedChannel)),
            TakeNow::Nothing => {
                state.recv_waiters.push_back(waiter);
                ClaimOrRegister::Registered
            }
        }
    }
}
