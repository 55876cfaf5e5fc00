//! Raw execution contexts: the stack-switch primitive coroutines run on.
//!
//! A [`ThreadStack`] is a dedicated OS thread created with the requested
//! stack size, parked except while its coroutine runs. Control transfer is a
//! strict-alternation handoff: [`ThreadStack::resume`] wakes the context and
//! blocks the driving side until the context reports back through
//! [`YieldStatus`]; [`suspend_in_place`] is the reverse edge, reachable from
//! the running coroutine through a thread-local installed on the context
//! thread. At any instant exactly one of (driver, context) is runnable, so at
//! most one raw stack is live per OS thread.
//!
//! Stack overflow detection is the OS guard page; overflowing a context is
//! fatal.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::sync::{Parker, Unparker};

/// What a raw context reports when it hands control back to its driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum YieldStatus {
    Suspended,
    Finished,
}

const STATUS_SUSPENDED: u8 = 0;
const STATUS_FINISHED: u8 = 1;

const CMD_NONE: u8 = 0;
const CMD_RUN: u8 = 1;
const CMD_ABANDON: u8 = 2;

/// The context-thread side of the handoff.
struct Suspender {
    resume_parker: Parker,
    yield_unparker: Unparker,
    status: Arc<AtomicU8>,
}

impl Suspender {
    /// Hands control back to the driver and parks until the next resume.
    fn suspend(&self) {
        self.status.store(STATUS_SUSPENDED, Ordering::Release);
        self.yield_unparker.unpark();
        self.resume_parker.park();
    }
}

thread_local! {
    /// Installed on a context thread for the lifetime of its entry function.
    static SUSPENDER: RefCell<Option<Rc<Suspender>>> = RefCell::new(None);
}

/// Suspends the raw context the calling thread is running on.
///
/// # Panics
///
/// Panics when the calling thread is not a coroutine context thread.
pub(crate) fn suspend_in_place() {
    let suspender = SUSPENDER.with(|s| s.borrow().clone());
    match suspender {
        Some(suspender) => suspender.suspend(),
        None => panic!("cannot suspend a thread that is not a coroutine context"),
    }
}

/// The driver side of one raw execution context.
///
/// Dropping a context that was never resumed releases its thread without
/// running the entry function.
pub(crate) struct ThreadStack {
    yield_parker: Parker,
    resume_unparker: Unparker,
    status: Arc<AtomicU8>,
    command: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadStack {
    /// Creates a parked context that will run `entry` after the first resume.
    pub(crate) fn new<F>(name: String, stack_size: usize, entry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let resume_parker = Parker::new();
        let resume_unparker = resume_parker.unparker().clone();
        let yield_parker = Parker::new();
        let yield_unparker = yield_parker.unparker().clone();
        let status = Arc::new(AtomicU8::new(STATUS_SUSPENDED));
        let command = Arc::new(AtomicU8::new(CMD_NONE));

        let thread_status = status.clone();
        let thread_command = command.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                resume_parker.park();
                if thread_command.load(Ordering::Acquire) == CMD_ABANDON {
                    return;
                }
                let suspender = Rc::new(Suspender {
                    resume_parker,
                    yield_unparker: yield_unparker.clone(),
                    status: thread_status.clone(),
                });
                SUSPENDER.with(|s| *s.borrow_mut() = Some(suspender));
                entry();
                SUSPENDER.with(|s| s.borrow_mut().take());
                thread_status.store(STATUS_FINISHED, Ordering::Release);
                yield_unparker.unpark();
            })
            .expect("failed to create a coroutine context thread");

        Self {
            yield_parker,
            resume_unparker,
            status,
            command,
            thread: Some(thread),
        }
    }

    /// Switches into the context and blocks until it suspends or finishes.
    pub(crate) fn resume(&mut self) -> YieldStatus {
        self.command.store(CMD_RUN, Ordering::Release);
        self.resume_unparker.unpark();
        self.yield_parker.park();
        match self.status.load(Ordering::Acquire) {
            STATUS_FINISHED => YieldStatus::Finished,
            _ => YieldStatus::Suspended,
        }
    }

    /// Reclaims the context thread after it reported [`YieldStatus::Finished`].
    pub(crate) fn release(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ThreadStack {
    fn drop(&mut self) {
        // Reachable only before the first resume; a context whose entry is
        // mid-flight keeps its owner alive through the current-coroutine slot.
        if let Some(thread) = self.thread.take() {
            self.command.store(CMD_ABANDON, Ordering::Release);
            self.resume_unparker.unpark();
            let _ = thread.join();
        }
    }
}
