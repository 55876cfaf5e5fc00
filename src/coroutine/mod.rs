//! Coroutine handles and the per-thread current-coroutine registry.

pub mod handle;

pub use handle::{CoState, Coroutine};
pub(crate) use handle::WeakCoroutine;

use std::cell::RefCell;

use crate::dispatch::Dispatcher;
use crate::error::{CoroError, Result};

thread_local! {
    /// The coroutine actively running on this thread. Set on a context
    /// thread for the lifetime of its body.
    static CURRENT: RefCell<Option<Coroutine>> = RefCell::new(None);
}

/// Returns the coroutine actively running on the calling thread, if any.
pub fn current() -> Option<Coroutine> {
    CURRENT.with(|current| current.borrow().clone())
}

/// True inside a live coroutine body whose cancellation has not been
/// requested.
pub fn is_active() -> bool {
    match current() {
        Some(co) => !co.is_cancelled() && !co.is_finished(),
        None => false,
    }
}

/// The calling coroutine's recorded last error, if any.
pub fn last_error() -> Option<CoroError> {
    current().and_then(|co| co.last_error())
}

pub(crate) fn set_current(co: Coroutine) {
    CURRENT.with(|current| *current.borrow_mut() = Some(co));
}

pub(crate) fn clear_current() {
    CURRENT.with(|current| current.borrow_mut().take());
}

/// Creates a coroutine on the global dispatcher pool and schedules it right
/// away.
pub fn spawn<F>(body: F) -> Coroutine
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let co = Coroutine::new(&Dispatcher::global().next(), body);
    co.resume();
    co
}
