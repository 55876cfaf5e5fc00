//! Cooperative, stackful coroutines over serial execution contexts.
//!
//! A [`Coroutine`] runs a blocking-style body on its own stack, pinned to the
//! [`ExecutionContext`] it was created on. Bodies park on [`Promise`]s,
//! [`Channel`]s and other coroutines through [`co_await`] and resume when the
//! target settles; the context's serial queue keeps every coroutine's steps
//! in order without locking coroutine state across switches.

pub mod awaitable;
pub mod cfg;
pub mod channel;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod local;
pub mod promise;
pub mod utils;

mod stack;

pub use awaitable::{co_await, co_batch_await, AwaitKind, Awaitable, ClaimOrRegister, Waiter};
pub use channel::Channel;
pub use coroutine::{current, is_active, last_error, spawn, CoState, Coroutine};
pub use dispatch::{current_context, Dispatcher, ExecutionContext};
pub use error::{CoroError, Result};
pub use local::{get_specific, set_specific, LocalValue};
pub use promise::Promise;
