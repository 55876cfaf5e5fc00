//! Errors surfaced by suspension-point operations.
//!
//! Every fallible operation in this crate returns [`CoroError`]. The enum is
//! cloneable so one terminal error can be handed to the failing call site,
//! recorded as the coroutine's last error, and delivered to every joiner.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoroError>;

#[derive(Debug, Clone, Error)]
pub enum CoroError {
    /// The operation only makes sense inside a coroutine body.
    #[error("{0} called outside of a coroutine")]
    InvalidContext(&'static str),

    /// Cooperative cancellation was observed at a suspension point.
    #[error("coroutine was cancelled")]
    Cancelled,

    /// The channel is closed and fully drained.
    #[error("channel is closed")]
    ClosedChannel,

    /// The awaited promise was rejected with an application error.
    #[error("promise rejected: {0}")]
    Rejected(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The coroutine body panicked; the payload message is preserved.
    #[error("coroutine panicked: {0}")]
    Panicked(String),
}

impl CoroError {
    /// Wraps an application error the way [`reject`](crate::Promise::reject) does.
    pub fn rejected<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CoroError::Rejected(Arc::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoroError::Cancelled)
    }

    pub fn is_closed_channel(&self) -> bool {
        matches!(self, CoroError::ClosedChannel)
    }
}
