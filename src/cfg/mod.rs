//! Process-wide runtime settings, read at creation time only.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default stack size for a coroutine's raw execution context.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size [`set_stack_size`] will accept.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

pub struct RuntimeCfg {
    stack_size: usize,
    /// Workers in the global dispatcher pool. Zero means "one per core".
    pool_workers: usize,
}

impl RuntimeCfg {
    pub const fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            pool_workers: 0,
        }
    }
}

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);
static POOL_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Stack size used when [`Coroutine::new`](crate::Coroutine::new) is called
/// without an explicit size.
pub fn config_stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}

/// Requested width of the global dispatcher pool. Zero means "one per core".
pub fn config_pool_workers() -> usize {
    POOL_WORKERS.load(Ordering::Relaxed)
}

/// Sets the default stack size. Values below [`MIN_STACK_SIZE`] are raised to it.
pub fn set_stack_size(stack_size: usize) {
    STACK_SIZE.store(stack_size.max(MIN_STACK_SIZE), Ordering::Relaxed);
}

/// Sets the global pool width. Takes effect only before the global dispatcher
/// first runs.
pub fn set_pool_workers(workers: usize) {
    POOL_WORKERS.store(workers, Ordering::Relaxed);
}

pub fn set_config(config: RuntimeCfg) {
    set_stack_size(config.stack_size);
    set_pool_workers(config.pool_workers);
}
