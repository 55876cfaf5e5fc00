//! Serial execution contexts and the dispatcher that owns them.
//!
//! An [`ExecutionContext`] is a FIFO work queue drained by one dedicated
//! worker thread, so everything scheduled on one context runs serially in
//! submission order. Coroutines are pinned to the context they were created
//! on: every resumption of a coroutine goes through the same context queue.
//!
//! The [`Dispatcher`] holds a fixed pool of contexts handed out round-robin
//! plus any number of named serial contexts. Contexts live for the process;
//! their workers are detached and never join.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use slab::Slab;

use crate::cfg;
use crate::utils::{get_core_ids, set_for_current, CoreId};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct ContextShared {
    id: usize,
    name: String,
    tx: Sender<Job>,
}

/// A serial work queue with its own worker thread.
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Clone)]
pub struct ExecutionContext {
    shared: Arc<ContextShared>,
}

impl ExecutionContext {
    /// Runs `work` on this context after everything scheduled before it.
    pub fn schedule<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_job(Box::new(work));
    }

    pub(crate) fn schedule_job(&self, job: Job) {
        if self.shared.tx.send(job).is_err() {
            warn!(
                "context '{}' lost its worker, dropping scheduled work",
                self.shared.name
            );
        }
    }

    /// True when the calling thread is executing for this context. That
    /// includes the context's worker thread and any coroutine context thread
    /// the worker is currently driving.
    pub fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|current| match &*current.borrow() {
            Some(ctx) => ctx.same_context(self),
            None => false,
        })
    }

    /// True when both handles refer to the same underlying queue.
    pub fn same_context(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<ExecutionContext>> = RefCell::new(None);
}

/// Returns the execution context the calling thread executes for, if any.
pub fn current_context() -> Option<ExecutionContext> {
    CURRENT_CONTEXT.with(|current| current.borrow().clone())
}

/// Marks the calling thread as executing for `ctx`. Set on dispatcher workers
/// and on coroutine context threads.
pub(crate) fn enter_context(ctx: ExecutionContext) {
    CURRENT_CONTEXT.with(|current| *current.borrow_mut() = Some(ctx));
}

fn worker_loop(ctx: ExecutionContext, rx: Receiver<Job>) {
    enter_context(ctx);
    while let Ok(job) = rx.recv() {
        job();
    }
}

fn resolve_workers(workers: usize) -> usize {
    if workers != 0 {
        return workers;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

static GLOBAL: LazyLock<Dispatcher> = LazyLock::new(|| {
    let workers = resolve_workers(cfg::config_pool_workers());
    debug!("starting the global dispatcher with {workers} pool contexts");
    Dispatcher::new(workers)
});

/// Owns a pool of contexts handed out round-robin and mints named serial
/// contexts on demand.
pub struct Dispatcher {
    contexts: Mutex<Slab<ExecutionContext>>,
    pool: Vec<ExecutionContext>,
    next_in_pool: AtomicUsize,
}

impl Dispatcher {
    /// Creates a dispatcher with `workers` pool contexts; `0` means one per
    /// available core.
    pub fn new(workers: usize) -> Self {
        let workers = resolve_workers(workers);
        let mut dispatcher = Self {
            contexts: Mutex::new(Slab::with_capacity(workers)),
            pool: Vec::with_capacity(workers),
            next_in_pool: AtomicUsize::new(0),
        };
        for i in 0..workers {
            let ctx = dispatcher.start_context(&format!("cokit-worker-{i}"), None);
            dispatcher.pool.push(ctx);
        }
        dispatcher
    }

    /// Creates a dispatcher with one pool context pinned to each core.
    pub fn pinned() -> Self {
        let core_ids = get_core_ids().unwrap_or_default();
        if core_ids.is_empty() {
            return Self::new(0);
        }
        let mut dispatcher = Self {
            contexts: Mutex::new(Slab::with_capacity(core_ids.len())),
            pool: Vec::with_capacity(core_ids.len()),
            next_in_pool: AtomicUsize::new(0),
        };
        for core_id in core_ids {
            let ctx = dispatcher.start_context(&format!("cokit-core-{}", core_id.id), Some(core_id));
            dispatcher.pool.push(ctx);
        }
        dispatcher
    }

    /// The process-wide dispatcher backing [`spawn`](crate::spawn). Created
    /// on first use with [`cfg::config_pool_workers`] pool contexts.
    pub fn global() -> &'static Dispatcher {
        &GLOBAL
    }

    /// Picks the next pool context, round-robin.
    pub fn next(&self) -> ExecutionContext {
        let i = self.next_in_pool.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[i].clone()
    }

    /// Mints a named serial context with its own worker thread.
    pub fn serial(&self, name: &str) -> ExecutionContext {
        self.start_context(name, None)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Total contexts this dispatcher has created, pool included.
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    fn start_context(&self, name: &str, core_id: Option<CoreId>) -> ExecutionContext {
        let (tx, rx) = unbounded();
        let ctx = {
            let mut contexts = self.contexts.lock();
            let entry = contexts.vacant_entry();
            let ctx = ExecutionContext {
                shared: Arc::new(ContextShared {
                    id: entry.key(),
                    name: name.to_string(),
                    tx,
                }),
            };
            entry.insert(ctx.clone());
            ctx
        };
        let worker = ctx.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(core_id) = core_id {
                    set_for_current(core_id);
                }
                worker_loop(worker, rx);
            })
            .expect("failed to create a context worker thread");
        trace!("started context '{}' (id {})", ctx.name(), ctx.id());
        ctx
    }
}
