//! Turning watchdog and node units of work into running execution threads.

pub mod pooled;
pub mod simple;

pub use pooled::PooledThreadManager;
pub use simple::SimpleThreadManager;

use crate::context::RunContext;
use crate::core::errors::{EngineError, Result};
use crate::graph::RunStatus;
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, Aborted, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify, OwnedMutexGuard};
use tracing::debug;

pub type BoxTask<T> = BoxFuture<'static, T>;

/// Pool a unit of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Watchdog,
    Node,
    General,
}

impl TaskKind {
    pub fn pool_name(&self) -> &'static str {
        match self {
            TaskKind::Watchdog => "watchdog",
            TaskKind::Node => "node",
            TaskKind::General => "general",
        }
    }
}

/// Execution service for watchdogs and nodes
#[async_trait]
pub trait ThreadManager: Send + Sync {
    /// Start a watchdog; runs may queue here when the watchdog pool is bounded
    fn execute_watchdog(
        &self,
        context: RunContext,
        task: BoxTask<RunStatus>,
    ) -> Result<ExecutionHandle<RunStatus>>;

    /// Start one node task, consuming a node thread from the budget
    fn execute_node(&self, context: RunContext, task: BoxTask<()>) -> Result<ExecutionHandle<()>>;

    /// Start a general purpose task
    fn execute(&self, label: &str, task: BoxTask<()>) -> Result<ExecutionHandle<()>>;

    /// Node threads still available; `None` means unlimited
    fn free_node_threads(&self) -> Option<usize>;

    /// Give `count` node threads back to the budget
    fn release_node_threads(&self, count: usize);

    /// Wait until `count` node threads are free and hold the start-up lock
    /// while the caller starts its nodes
    async fn wait_for_node_threads(&self, count: usize) -> Result<StartupGuard>;

    /// Stop accepting work and let running work finish
    async fn free(&self);

    /// Stop accepting work and cancel everything
    fn free_now(&self);

    fn is_shutdown(&self) -> bool;
}

/// Handle to a submitted unit of work
pub struct ExecutionHandle<T> {
    label: String,
    rx: oneshot::Receiver<std::result::Result<std::thread::Result<T>, Aborted>>,
    finished: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl<T> ExecutionHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the task returned, panicked or was cancelled
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Cancel the task at its next await point
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub async fn join(self) -> Result<T> {
        match self.rx.await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(panic))) => Err(EngineError::internal(format!(
                "task {} panicked: {}",
                self.label,
                panic_message(&*panic)
            ))),
            Ok(Err(Aborted)) | Err(_) => Err(EngineError::cancelled(self.label)),
        }
    }
}

impl<T> std::fmt::Debug for ExecutionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("label", &self.label)
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Wrap `task` so its outcome, panic or cancellation reaches the returned handle
pub(crate) fn instrument<T: Send + 'static>(
    label: impl Into<String>,
    task: BoxTask<T>,
) -> (impl Future<Output = ()> + Send + 'static, ExecutionHandle<T>) {
    let (tx, rx) = oneshot::channel();
    let finished = Arc::new(AtomicBool::new(false));
    let (abort, registration) = AbortHandle::new_pair();
    let guard = FinishGuard(finished.clone());

    let wrapped = async move {
        let outcome = Abortable::new(AssertUnwindSafe(task).catch_unwind(), registration).await;
        drop(guard);
        let _ = tx.send(outcome);
    };

    (
        wrapped,
        ExecutionHandle {
            label: label.into(),
            rx,
            finished,
            abort,
        },
    )
}

/// Held while a phase starts its nodes; dropping it lets the next phase in
#[derive(Debug)]
pub struct StartupGuard {
    _lock: Option<OwnedMutexGuard<()>>,
}

impl StartupGuard {
    pub(crate) fn unlocked() -> Self {
        Self { _lock: None }
    }
}

/// Node thread accounting shared by all runs of one thread manager
#[derive(Debug)]
pub struct NodeThreadBudget {
    capacity: Option<usize>,
    in_use: AtomicUsize,
    released: Notify,
    startup: Arc<Mutex<()>>,
}

impl NodeThreadBudget {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            in_use: AtomicUsize::new(0),
            released: Notify::new(),
            startup: Arc::new(Mutex::new(())),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn free(&self) -> Option<usize> {
        self.capacity.map(|c| c.saturating_sub(self.in_use()))
    }

    /// Take `count` threads if the budget allows it
    pub fn try_acquire(&self, count: usize) -> Result<()> {
        let capacity = self.capacity;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| match capacity {
                None => Some(used + count),
                Some(limit) => (used + count <= limit).then_some(used + count),
            })
            .map(|_| ())
            .map_err(|used| {
                EngineError::resource_exhausted(
                    "node_threads",
                    (used + count) as u64,
                    capacity.unwrap_or_default() as u64,
                )
            })
    }

    /// Return threads; never releases more than is in use
    pub fn release(&self, count: usize) {
        let _ = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(count))
            });
        self.released.notify_waiters();
    }

    pub async fn wait_for(&self, count: usize) -> Result<StartupGuard> {
        if let Some(limit) = self.capacity {
            if count > limit {
                return Err(EngineError::resource_exhausted(
                    "node_threads",
                    count as u64,
                    limit as u64,
                )
                .with_details("phase needs more node threads than the pool provides"));
            }
        }

        let lock = self.startup.clone().lock_owned().await;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.free() {
                Some(free) if free < count => {
                    debug!(needed = count, free, "Waiting for free node threads");
                    released.await;
                }
                _ => return Ok(StartupGuard { _lock: Some(lock) }),
            }
        }
    }
}
