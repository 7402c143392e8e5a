use crate::context::{ContextProvider, RunContext};
use crate::core::config::ThreadConfig;
use crate::core::errors::{EngineError, Result};
use crate::graph::RunStatus;
use crate::threads::{
    instrument, BoxTask, ExecutionHandle, NodeThreadBudget, StartupGuard, TaskKind, ThreadManager,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// A task registered in the pooled manager while it runs
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub kind: TaskKind,
    pub label: String,
    pub context: Option<RunContext>,
}

struct Pool {
    kind: TaskKind,
    size: Option<usize>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    permits: Option<Arc<Semaphore>>,
}

impl Pool {
    fn new(kind: TaskKind, size: Option<usize>) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder
            .thread_name(format!("phaseflow-{}", kind.pool_name()))
            .enable_all();
        if let Some(size) = size {
            builder.worker_threads(size);
        }
        let runtime = builder
            .build()
            .map_err(|e| EngineError::io(format!("build {} pool", kind.pool_name()), e))?;

        Ok(Self {
            kind,
            size,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            permits: size.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// Cancel whatever is still running; never blocks
    fn shutdown(&self) {
        if let Some(permits) = &self.permits {
            permits.close();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
            debug!(pool = self.kind.pool_name(), "Pool shut down");
        }
    }
}

struct CleanupGuard {
    id: u64,
    active: Arc<DashMap<u64, ActiveTask>>,
    drained: Arc<Notify>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.active.remove(&self.id);
        self.drained.notify_waiters();
    }
}

/// Three independently sized pools for watchdogs, nodes and general work.
///
/// A sized pool runs at most `n` tasks at a time and queues the rest; an
/// unsized pool runs everything it is given. Every task is registered with
/// its run context until it ends, however it ends.
pub struct PooledThreadManager {
    watchdogs: Pool,
    nodes: Pool,
    general: Pool,
    budget: NodeThreadBudget,
    active: Arc<DashMap<u64, ActiveTask>>,
    next_task: AtomicU64,
    shutdown: AtomicBool,
    drained: Arc<Notify>,
}

impl PooledThreadManager {
    pub fn new(config: &ThreadConfig) -> Result<Self> {
        config.validate()?;

        let manager = Self {
            watchdogs: Pool::new(TaskKind::Watchdog, config.watchdog_threads)?,
            nodes: Pool::new(TaskKind::Node, config.node_threads)?,
            general: Pool::new(TaskKind::General, config.general_threads)?,
            budget: NodeThreadBudget::new(config.node_threads),
            active: Arc::new(DashMap::new()),
            next_task: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            drained: Arc::new(Notify::new()),
        };
        info!(
            watchdog_threads = ?config.watchdog_threads,
            node_threads = ?config.node_threads,
            general_threads = ?config.general_threads,
            "Pooled thread manager started"
        );
        Ok(manager)
    }

    fn pool(&self, kind: TaskKind) -> &Pool {
        match kind {
            TaskKind::Watchdog => &self.watchdogs,
            TaskKind::Node => &self.nodes,
            TaskKind::General => &self.general,
        }
    }

    /// Configured size of a pool; `None` for cached pools
    pub fn pool_size(&self, kind: TaskKind) -> Option<usize> {
        self.pool(kind).size
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn submit<T: Send + 'static>(
        &self,
        kind: TaskKind,
        label: String,
        context: Option<RunContext>,
        task: BoxTask<T>,
    ) -> Result<ExecutionHandle<T>> {
        if self.is_shutdown() {
            return Err(EngineError::rejected(
                kind.pool_name(),
                "thread manager is shut down",
            ));
        }
        let pool = self.pool(kind);

        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveTask {
                kind,
                label: label.clone(),
                context: context.clone(),
            },
        );
        let cleanup = CleanupGuard {
            id,
            active: self.active.clone(),
            drained: self.drained.clone(),
        };

        let (wrapped, handle) = instrument(label, task);
        let permits = pool.permits.clone();
        pool.handle.spawn(async move {
            let _cleanup = cleanup;
            let _permit = match permits {
                Some(permits) => match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    // pool closed while queued; dropping the task cancels its handle
                    Err(_) => return,
                },
                None => None,
            };
            match context {
                Some(context) => ContextProvider::scope(context, wrapped).await,
                None => wrapped.await,
            }
        });
        Ok(handle)
    }

    fn shutdown_pools(&self) {
        self.watchdogs.shutdown();
        self.nodes.shutdown();
        self.general.shutdown();
    }
}

#[async_trait]
impl ThreadManager for PooledThreadManager {
    fn execute_watchdog(
        &self,
        context: RunContext,
        task: BoxTask<RunStatus>,
    ) -> Result<ExecutionHandle<RunStatus>> {
        self.submit(TaskKind::Watchdog, context.label(), Some(context), task)
    }

    fn execute_node(&self, context: RunContext, task: BoxTask<()>) -> Result<ExecutionHandle<()>> {
        self.budget.try_acquire(1)?;
        self.submit(TaskKind::Node, context.label(), Some(context), task)
            .map_err(|e| {
                self.budget.release(1);
                e
            })
    }

    fn execute(&self, label: &str, task: BoxTask<()>) -> Result<ExecutionHandle<()>> {
        self.submit(TaskKind::General, label.to_string(), None, task)
    }

    fn free_node_threads(&self) -> Option<usize> {
        self.budget.free()
    }

    fn release_node_threads(&self, count: usize) {
        self.budget.release(count);
    }

    async fn wait_for_node_threads(&self, count: usize) -> Result<StartupGuard> {
        self.budget.wait_for(count).await
    }

    async fn free(&self) {
        self.shutdown.store(true, Ordering::Release);
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.active.is_empty() {
                break;
            }
            debug!(active = self.active.len(), "Waiting for running tasks before shutdown");
            drained.await;
        }
        self.shutdown_pools();
        info!("Pooled thread manager freed");
    }

    fn free_now(&self) {
        self.shutdown.store(true, Ordering::Release);
        let active = self.active.len();
        if active > 0 {
            warn!(active, "Cancelling running tasks");
        }
        self.shutdown_pools();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for PooledThreadManager {
    fn drop(&mut self) {
        self.shutdown_pools();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn manager(watchdogs: Option<usize>, nodes: Option<usize>) -> PooledThreadManager {
        PooledThreadManager::new(&ThreadConfig {
            watchdog_threads: watchdogs,
            node_threads: nodes,
            general_threads: Some(1),
            ..Default::default()
        })
        .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_registry_cleared_after_completion() {
        let manager = manager(Some(1), Some(2));
        let context = RunContext::new("run-1", "g").for_node("A");

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = manager
            .execute_node(
                context.clone(),
                async move {
                    let _ = rx.await;
                }
                .boxed(),
            )
            .unwrap();

        assert_eq!(manager.pool_size(TaskKind::Node), Some(2));
        assert_eq!(manager.pool_size(TaskKind::General), Some(1));

        let active = manager.active_tasks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].context.as_ref(), Some(&context));
        assert_eq!(manager.free_node_threads(), Some(1));

        tx.send(()).unwrap();
        handle.join().await.unwrap();
        wait_until(|| manager.active_count() == 0).await;

        // node threads come back only on explicit release
        assert_eq!(manager.free_node_threads(), Some(1));
        manager.release_node_threads(1);
        assert_eq!(manager.free_node_threads(), Some(2));
        manager.free_now();
    }

    #[tokio::test]
    async fn test_panicking_task_is_cleaned_up() {
        let manager = manager(None, None);
        let handle = manager
            .execute(
                "boom",
                async {
                    let value: Option<()> = None;
                    value.expect("boom")
                }
                .boxed(),
            )
            .unwrap();
        assert!(handle.join().await.is_err());
        wait_until(|| manager.active_count() == 0).await;
        manager.free_now();
    }

    #[tokio::test]
    async fn test_node_budget_exhausted() {
        let manager = manager(None, Some(1));
        let context = RunContext::new("run", "g");
        let first = manager
            .execute_node(context.for_node("A"), futures::future::pending().boxed())
            .unwrap();
        let err = manager
            .execute_node(context.for_node("B"), async {}.boxed())
            .unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhaustion { .. }));
        assert_eq!(manager.free_node_threads(), Some(0));

        first.abort();
        manager.free_now();
    }

    #[tokio::test]
    async fn test_fixed_pool_queues_excess_work() {
        let manager = manager(Some(1), None);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = manager
            .execute_watchdog(
                RunContext::new("run-1", "g"),
                async move {
                    let _ = rx.await;
                    RunStatus::FinishedOk
                }
                .boxed(),
            )
            .unwrap();
        let second = manager
            .execute_watchdog(
                RunContext::new("run-2", "g"),
                async { RunStatus::FinishedOk }.boxed(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        tx.send(()).unwrap();
        assert_eq!(first.join().await.unwrap(), RunStatus::FinishedOk);
        assert_eq!(second.join().await.unwrap(), RunStatus::FinishedOk);
        manager.free().await;
    }

    #[tokio::test]
    async fn test_graceful_free_waits_for_running_work() {
        let manager = manager(None, None);
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        manager
            .execute(
                "slow",
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(true, Ordering::SeqCst);
                }
                .boxed(),
            )
            .unwrap();

        manager.free().await;
        assert!(done.load(Ordering::SeqCst));
        assert!(manager.is_shutdown());

        let err = manager.execute("late", async {}.boxed()).unwrap_err();
        assert!(matches!(err, EngineError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_free_now_cancels() {
        let manager = manager(None, None);
        let handle = manager
            .execute("forever", futures::future::pending().boxed())
            .unwrap();
        manager.free_now();
        let err = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }
}
