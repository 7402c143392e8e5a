use crate::context::{ContextProvider, RunContext};
use crate::core::errors::{EngineError, Result};
use crate::graph::RunStatus;
use crate::threads::{instrument, BoxTask, ExecutionHandle, StartupGuard, TaskKind, ThreadManager};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Fresh named OS thread per submission, no limits.
///
/// Each thread drives its unit of work on a private current-thread runtime,
/// so a node blocking its thread cannot stall any other node.
#[derive(Debug, Default)]
pub struct SimpleThreadManager {
    shutdown: AtomicBool,
}

impl SimpleThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn<T: Send + 'static>(
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

        let (wrapped, handle) = instrument(label.clone(), task);
        std::thread::Builder::new()
            .name(label.clone())
            .spawn(move || run_on_private_runtime(context, wrapped))
            .map_err(|e| EngineError::rejected(kind.pool_name(), e.to_string()))?;

        debug!(pool = kind.pool_name(), thread = %label, "Started thread");
        Ok(handle)
    }
}

fn run_on_private_runtime<F>(context: Option<RunContext>, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // dropping the task marks its handle cancelled
            error!(error = %e, "Failed to build thread runtime");
            return;
        }
    };
    match context {
        Some(context) => runtime.block_on(ContextProvider::scope(context, task)),
        None => runtime.block_on(task),
    }
}

#[async_trait]
impl ThreadManager for SimpleThreadManager {
    fn execute_watchdog(
        &self,
        context: RunContext,
        task: BoxTask<RunStatus>,
    ) -> Result<ExecutionHandle<RunStatus>> {
        self.spawn(TaskKind::Watchdog, context.label(), Some(context), task)
    }

    fn execute_node(&self, context: RunContext, task: BoxTask<()>) -> Result<ExecutionHandle<()>> {
        self.spawn(TaskKind::Node, context.label(), Some(context), task)
    }

    fn execute(&self, label: &str, task: BoxTask<()>) -> Result<ExecutionHandle<()>> {
        self.spawn(TaskKind::General, label.to_string(), None, task)
    }

    fn free_node_threads(&self) -> Option<usize> {
        None
    }

    fn release_node_threads(&self, _count: usize) {}

    async fn wait_for_node_threads(&self, _count: usize) -> Result<StartupGuard> {
        Ok(StartupGuard::unlocked())
    }

    /// Threads are detached; only new submissions are refused
    async fn free(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn free_now(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
