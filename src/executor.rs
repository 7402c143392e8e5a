//! Graph executor: admission control in front of the thread manager.

use crate::context::RunContext;
use crate::core::config::RuntimeConfig;
use crate::core::errors::{EngineError, Result};
use crate::core::limits::AdmissionStats;
use crate::engine::EngineContext;
use crate::events::{EventSink, NotificationBus};
use crate::graph::{Graph, RunStatus};
use crate::threads::{ExecutionHandle, ThreadManager};
use crate::tracking::{GraphTracking, TrackingLogger};
use crate::watchdog::{FailureCause, RunOutcome, Watchdog};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A graph plus everything needed to run it once
pub struct RunRequest {
    graph: Arc<Graph>,
    config: Option<RuntimeConfig>,
    listeners: Vec<Arc<dyn EventSink>>,
}

impl RunRequest {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            config: None,
            listeners: Vec::new(),
        }
    }

    /// Runtime configuration for this run; the engine default is used otherwise
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach a notification listener to this run's bus
    pub fn listener(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.listeners.push(sink);
        self
    }
}

/// Submitter's view of a running graph
pub struct RunHandle {
    watchdog: Arc<Watchdog>,
    handle: ExecutionHandle<RunStatus>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        self.watchdog.run_id()
    }

    pub fn status(&self) -> RunStatus {
        self.watchdog.status()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.watchdog.abort();
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.watchdog.cause()
    }

    pub fn tracking(&self) -> GraphTracking {
        self.watchdog.tracking()
    }

    /// Wait for the terminal status
    pub async fn wait(self) -> RunOutcome {
        match self.handle.join().await {
            Ok(_) => {}
            Err(EngineError::Cancelled { operation, .. }) => {
                warn!(run_id = %self.watchdog.run_id(), "Watchdog task {} was cancelled", operation);
                self.watchdog.terminate(
                    RunStatus::Aborted,
                    EngineError::cancelled(operation).into(),
                );
            }
            Err(e) => {
                error!(run_id = %self.watchdog.run_id(), error = %e, "Watchdog task failed");
                self.watchdog.terminate(RunStatus::Error, e.into());
            }
        }
        self.watchdog.outcome()
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Gives a node thread back to the budget when a direct node task ends
struct NodeThreadLease {
    threads: Arc<dyn ThreadManager>,
}

impl Drop for NodeThreadLease {
    fn drop(&mut self) {
        self.threads.release_node_threads(1);
    }
}

/// Accepts graph runs, enforces the queued-run limit and starts watchdogs
pub struct GraphExecutor {
    context: EngineContext,
}

impl GraphExecutor {
    pub fn new(context: &EngineContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Admit a run and hand its watchdog to the thread manager.
    ///
    /// Fails synchronously when the configuration is invalid, the run queue
    /// is full or the graph does not validate; no node is started then.
    pub fn submit(&self, request: RunRequest) -> Result<RunHandle> {
        let RunRequest {
            graph,
            config,
            listeners,
        } = request;

        // checked on every submission; graph validation below runs only once
        let config = config.unwrap_or_else(|| self.context.config().runtime.clone());
        config.validate()?;

        let queued = self.context.admission().enqueue_run()?;
        let config = config.freeze();
        graph.init(&config)?;

        let mut bus = NotificationBus::new(config.run_id());
        if config.print_tracking {
            bus = bus.with_sink(Arc::new(TrackingLogger));
        }
        for listener in listeners {
            bus = bus.with_sink(listener);
        }

        let run_context = RunContext::new(config.run_id(), graph.id());
        let watchdog = Arc::new(Watchdog::new(
            graph,
            config,
            self.context.threads().clone(),
            bus,
        ));

        let runner = Arc::clone(&watchdog);
        let task = async move {
            let _running = queued.start();
            runner.run().await
        }
        .boxed();
        let handle = self.context.threads().execute_watchdog(run_context, task)?;

        info!(
            run_id = %watchdog.run_id(),
            graph = %watchdog.graph().name(),
            queued = self.context.admission().queued_runs(),
            "Graph run submitted"
        );
        Ok(RunHandle { watchdog, handle })
    }

    /// Run a standalone node task, counted as a running node while it lives
    pub fn execute_node<F>(&self, context: RunContext, task: F) -> Result<ExecutionHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let running = self.context.admission().start_node();
        let threads = self.context.threads().clone();
        let lease_threads = threads.clone();
        let task = async move {
            // armed on first poll: a refused task never held a node thread
            let _lease = NodeThreadLease {
                threads: lease_threads,
            };
            let _running = running;
            task.await
        }
        .boxed();
        threads.execute_node(context, task).map_err(|e| {
            warn!(error = %e, category = e.category(), "Node task refused");
            e
        })
    }

    pub fn running_nodes(&self) -> usize {
        self.context.admission().running_nodes()
    }

    pub fn queued_runs(&self) -> usize {
        self.context.admission().queued_runs()
    }

    /// Node threads still free; `None` means unlimited
    pub fn free_capacity(&self) -> Option<usize> {
        self.context.threads().free_node_threads()
    }

    pub fn stats(&self) -> AdmissionStats {
        self.context.admission().stats()
    }

    /// Stop accepting runs and wait for the running ones
    pub async fn shutdown(&self) {
        info!("Shutting down graph executor");
        self.context.threads().free().await;
    }

    /// Stop accepting runs and cancel everything still running
    pub fn shutdown_now(&self) {
        warn!("Shutting down graph executor immediately");
        self.context.threads().free_now();
    }
}
