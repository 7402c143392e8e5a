//! Top-level scheduler of one graph run.
//!
//! A [`Watchdog`] walks the graph's phases in ascending order and hands each
//! one to a [`PhaseRunner`]. The first phase that does not finish OK stops
//! the run; graph lifecycle hooks, commit/rollback and the run's
//! notifications are all driven from here.

pub mod concurrent;
pub mod node_task;
pub mod sequential;

pub use concurrent::ConcurrentPhaseRunner;
pub use node_task::NodeRuntime;
pub use sequential::SequentialPhaseRunner;

use crate::core::config::{FrozenRuntimeConfig, SchedulerMode};
use crate::core::errors::EngineError;
use crate::events::{NotificationBus, RunEvent};
use crate::graph::{AbortSignal, Graph, Phase, ResultCell, ResultCode, RunStatus};
use crate::threads::ThreadManager;
use crate::tracking::{GraphTracking, PhaseTrackingDetail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Strategy that drives a single phase to a terminal result
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_phase(&self, watchdog: &Watchdog, phase: &Phase) -> ResultCode;
}

/// Why a run failed: the first failing element plus everything reported after it
#[derive(Debug, Clone)]
pub struct FailureCause {
    element: String,
    message: String,
    primary: Arc<anyhow::Error>,
    suppressed: Vec<Arc<anyhow::Error>>,
}

impl FailureCause {
    pub fn new(
        element: impl Into<String>,
        message: impl Into<String>,
        error: Arc<anyhow::Error>,
    ) -> Self {
        Self {
            element: element.into(),
            message: message.into(),
            primary: error,
            suppressed: Vec::new(),
        }
    }

    /// Node id, `phase N` or `graph`
    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.primary
    }

    /// Failures reported after the first one
    pub fn suppressed(&self) -> &[Arc<anyhow::Error>] {
        &self.suppressed
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {:#}", self.message, self.element, self.primary)?;
        for other in &self.suppressed {
            write!(f, "; also: {:#}", other)?;
        }
        Ok(())
    }
}

/// Terminal state of a run as seen by its submitter
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub cause: Option<FailureCause>,
    pub tracking: GraphTracking,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == ResultCode::FinishedOk
    }
}

pub struct Watchdog {
    graph: Arc<Graph>,
    config: FrozenRuntimeConfig,
    threads: Arc<dyn ThreadManager>,
    bus: NotificationBus,
    runner: Box<dyn PhaseRunner>,
    status: ResultCell,
    abort: AbortSignal,
    current_nodes: RwLock<Vec<Arc<NodeRuntime>>>,
    cause: Mutex<Option<FailureCause>>,
    tracking: RwLock<GraphTracking>,
}

impl Watchdog {
    pub fn new(
        graph: Arc<Graph>,
        config: FrozenRuntimeConfig,
        threads: Arc<dyn ThreadManager>,
        bus: NotificationBus,
    ) -> Self {
        let runner: Box<dyn PhaseRunner> = match config.scheduler {
            SchedulerMode::MultiThread => Box::new(ConcurrentPhaseRunner),
            SchedulerMode::SingleThread => Box::new(SequentialPhaseRunner),
        };
        let tracking = GraphTracking::new(&graph, config.run_id());
        Self {
            graph,
            config,
            threads,
            bus,
            runner,
            status: ResultCell::default(),
            abort: AbortSignal::new(),
            current_nodes: RwLock::new(Vec::new()),
            cause: Mutex::new(None),
            tracking: RwLock::new(tracking),
        }
    }

    pub fn run_id(&self) -> &str {
        self.config.run_id()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn config(&self) -> &FrozenRuntimeConfig {
        &self.config
    }

    pub fn status(&self) -> RunStatus {
        self.status.get()
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.cause.lock().clone()
    }

    /// Snapshot of the run's tracking
    pub fn tracking(&self) -> GraphTracking {
        self.tracking.read().clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            status: self.status(),
            cause: self.cause(),
            tracking: self.tracking(),
        }
    }

    /// Stop the run; nodes of the current phase are signalled. Idempotent.
    pub fn abort(&self) {
        if self.status.compare_and_set(ResultCode::Ready, ResultCode::Aborted) {
            info!(run_id = %self.run_id(), "Graph run aborted before start");
            self.abort.abort();
            return;
        }
        if self.status().is_terminal() || !self.abort.abort() {
            return;
        }

        warn!(run_id = %self.run_id(), "Aborting graph run");
        for node in self.current_nodes.read().iter() {
            if node.abort() {
                warn!(run_id = %self.run_id(), "Interrupted node: {}", node.id());
            }
        }
    }

    /// Drive every phase and return the terminal status
    pub async fn run(&self) -> RunStatus {
        if !self
            .status
            .compare_and_set(ResultCode::Ready, ResultCode::Running)
        {
            let status = self.status();
            self.tracking.write().finish(status);
            self.emit_terminal(status);
            return status;
        }

        info!(
            run_id = %self.run_id(),
            graph = %self.graph.name(),
            scheduler = self.runner.name(),
            "Starting graph run"
        );
        self.tracking.write().start();
        self.bus.emit(RunEvent::GraphStarted {
            graph_id: self.graph.id().to_string(),
            graph_name: self.graph.name().to_string(),
        });

        let lifecycle = self.graph.lifecycle().clone();
        let mut result = match lifecycle.pre_execute().await {
            Ok(()) => self.run_phases().await,
            Err(e) => {
                self.graph_failure("pre-execute", e);
                ResultCode::Error
            }
        };

        if let Err(e) = lifecycle.post_execute().await {
            self.graph_failure("post-execute", e);
            result = ResultCode::Error;
        }

        if result == ResultCode::FinishedOk {
            if let Err(e) = lifecycle.commit().await {
                self.graph_failure("commit", e);
                result = ResultCode::Error;
            }
        } else if let Err(e) = lifecycle.rollback().await {
            self.graph_failure("rollback", e);
            result = ResultCode::Error;
        }

        self.status.transition(result);
        let status = self.status();
        self.tracking.write().finish(status);
        match status {
            ResultCode::FinishedOk => info!(run_id = %self.run_id(), "Graph run finished successfully"),
            ResultCode::Aborted => warn!(run_id = %self.run_id(), "Graph run aborted"),
            _ => error!(run_id = %self.run_id(), "Graph run finished with status {}", status),
        }
        self.emit_terminal(status);
        status
    }

    async fn run_phases(&self) -> ResultCode {
        let phases = self.graph.phases();
        if phases.is_empty() {
            info!(run_id = %self.run_id(), "Graph without phases has been executed");
            return ResultCode::FinishedOk;
        }

        let mut result = ResultCode::FinishedOk;
        for phase in phases {
            if self.is_aborted() {
                result = ResultCode::Aborted;
                break;
            }

            self.bus.emit(RunEvent::PhaseStarted {
                phase: phase.number(),
            });
            result = self.runner.run_phase(self, phase).await;

            let detail = self
                .tracking
                .read()
                .phase(phase.number())
                .cloned()
                .unwrap_or_else(|| PhaseTrackingDetail::new(phase));
            match result {
                ResultCode::FinishedOk => {
                    info!(run_id = %self.run_id(), phase = phase.number(), "Phase finished");
                    self.bus.emit(RunEvent::PhaseFinished { phase: detail });
                }
                ResultCode::Aborted => {
                    warn!(run_id = %self.run_id(), phase = phase.number(), "Phase execution aborted");
                    self.bus.emit(RunEvent::PhaseAborted { phase: detail });
                }
                _ => {
                    error!(
                        run_id = %self.run_id(),
                        phase = phase.number(),
                        "Phase finished with error - stopping graph run"
                    );
                    self.bus.emit(RunEvent::PhaseError {
                        phase: detail,
                        error: self.error_text(),
                    });
                }
            }

            self.graph.lifecycle().reclaim();
            if result != ResultCode::FinishedOk {
                break;
            }
        }
        result
    }

    fn graph_failure(&self, stage: &str, error: anyhow::Error) {
        let error = EngineError::graph_lifecycle(stage, error);
        self.record_failure("graph", error.to_string(), Arc::new(error.into()));
    }

    fn emit_terminal(&self, status: RunStatus) {
        let tracking = self.tracking();
        let event = match status {
            ResultCode::FinishedOk => RunEvent::GraphFinished { tracking },
            ResultCode::Aborted => RunEvent::GraphAborted { tracking },
            _ => RunEvent::GraphError {
                tracking,
                error: self.error_text(),
            },
        };
        self.bus.emit(event);
    }

    fn error_text(&self) -> String {
        self.cause
            .lock()
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown failure".to_string())
    }

    /// Close a run whose watchdog task never returned (panic or cancellation)
    pub(crate) fn terminate(&self, status: RunStatus, error: anyhow::Error) {
        self.abort.abort();
        self.record_failure("watchdog", "Watchdog task ended abnormally", Arc::new(error));
        if self.status.transition(status) {
            self.tracking.write().finish(self.status());
        }
    }

    pub(crate) fn threads(&self) -> &Arc<dyn ThreadManager> {
        &self.threads
    }

    pub(crate) fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub(crate) fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// Keep the first failure as the cause; later ones are appended to it
    pub(crate) fn record_failure(
        &self,
        element: impl Into<String>,
        message: impl Into<String>,
        error: Arc<anyhow::Error>,
    ) {
        let element = element.into();
        let message = message.into();
        error!(run_id = %self.run_id(), element = %element, "{}: {:#}", message, error);
        let mut cause = self.cause.lock();
        match cause.as_mut() {
            Some(existing) => existing.suppressed.push(error),
            None => *cause = Some(FailureCause::new(element, message, error)),
        }
    }

    pub(crate) fn set_current_nodes(&self, nodes: Vec<Arc<NodeRuntime>>) {
        *self.current_nodes.write() = nodes;
    }

    pub(crate) fn clear_current_nodes(&self) {
        self.current_nodes.write().clear();
    }

    pub(crate) fn update_phase_tracking(&self, detail: &PhaseTrackingDetail) {
        self.tracking.write().update_phase(detail);
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("run_id", &self.run_id())
            .field("graph", &self.graph.id())
            .field("scheduler", &self.runner.name())
            .field("status", &self.status())
            .finish()
    }
}

/// Run a phase lifecycle step, recording its failure against the phase
pub(crate) async fn phase_step<F>(watchdog: &Watchdog, phase: &Phase, stage: &str, step: F) -> bool
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match step.await {
        Ok(()) => true,
        Err(e) => {
            let error = EngineError::phase_lifecycle(phase.number(), stage, e);
            watchdog.record_failure(
                format!("phase {}", phase.number()),
                error.to_string(),
                Arc::new(error.into()),
            );
            false
        }
    }
}
