//! In-memory graph model consumed by the scheduler.
//!
//! Graphs are built by an external loader out of [`Phase`]s, each holding
//! [`Node`]s and the edges between them. The scheduler only reads the
//! topology; node behaviour and record buffering live behind the [`Node`]
//! and [`Port`] traits.

pub mod node;
pub mod phase;
pub mod port;

pub use node::{AbortSignal, Node, NodeContext};
pub use phase::{NoopPhaseLifecycle, Phase, PhaseLifecycle};
pub use port::{CountingPort, Port, PortKind};

use crate::core::config::RuntimeConfig;
use crate::core::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Result code of a node, a phase or a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ResultCode {
    Ready = 0,
    Running = 1,
    FinishedOk = 2,
    Error = 3,
    Aborted = 4,
}

/// Status of one watchdog run
pub type RunStatus = ResultCode;

impl ResultCode {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResultCode::FinishedOk | ResultCode::Error | ResultCode::Aborted
        )
    }

    pub fn message(&self) -> &'static str {
        match self {
            ResultCode::Ready => "READY",
            ResultCode::Running => "RUNNING",
            ResultCode::FinishedOk => "FINISHED_OK",
            ResultCode::Error => "ERROR",
            ResultCode::Aborted => "ABORTED",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ResultCode::Ready,
            1 => ResultCode::Running,
            2 => ResultCode::FinishedOk,
            3 => ResultCode::Error,
            _ => ResultCode::Aborted,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Atomic result code that never leaves a terminal value
#[derive(Debug)]
pub struct ResultCell(AtomicU8);

impl Default for ResultCell {
    fn default() -> Self {
        Self::new(ResultCode::Ready)
    }
}

impl ResultCell {
    pub fn new(code: ResultCode) -> Self {
        Self(AtomicU8::new(code as u8))
    }

    pub fn get(&self) -> ResultCode {
        ResultCode::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from exactly `from` to `to`
    pub fn compare_and_set(&self, from: ResultCode, to: ResultCode) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` unless a terminal code is already set
    pub fn transition(&self, to: ResultCode) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if ResultCode::from_u8(current).is_terminal() {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok()
    }
}

/// Directed connection between two nodes of one phase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Graph-level hooks around the whole run; all default to no-ops
#[async_trait]
pub trait GraphLifecycle: Send + Sync {
    async fn pre_execute(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_execute(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after the last phase finished OK
    async fn commit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after any phase failed or was aborted
    async fn rollback(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Advisory resource reclamation between phases
    fn reclaim(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopGraphLifecycle;

impl GraphLifecycle for NoopGraphLifecycle {}

/// A complete graph: phases in ascending order
pub struct Graph {
    id: String,
    name: String,
    phases: Vec<Phase>,
    lifecycle: Arc<dyn GraphLifecycle>,
    initialized: AtomicBool,
}

impl Graph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phases: Vec::new(),
            lifecycle: Arc::new(NoopGraphLifecycle),
            initialized: AtomicBool::new(false),
        }
    }

    /// Add a phase; phases are kept sorted by number
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self.phases.sort_by_key(|p| p.number());
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn GraphLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, number: i32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.number() == number)
    }

    pub fn lifecycle(&self) -> &Arc<dyn GraphLifecycle> {
        &self.lifecycle
    }

    pub fn node_count(&self) -> usize {
        self.phases.iter().map(|p| p.nodes().len()).sum()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Validate the graph against a run configuration.
    ///
    /// The configuration is checked on every call, the graph structure only once.
    pub fn init(&self, config: &RuntimeConfig) -> Result<()> {
        config.validate()?;
        if self.is_initialized() {
            return Ok(());
        }

        let mut seen_phases = HashSet::new();
        let mut seen_nodes = HashSet::new();
        for phase in &self.phases {
            if !seen_phases.insert(phase.number()) {
                return Err(EngineError::validation_element(
                    "duplicate phase number",
                    format!("phase {}", phase.number()),
                ));
            }
            for node in phase.nodes() {
                if !seen_nodes.insert(node.id().to_string()) {
                    return Err(EngineError::validation_element(
                        "node id used more than once in the graph",
                        node.id(),
                    ));
                }
            }
            phase.validate()?;
        }

        self.initialized.store(true, Ordering::Release);
        debug!(graph_id = %self.id, phases = self.phases.len(), "Graph initialized");
        Ok(())
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("phases", &self.phases)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
