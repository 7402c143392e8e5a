// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod limits;
    pub mod logging;
}

// Graph model and the scheduler around it
pub mod graph;       // Graph, Phase, Node and Port collaborators
pub mod messaging;   // Node/scheduler message passing
pub mod tracking;    // Port/node/phase telemetry
pub mod events;      // Run notifications
pub mod context;     // Task-local run context
pub mod threads;     // Thread managers
pub mod watchdog;    // Phase-by-phase run driver
pub mod engine;      // Engine bootstrap
pub mod executor;    // Admission control and run submission

// Re-exports for convenience
pub use crate::core::config::{
    EngineConfig, ExecutorLimits, RuntimeConfig, SchedulerMode, ThreadConfig, ThreadManagerMode,
};
pub use crate::core::errors::{EngineError, Result};
pub use crate::core::limits::{AdmissionStats, AdmissionTracker};
pub use crate::core::logging::init_tracing;
pub use engine::{Engine, EngineContext};
pub use events::{
    BroadcastEventSink, BufferingEventSink, EventSink, NotificationBus, RunEvent, RunEventEnvelope,
};
pub use executor::{GraphExecutor, RunHandle, RunRequest};
pub use graph::{
    AbortSignal, CountingPort, Graph, GraphLifecycle, Node, NodeContext, Phase, PhaseLifecycle,
    Port, PortKind, ResultCode, RunStatus,
};
pub use threads::{PooledThreadManager, SimpleThreadManager, ThreadManager};
pub use tracking::{GraphTracking, NodeTrackingDetail, PhaseTrackingDetail, PortTrackingDetail};
pub use watchdog::{FailureCause, RunOutcome, Watchdog};
