//! Run notifications for external monitors
//!
//! Provides typed lifecycle and telemetry events, numbered per run

use crate::tracking::{GraphTracking, PhaseTrackingDetail};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Run event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    GraphStarted {
        graph_id: String,
        graph_name: String,
    },
    PhaseStarted {
        phase: i32,
    },
    TrackingUpdated {
        phase: PhaseTrackingDetail,
    },
    PhaseFinished {
        phase: PhaseTrackingDetail,
    },
    PhaseAborted {
        phase: PhaseTrackingDetail,
    },
    PhaseError {
        phase: PhaseTrackingDetail,
        error: String,
    },
    GraphFinished {
        tracking: GraphTracking,
    },
    GraphAborted {
        tracking: GraphTracking,
    },
    GraphError {
        tracking: GraphTracking,
        error: String,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::GraphStarted { .. } => "GRAPH_STARTED",
            RunEvent::PhaseStarted { .. } => "PHASE_STARTED",
            RunEvent::TrackingUpdated { .. } => "TRACKING_UPDATED",
            RunEvent::PhaseFinished { .. } => "PHASE_FINISHED",
            RunEvent::PhaseAborted { .. } => "PHASE_ABORTED",
            RunEvent::PhaseError { .. } => "PHASE_ERROR",
            RunEvent::GraphFinished { .. } => "GRAPH_FINISHED",
            RunEvent::GraphAborted { .. } => "GRAPH_ABORTED",
            RunEvent::GraphError { .. } => "GRAPH_ERROR",
        }
    }

    pub fn is_graph_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::GraphFinished { .. } | RunEvent::GraphAborted { .. } | RunEvent::GraphError { .. }
        )
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize)]
pub struct RunEventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: u64,
    pub event: RunEvent,
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    /// Emit an event; must not block the watch loop
    fn emit(&self, envelope: &RunEventEnvelope);
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: Arc<parking_lot::RwLock<Vec<RunEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<RunEventEnvelope> {
        self.events.read().clone()
    }

    /// Event kinds in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.event.kind()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Fans events out to async subscribers, dropping the oldest when a
/// subscriber falls behind
pub struct BroadcastEventSink {
    tx: async_broadcast::Sender<RunEventEnvelope>,
    // keeps the channel open while nobody is subscribed
    _keepalive: async_broadcast::InactiveReceiver<RunEventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity);
        tx.set_overflow(true); // Drop oldest messages when full
        Self {
            tx,
            _keepalive: rx.deactivate(),
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<RunEventEnvelope> {
        self.tx.new_receiver()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, envelope: &RunEventEnvelope) {
        if let Err(e) = self.tx.try_broadcast(envelope.clone()) {
            tracing::trace!("Broadcast of {} skipped: {}", envelope.event.kind(), e);
        }
    }
}

/// Per-run notification bus; sequence numbers increase monotonically per run
pub struct NotificationBus {
    run_id: String,
    sequence: AtomicU64,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl NotificationBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            sequence: AtomicU64::new(0),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Get the next event sequence number
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn emit(&self, event: RunEvent) {
        let envelope = RunEventEnvelope {
            version: 1,
            sequence: self.next_sequence(),
            run_id: self.run_id.clone(),
            timestamp: now_ms(),
            event,
        };
        for sink in &self.sinks {
            sink.emit(&envelope);
        }
    }
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
