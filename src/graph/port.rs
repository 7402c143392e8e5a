use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Direction of a port relative to its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Input,
    Output,
}

impl PortKind {
    pub fn label(&self) -> &'static str {
        match self {
            PortKind::Input => "In",
            PortKind::Output => "Out",
        }
    }
}

/// Live counters of one edge endpoint, provided by the edge implementation.
///
/// Record and byte counters must be monotonically increasing for the
/// duration of a phase. Reads happen from the watch loop while the owning
/// node writes, so implementations are expected to be lock-free.
pub trait Port: Send + Sync {
    /// Port index within its node
    fn index(&self) -> usize;

    /// Records passed through this port so far
    fn records(&self) -> u64;

    /// Bytes passed through this port so far
    fn bytes(&self) -> u64;

    /// Records currently buffered on the edge behind this port
    fn buffered_records(&self) -> u64 {
        0
    }

    /// Whether the other end of the edge lives in another run
    fn is_remote(&self) -> bool {
        false
    }

    /// Run id of the remote end, if any
    fn remote_run_id(&self) -> Option<String> {
        None
    }
}

/// Atomic counter port for node implementations that do their own buffering
#[derive(Debug, Default)]
pub struct CountingPort {
    index: usize,
    records: AtomicU64,
    bytes: AtomicU64,
    buffered: AtomicU64,
    remote_run_id: Option<String>,
}

impl CountingPort {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Mark this port as connected to an edge of another run
    pub fn remote(mut self, run_id: impl Into<String>) -> Self {
        self.remote_run_id = Some(run_id.into());
        self
    }

    /// Count one record of `bytes` size passing through the port
    pub fn record(&self, bytes: u64) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a batch of records
    pub fn record_batch(&self, records: u64, bytes: u64) {
        self.records.fetch_add(records, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_buffered(&self, records: u64) {
        self.buffered.store(records, Ordering::Relaxed);
    }
}

impl Port for CountingPort {
    fn index(&self) -> usize {
        self.index
    }

    fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn buffered_records(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    fn is_remote(&self) -> bool {
        self.remote_run_id.is_some()
    }

    fn remote_run_id(&self) -> Option<String> {
        self.remote_run_id.clone()
    }
}
