use crate::core::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Which phase controller drives the nodes of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// One execution thread per node, polled by the watch loop
    #[default]
    MultiThread,
    /// All nodes run in topological order on the watchdog's own thread
    SingleThread,
}

/// Per-run configuration handed to a watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run identifier; generated when absent
    pub run_id: Option<String>,
    /// Phase controller selection
    pub scheduler: SchedulerMode,
    /// Telemetry emission interval in milliseconds; negative disables emission
    pub tracking_interval_ms: i64,
    /// Upper bound of a single inbox poll in the watch loop
    pub sleep_interval_ms: u64,
    /// Memory high-water mark is resampled every this many loop iterations
    pub memory_sample_ticks: u32,
    /// Minimum time between two flow (rate) computations
    pub min_flow_slice_ms: u64,
    /// Smoothing factor of the waiting-records moving average (0 < f <= 1)
    pub waiting_smoothing: f64,
    /// How long the phase epilogue waits for aborted nodes to stop
    pub abort_timeout_ms: u64,
    /// Attach the tracking logger to the run's notification bus
    pub print_tracking: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            scheduler: SchedulerMode::MultiThread,
            tracking_interval_ms: 2000,
            sleep_interval_ms: 100,
            memory_sample_ticks: 10,
            min_flow_slice_ms: 1000,
            waiting_smoothing: 0.5,
            abort_timeout_ms: 5000,
            print_tracking: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sleep_interval_ms == 0 {
            return Err(EngineError::configuration_field(
                "sleep_interval_ms must be greater than 0",
                "sleep_interval_ms",
                self.sleep_interval_ms,
            ));
        }
        if self.memory_sample_ticks == 0 {
            return Err(EngineError::configuration_field(
                "memory_sample_ticks must be greater than 0",
                "memory_sample_ticks",
                self.memory_sample_ticks,
            ));
        }
        if !(self.waiting_smoothing > 0.0 && self.waiting_smoothing <= 1.0) {
            return Err(EngineError::configuration_field(
                "waiting_smoothing must be in (0, 1]",
                "waiting_smoothing",
                self.waiting_smoothing,
            ));
        }
        if let Some(run_id) = &self.run_id {
            if run_id.trim().is_empty() {
                return Err(EngineError::configuration("run_id cannot be blank"));
            }
        }
        Ok(())
    }

    /// Quiet configuration for bulk runs: no periodic telemetry, no tables
    pub fn bulk() -> Self {
        Self {
            tracking_interval_ms: -1,
            print_tracking: false,
            ..Default::default()
        }
    }

    /// Fast-polling configuration for development and tests
    pub fn development() -> Self {
        Self {
            tracking_interval_ms: 200,
            sleep_interval_ms: 20,
            memory_sample_ticks: 5,
            min_flow_slice_ms: 100,
            abort_timeout_ms: 2000,
            ..Default::default()
        }
    }

    pub fn tracking_interval(&self) -> Option<Duration> {
        u64::try_from(self.tracking_interval_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn min_flow_slice(&self) -> Duration {
        Duration::from_millis(self.min_flow_slice_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    /// Freeze this configuration; the snapshot cannot be modified afterwards
    pub fn freeze(mut self) -> FrozenRuntimeConfig {
        if self.run_id.is_none() {
            self.run_id = Some(uuid::Uuid::new_v4().to_string());
        }
        FrozenRuntimeConfig {
            inner: Arc::new(self),
        }
    }
}

/// Read-only runtime configuration shared by a watchdog and its phase runners
#[derive(Debug, Clone)]
pub struct FrozenRuntimeConfig {
    inner: Arc<RuntimeConfig>,
}

impl FrozenRuntimeConfig {
    pub fn run_id(&self) -> &str {
        self.inner.run_id.as_deref().unwrap_or_default()
    }
}

impl Deref for FrozenRuntimeConfig {
    type Target = RuntimeConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Builder for RuntimeConfig
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.config.run_id = Some(run_id.into());
        self
    }

    pub fn scheduler(mut self, mode: SchedulerMode) -> Self {
        self.config.scheduler = mode;
        self
    }

    pub fn tracking_interval_ms(mut self, interval: i64) -> Self {
        self.config.tracking_interval_ms = interval;
        self
    }

    pub fn sleep_interval_ms(mut self, interval: u64) -> Self {
        self.config.sleep_interval_ms = interval;
        self
    }

    pub fn memory_sample_ticks(mut self, ticks: u32) -> Self {
        self.config.memory_sample_ticks = ticks;
        self
    }

    pub fn min_flow_slice_ms(mut self, slice: u64) -> Self {
        self.config.min_flow_slice_ms = slice;
        self
    }

    pub fn abort_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.abort_timeout_ms = timeout;
        self
    }

    pub fn print_tracking(mut self, enabled: bool) -> Self {
        self.config.print_tracking = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread manager implementation selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreadManagerMode {
    /// Fresh thread per submission, unlimited
    #[default]
    Simple,
    /// Three sized pools with admission accounting
    Pooled,
}

/// Thread pool sizing; `None` means a cached, unbounded pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub mode: ThreadManagerMode,
    pub watchdog_threads: Option<usize>,
    pub node_threads: Option<usize>,
    pub general_threads: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            mode: ThreadManagerMode::Simple,
            watchdog_threads: None,
            node_threads: None,
            general_threads: None,
        }
    }
}

impl ThreadConfig {
    pub fn validate(&self) -> Result<()> {
        let pools = [
            ("watchdog_threads", self.watchdog_threads),
            ("node_threads", self.node_threads),
            ("general_threads", self.general_threads),
        ];
        for (field, size) in pools {
            if size == Some(0) {
                return Err(EngineError::configuration_field(
                    "pool size must be greater than 0 when set",
                    field,
                    0,
                ));
            }
        }
        Ok(())
    }
}

/// Admission limits enforced by the graph executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorLimits {
    /// Maximum number of submitted runs waiting for a watchdog thread
    pub max_queued_runs: usize,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_queued_runs: 100,
        }
    }
}

impl ExecutorLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_queued_runs == 0 {
            return Err(EngineError::configuration_field(
                "max_queued_runs must be greater than 0",
                "max_queued_runs",
                0,
            ));
        }
        Ok(())
    }
}

/// Complete engine configuration, usually loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub threads: ThreadConfig,
    pub limits: ExecutorLimits,
    /// Defaults for runs submitted without an explicit runtime configuration
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.threads.validate()?;
        self.limits.validate()?;
        self.runtime.validate()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }
}
