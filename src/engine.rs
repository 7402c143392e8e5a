use crate::core::config::{EngineConfig, ThreadManagerMode};
use crate::core::errors::Result;
use crate::core::limits::AdmissionTracker;
use crate::threads::{PooledThreadManager, SimpleThreadManager, ThreadManager};
use std::sync::Arc;
use tracing::info;

/// Engine bootstrap
pub struct Engine;

impl Engine {
    /// Validate the configuration and build the shared services.
    ///
    /// Every call yields an independent context; nothing is stored globally.
    pub fn init(config: EngineConfig) -> Result<EngineContext> {
        config.validate()?;
        let threads: Arc<dyn ThreadManager> = match config.threads.mode {
            ThreadManagerMode::Simple => Arc::new(SimpleThreadManager::new()),
            ThreadManagerMode::Pooled => Arc::new(PooledThreadManager::new(&config.threads)?),
        };
        info!(
            mode = ?config.threads.mode,
            max_queued_runs = config.limits.max_queued_runs,
            "Engine initialized"
        );
        EngineContext::new(config, threads)
    }
}

/// Result of engine initialisation, handed to everything that schedules runs
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    threads: Arc<dyn ThreadManager>,
    admission: Arc<AdmissionTracker>,
}

impl EngineContext {
    /// Build a context around an already constructed thread manager
    pub fn new(config: EngineConfig, threads: Arc<dyn ThreadManager>) -> Result<Self> {
        let admission = AdmissionTracker::new(config.limits.clone())?;
        Ok(Self {
            config: Arc::new(config),
            threads,
            admission,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn threads(&self) -> &Arc<dyn ThreadManager> {
        &self.threads
    }

    pub fn admission(&self) -> &Arc<AdmissionTracker> {
        &self.admission
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("admission", &self.admission.stats())
            .finish()
    }
}
