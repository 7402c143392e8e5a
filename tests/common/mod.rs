#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use phaseflow::{CountingPort, Node, NodeContext, Port, RuntimeConfig, SchedulerMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Fast polling, no periodic telemetry, no console tables
pub fn quiet_config() -> RuntimeConfig {
    RuntimeConfig::builder()
        .tracking_interval_ms(-1)
        .sleep_interval_ms(5)
        .abort_timeout_ms(1000)
        .print_tracking(false)
        .build()
        .unwrap()
}

pub fn single_thread_config() -> RuntimeConfig {
    RuntimeConfig::builder()
        .scheduler(SchedulerMode::SingleThread)
        .tracking_interval_ms(-1)
        .print_tracking(false)
        .build()
        .unwrap()
}

/// Emits `records` records of `record_size` bytes, then optionally lingers
pub struct Generator {
    pub id: String,
    pub output: Arc<CountingPort>,
    pub records: u64,
    pub record_size: u64,
    pub linger: Duration,
}

impl Generator {
    pub fn new(id: &str, records: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            output: Arc::new(CountingPort::new(0)),
            records,
            record_size: 10,
            linger: Duration::ZERO,
        })
    }

    pub fn lingering(id: &str, records: u64, linger: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            output: Arc::new(CountingPort::new(0)),
            records,
            record_size: 10,
            linger,
        })
    }
}

#[async_trait]
impl Node for Generator {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_ports(&self) -> Vec<Arc<dyn Port>> {
        vec![self.output.clone()]
    }

    async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        for i in 0..self.records {
            self.output.record(self.record_size);
            if i % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }
        if !self.linger.is_zero() {
            tokio::time::sleep(self.linger).await;
        }
        Ok(())
    }
}

/// Emits `records` records, then waits to be aborted
pub struct Stalling {
    pub id: String,
    pub output: Arc<CountingPort>,
    pub records: u64,
    pub started: Arc<Notify>,
    pub aborted: Arc<AtomicBool>,
}

impl Stalling {
    pub fn new(id: &str, records: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            output: Arc::new(CountingPort::new(0)),
            records,
            started: Arc::new(Notify::new()),
            aborted: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Node for Stalling {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_ports(&self) -> Vec<Arc<dyn Port>> {
        vec![self.output.clone()]
    }

    async fn execute(&self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.output.record_batch(self.records, self.records * 10);
        self.started.notify_one();
        ctx.aborted().await;
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Fails once `watched` has seen at least `threshold` records
pub struct FailingAfter {
    pub id: String,
    pub watched: Option<Arc<CountingPort>>,
    pub threshold: u64,
}

impl FailingAfter {
    pub fn new(id: &str, watched: Option<Arc<CountingPort>>, threshold: u64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            watched,
            threshold,
        })
    }
}

#[async_trait]
impl Node for FailingAfter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        if let Some(port) = &self.watched {
            while port.records() < self.threshold {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        anyhow::bail!("{} rejected its input", self.id)
    }
}

/// Appends its id to a shared journal when executed
pub struct Recorder {
    pub id: String,
    pub journal: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new(id: &str, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: journal.clone(),
        })
    }
}

#[async_trait]
impl Node for Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn pre_execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        self.journal.lock().push(format!("pre:{}", self.id));
        Ok(())
    }

    async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        self.journal.lock().push(self.id.clone());
        Ok(())
    }
}
