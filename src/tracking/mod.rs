//! Sampled performance details of a running graph.
//!
//! Details are owned and mutated by the watch loop only; everything else
//! works on cloned snapshots.

pub mod logger;

pub use logger::TrackingLogger;

use crate::core::config::RuntimeConfig;
use crate::graph::{Graph, Node, Phase, Port, PortKind, ResultCode};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Accumulated time a node's future spent being polled
#[derive(Debug, Clone, Default)]
pub struct CpuClock(Arc<AtomicU64>);

impl CpuClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nanos(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.0.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Future wrapper charging every poll to a [`CpuClock`]
pub struct Metered<'a, T> {
    inner: BoxFuture<'a, T>,
    clock: CpuClock,
}

impl<T> Future for Metered<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let started = Instant::now();
        let result = self.inner.as_mut().poll(cx);
        self.clock.add(started.elapsed());
        result
    }
}

pub fn metered<'a, F>(future: F, clock: CpuClock) -> Metered<'a, F::Output>
where
    F: Future + Send + 'a,
{
    Metered {
        inner: Box::pin(future),
        clock,
    }
}

/// Live view of one scheduled node used by the sampling tick
pub trait NodeProbe {
    fn node(&self) -> &Arc<dyn Node>;
    fn result(&self) -> ResultCode;
    fn cpu_nanos(&self) -> u64;
}

impl<P: NodeProbe> NodeProbe for Arc<P> {
    fn node(&self) -> &Arc<dyn Node> {
        (**self).node()
    }

    fn result(&self) -> ResultCode {
        (**self).result()
    }

    fn cpu_nanos(&self) -> u64 {
        (**self).cpu_nanos()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortTrackingDetail {
    pub index: usize,
    pub kind: PortKind,
    pub total_records: u64,
    pub total_bytes: u64,
    /// records/s
    pub record_flow: u64,
    pub record_peak: u64,
    /// bytes/s
    pub byte_flow: u64,
    pub byte_peak: u64,
    pub waiting_records: u64,
    pub avg_waiting_records: f64,
    pub remote_run_id: Option<String>,
    #[serde(skip)]
    last_flow_sample: Instant,
    #[serde(skip)]
    last_records: u64,
    #[serde(skip)]
    last_bytes: u64,
    #[serde(skip)]
    sampled: bool,
}

impl PortTrackingDetail {
    pub fn new(index: usize, kind: PortKind, started: Instant) -> Self {
        Self {
            index,
            kind,
            total_records: 0,
            total_bytes: 0,
            record_flow: 0,
            record_peak: 0,
            byte_flow: 0,
            byte_peak: 0,
            waiting_records: 0,
            avg_waiting_records: 0.0,
            remote_run_id: None,
            last_flow_sample: started,
            last_records: 0,
            last_bytes: 0,
            sampled: false,
        }
    }

    pub fn gather(&mut self, port: &dyn Port, now: Instant, config: &RuntimeConfig) {
        // ports are monotonic, but never let a misbehaving one move totals back
        let records = port.records().max(self.total_records);
        let bytes = port.bytes().max(self.total_bytes);

        let slice = now.saturating_duration_since(self.last_flow_sample);
        if slice >= config.min_flow_slice() {
            let millis = (slice.as_millis() as u64).max(1);
            self.record_flow = (records - self.last_records) * 1000 / millis;
            self.byte_flow = (bytes - self.last_bytes) * 1000 / millis;
            self.record_peak = self.record_peak.max(self.record_flow);
            self.byte_peak = self.byte_peak.max(self.byte_flow);
            self.last_flow_sample = now;
            self.last_records = records;
            self.last_bytes = bytes;
        }

        self.total_records = records;
        self.total_bytes = bytes;

        let waiting = port.buffered_records();
        self.avg_waiting_records = if self.sampled {
            let f = config.waiting_smoothing;
            f * waiting as f64 + (1.0 - f) * self.avg_waiting_records
        } else {
            waiting as f64
        };
        self.waiting_records = waiting;
        self.sampled = true;

        if port.is_remote() {
            self.remote_run_id = port.remote_run_id();
        }
    }

    /// Replace instantaneous flows by whole-phase averages
    pub fn phase_finished(&mut self, execution_time_ms: u64) {
        if execution_time_ms > 0 {
            self.record_flow = self.total_records * 1000 / execution_time_ms;
            self.byte_flow = self.total_bytes * 1000 / execution_time_ms;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeTrackingDetail {
    pub node_id: String,
    pub node_name: String,
    pub phase: i32,
    pub result: ResultCode,
    pub input_ports: Vec<PortTrackingDetail>,
    pub output_ports: Vec<PortTrackingDetail>,
    pub total_cpu_nanos: u64,
    pub total_user_nanos: u64,
    /// fraction of phase wall time
    pub usage_cpu: f64,
    pub peak_usage_cpu: f64,
    pub usage_user: f64,
    pub peak_usage_user: f64,
    pub used_memory: u64,
}

impl NodeTrackingDetail {
    pub fn new(node: &dyn Node, phase: i32, started: Instant) -> Self {
        let ports = |ports: Vec<Arc<dyn Port>>, kind: PortKind| -> Vec<PortTrackingDetail> {
            ports
                .iter()
                .map(|p| PortTrackingDetail::new(p.index(), kind, started))
                .collect()
        };
        Self {
            node_id: node.id().to_string(),
            node_name: node.name().to_string(),
            phase,
            result: ResultCode::Ready,
            input_ports: ports(node.input_ports(), PortKind::Input),
            output_ports: ports(node.output_ports(), PortKind::Output),
            total_cpu_nanos: 0,
            total_user_nanos: 0,
            usage_cpu: 0.0,
            peak_usage_cpu: 0.0,
            usage_user: 0.0,
            peak_usage_user: 0.0,
            used_memory: 0,
        }
    }

    /// Refresh from live counters; failed and aborted nodes stay frozen
    pub fn gather(
        &mut self,
        probe: &dyn NodeProbe,
        phase_elapsed: Duration,
        now: Instant,
        config: &RuntimeConfig,
    ) {
        self.result = probe.result();
        if !matches!(self.result, ResultCode::Running | ResultCode::FinishedOk) {
            return;
        }

        let node = probe.node();
        for (detail, port) in self.input_ports.iter_mut().zip(node.input_ports()) {
            detail.gather(port.as_ref(), now, config);
        }
        for (detail, port) in self.output_ports.iter_mut().zip(node.output_ports()) {
            detail.gather(port.as_ref(), now, config);
        }

        let cpu = probe.cpu_nanos().max(self.total_cpu_nanos);
        self.total_cpu_nanos = cpu;
        self.total_user_nanos = cpu;

        let elapsed = phase_elapsed.as_nanos().max(1) as f64;
        self.usage_cpu = cpu as f64 / elapsed;
        self.usage_user = self.usage_cpu;
        self.peak_usage_cpu = self.peak_usage_cpu.max(self.usage_cpu);
        self.peak_usage_user = self.peak_usage_user.max(self.usage_user);

        self.used_memory = node.used_memory();
    }

    pub fn phase_finished(&mut self, execution_time_ms: u64) {
        for port in self.input_ports.iter_mut().chain(self.output_ports.iter_mut()) {
            port.phase_finished(execution_time_ms);
        }
    }

    pub fn port(&self, kind: PortKind, index: usize) -> Option<&PortTrackingDetail> {
        let ports = match kind {
            PortKind::Input => &self.input_ports,
            PortKind::Output => &self.output_ports,
        };
        ports.iter().find(|p| p.index == index)
    }

    pub fn total_output_records(&self) -> u64 {
        self.output_ports.iter().map(|p| p.total_records).sum()
    }

    pub fn total_input_records(&self) -> u64 {
        self.input_ports.iter().map(|p| p.total_records).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseTrackingDetail {
    pub phase: i32,
    pub result: ResultCode,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    /// peak of the summed node memory, bytes
    pub memory_utilization: u64,
    pub nodes: Vec<NodeTrackingDetail>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl PhaseTrackingDetail {
    pub fn new(phase: &Phase) -> Self {
        let now = Instant::now();
        Self {
            phase: phase.number(),
            result: ResultCode::Ready,
            start_time: None,
            end_time: None,
            execution_time_ms: 0,
            memory_utilization: 0,
            nodes: phase
                .nodes()
                .iter()
                .map(|n| NodeTrackingDetail::new(n.as_ref(), phase.number(), now))
                .collect(),
            started: None,
        }
    }

    pub fn start(&mut self) {
        let now = Instant::now();
        self.start_time = Some(Utc::now());
        self.started = Some(now);
        self.result = ResultCode::Running;
        for node in &mut self.nodes {
            for port in node.input_ports.iter_mut().chain(node.output_ports.iter_mut()) {
                port.last_flow_sample = now;
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn gather<P: NodeProbe>(&mut self, probes: &[P], config: &RuntimeConfig) {
        let now = Instant::now();
        let elapsed = self.elapsed();
        for detail in &mut self.nodes {
            if let Some(probe) = probes.iter().find(|p| p.node().id() == detail.node_id) {
                detail.gather(probe, elapsed, now, config);
            }
        }
        self.execution_time_ms = elapsed.as_millis() as u64;
    }

    /// Resample the memory high-water mark
    pub fn sample_memory<P: NodeProbe>(&mut self, probes: &[P]) {
        let used: u64 = probes.iter().map(|p| p.node().used_memory()).sum();
        self.memory_utilization = self.memory_utilization.max(used);
    }

    /// Close the phase: fix timing and switch flows to whole-phase averages
    pub fn phase_finished(&mut self, result: ResultCode) {
        self.result = result;
        self.end_time = Some(Utc::now());
        self.execution_time_ms = self.elapsed().as_millis() as u64;
        for node in &mut self.nodes {
            node.phase_finished(self.execution_time_ms);
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeTrackingDetail> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphTracking {
    pub graph_id: String,
    pub graph_name: String,
    pub run_id: String,
    pub result: ResultCode,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    pub running_phase: Option<i32>,
    pub phases: Vec<PhaseTrackingDetail>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl GraphTracking {
    pub fn new(graph: &Graph, run_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph.id().to_string(),
            graph_name: graph.name().to_string(),
            run_id: run_id.into(),
            result: ResultCode::Ready,
            start_time: None,
            end_time: None,
            execution_time_ms: 0,
            running_phase: None,
            phases: Vec::new(),
            started: None,
        }
    }

    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
        self.started = Some(Instant::now());
        self.result = ResultCode::Running;
    }

    /// Store the latest snapshot of a phase, appending it on first sight
    pub fn update_phase(&mut self, detail: &PhaseTrackingDetail) {
        if !detail.result.is_terminal() {
            self.running_phase = Some(detail.phase);
        } else if self.running_phase == Some(detail.phase) {
            self.running_phase = None;
        }
        match self.phases.iter_mut().find(|p| p.phase == detail.phase) {
            Some(existing) => *existing = detail.clone(),
            None => self.phases.push(detail.clone()),
        }
        self.refresh_time();
    }

    pub fn finish(&mut self, result: ResultCode) {
        self.result = result;
        self.end_time = Some(Utc::now());
        self.running_phase = None;
        self.refresh_time();
    }

    fn refresh_time(&mut self) {
        if let Some(started) = self.started {
            self.execution_time_ms = started.elapsed().as_millis() as u64;
        }
    }

    pub fn phase(&self, number: i32) -> Option<&PhaseTrackingDetail> {
        self.phases.iter().find(|p| p.phase == number)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeTrackingDetail> {
        self.phases.iter().find_map(|p| p.node(node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CountingPort, NodeContext};
    use async_trait::async_trait;

    struct Producer {
        port: Arc<CountingPort>,
    }

    #[async_trait]
    impl Node for Producer {
        fn id(&self) -> &str {
            "producer"
        }

        fn output_ports(&self) -> Vec<Arc<dyn Port>> {
            vec![self.port.clone()]
        }

        async fn execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn used_memory(&self) -> u64 {
            4096
        }
    }

    struct Probe {
        node: Arc<dyn Node>,
        result: ResultCode,
        cpu: u64,
    }

    impl NodeProbe for Probe {
        fn node(&self) -> &Arc<dyn Node> {
            &self.node
        }

        fn result(&self) -> ResultCode {
            self.result
        }

        fn cpu_nanos(&self) -> u64 {
            self.cpu
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            min_flow_slice_ms: 0,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_port_flow_and_totals() {
        let port = CountingPort::new(0);
        let start = Instant::now();
        let mut detail = PortTrackingDetail::new(0, PortKind::Output, start);
        let config = RuntimeConfig {
            min_flow_slice_ms: 1000,
            ..RuntimeConfig::default()
        };

        port.record_batch(500, 5000);
        // inside the minimum slice: totals move, flow does not
        detail.gather(&port, start + Duration::from_millis(10), &config);
        assert_eq!(detail.total_records, 500);
        assert_eq!(detail.record_flow, 0);

        port.record_batch(500, 5000);
        detail.gather(&port, start + Duration::from_millis(2000), &config);
        assert_eq!(detail.total_records, 1000);
        assert_eq!(detail.record_flow, 500);
        assert_eq!(detail.byte_flow, 5000);
        assert_eq!(detail.record_peak, 500);

        detail.phase_finished(4000);
        assert_eq!(detail.record_flow, 250);
        assert_eq!(detail.record_peak, 500);
    }

    #[test]
    fn test_waiting_average() {
        let port = CountingPort::new(0);
        let mut detail = PortTrackingDetail::new(0, PortKind::Input, Instant::now());
        let config = config();

        port.set_buffered(10);
        detail.gather(&port, Instant::now(), &config);
        assert_eq!(detail.avg_waiting_records, 10.0);

        port.set_buffered(20);
        detail.gather(&port, Instant::now(), &config);
        assert_eq!(detail.waiting_records, 20);
        assert_eq!(detail.avg_waiting_records, 15.0);
    }

    #[test]
    fn test_node_frozen_after_failure() {
        let port = Arc::new(CountingPort::new(0));
        let node: Arc<dyn Node> = Arc::new(Producer { port: port.clone() });
        let mut detail = NodeTrackingDetail::new(node.as_ref(), 0, Instant::now());
        let config = config();

        port.record_batch(100, 1000);
        let running = Probe {
            node: node.clone(),
            result: ResultCode::Running,
            cpu: 50,
        };
        detail.gather(&running, Duration::from_nanos(100), Instant::now(), &config);
        assert_eq!(detail.total_output_records(), 100);
        assert_eq!(detail.total_input_records(), 0);
        assert_eq!(detail.usage_cpu, 0.5);
        assert_eq!(detail.used_memory, 4096);

        port.record_batch(100, 1000);
        let aborted = Probe {
            node,
            result: ResultCode::Aborted,
            cpu: 90,
        };
        detail.gather(&aborted, Duration::from_nanos(200), Instant::now(), &config);
        assert_eq!(detail.result, ResultCode::Aborted);
        assert_eq!(detail.total_output_records(), 100);
        assert_eq!(detail.total_cpu_nanos, 50);
    }

    #[test]
    fn test_phase_memory_peak() {
        let port = Arc::new(CountingPort::new(0));
        let node: Arc<dyn Node> = Arc::new(Producer { port });
        let phase = Phase::new(3).with_node(node.clone());
        let mut detail = PhaseTrackingDetail::new(&phase);
        detail.start();

        let probes = vec![Probe {
            node,
            result: ResultCode::Running,
            cpu: 0,
        }];
        detail.sample_memory(&probes);
        assert_eq!(detail.memory_utilization, 4096);

        detail.phase_finished(ResultCode::FinishedOk);
        assert!(detail.end_time.is_some());
        assert_eq!(detail.result, ResultCode::FinishedOk);
    }

    #[tokio::test]
    async fn test_metered_future_accumulates_poll_time() {
        let clock = CpuClock::new();
        metered(
            async {
                let started = Instant::now();
                while started.elapsed() < Duration::from_millis(5) {
                    std::hint::spin_loop();
                }
            },
            clock.clone(),
        )
        .await;
        assert!(clock.nanos() >= 5_000_000);
    }
}
