use crate::core::config::ExecutorLimits;
use crate::core::errors::{EngineError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Admission accounting shared by all submissions of one graph executor
#[derive(Debug)]
pub struct AdmissionTracker {
    limits: ExecutorLimits,

    // Current usage counters
    queued_runs: AtomicUsize,
    running_runs: AtomicUsize,
    running_nodes: AtomicUsize,

    // Statistics
    peak_queued_runs: AtomicUsize,
    peak_running_nodes: AtomicUsize,
    total_runs_submitted: AtomicU64,
    total_rejections: AtomicU64,
}

impl AdmissionTracker {
    pub fn new(limits: ExecutorLimits) -> Result<Arc<Self>> {
        limits.validate()?;

        Ok(Arc::new(Self {
            limits,
            queued_runs: AtomicUsize::new(0),
            running_runs: AtomicUsize::new(0),
            running_nodes: AtomicUsize::new(0),
            peak_queued_runs: AtomicUsize::new(0),
            peak_running_nodes: AtomicUsize::new(0),
            total_runs_submitted: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }))
    }

    /// Admit a run into the queue, failing when the queue is already full
    pub fn enqueue_run(self: &Arc<Self>) -> Result<QueuedRun> {
        let max = self.limits.max_queued_runs;
        let admitted = self
            .queued_runs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max).then_some(queued + 1)
            });

        match admitted {
            Ok(previous) => {
                self.peak_queued_runs
                    .fetch_max(previous + 1, Ordering::Relaxed);
                self.total_runs_submitted.fetch_add(1, Ordering::Relaxed);
                debug!("Run queued, queued runs: {}", previous + 1);
                Ok(QueuedRun {
                    tracker: Arc::clone(self),
                    started: false,
                })
            }
            Err(current) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejecting run: {} runs already queued (limit {})",
                    current, max
                );
                Err(EngineError::resource_exhausted(
                    "queued_runs",
                    current as u64 + 1,
                    max as u64,
                ))
            }
        }
    }

    /// Count a directly submitted node task until the returned guard drops
    pub fn start_node(self: &Arc<Self>) -> RunningNode {
        let current = self.running_nodes.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running_nodes.fetch_max(current, Ordering::Relaxed);
        RunningNode {
            tracker: Arc::clone(self),
        }
    }

    pub fn queued_runs(&self) -> usize {
        self.queued_runs.load(Ordering::Acquire)
    }

    pub fn running_runs(&self) -> usize {
        self.running_runs.load(Ordering::Acquire)
    }

    pub fn running_nodes(&self) -> usize {
        self.running_nodes.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// Get current admission statistics
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            queued_runs: self.queued_runs.load(Ordering::Relaxed),
            running_runs: self.running_runs.load(Ordering::Relaxed),
            running_nodes: self.running_nodes.load(Ordering::Relaxed),
            peak_queued_runs: self.peak_queued_runs.load(Ordering::Relaxed),
            peak_running_nodes: self.peak_running_nodes.load(Ordering::Relaxed),
            total_runs_submitted: self.total_runs_submitted.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Saturating decrement; the counters never wrap below zero
fn release(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// RAII ticket of a run waiting for its watchdog thread
#[derive(Debug)]
pub struct QueuedRun {
    tracker: Arc<AdmissionTracker>,
    started: bool,
}

impl QueuedRun {
    /// The watchdog got a thread: move the run from queued to running
    pub fn start(mut self) -> RunningRun {
        self.started = true;
        release(&self.tracker.queued_runs);
        self.tracker.running_runs.fetch_add(1, Ordering::AcqRel);
        RunningRun {
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl Drop for QueuedRun {
    fn drop(&mut self) {
        if !self.started {
            release(&self.tracker.queued_runs);
        }
    }
}

/// RAII marker of a running watchdog
#[derive(Debug)]
pub struct RunningRun {
    tracker: Arc<AdmissionTracker>,
}

impl Drop for RunningRun {
    fn drop(&mut self) {
        release(&self.tracker.running_runs);
    }
}

/// RAII marker of a directly submitted node task
#[derive(Debug)]
pub struct RunningNode {
    tracker: Arc<AdmissionTracker>,
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        release(&self.tracker.running_nodes);
    }
}

/// Admission statistics
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub queued_runs: usize,
    pub running_runs: usize,
    pub running_nodes: usize,
    pub peak_queued_runs: usize,
    pub peak_running_nodes: usize,
    pub total_runs_submitted: u64,
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_queued_runs: usize) -> Arc<AdmissionTracker> {
        AdmissionTracker::new(ExecutorLimits { max_queued_runs }).unwrap()
    }

    #[test]
    fn test_limits_validation() {
        assert!(AdmissionTracker::new(ExecutorLimits { max_queued_runs: 0 }).is_err());
    }

    #[test]
    fn test_queue_limit() {
        let tracker = tracker(2);
        let first = tracker.enqueue_run().unwrap();
        let _second = tracker.enqueue_run().unwrap();
        assert_eq!(tracker.queued_runs(), 2);

        let err = tracker.enqueue_run().unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhaustion { .. }));
        assert_eq!(tracker.stats().total_rejections, 1);

        // Starting a run frees a queue slot
        let running = first.start();
        assert_eq!(tracker.queued_runs(), 1);
        assert_eq!(tracker.running_runs(), 1);
        assert!(tracker.enqueue_run().is_ok());

        drop(running);
        assert_eq!(tracker.running_runs(), 0);
    }

    #[test]
    fn test_dropped_ticket_releases_slot() {
        let tracker = tracker(1);
        let ticket = tracker.enqueue_run().unwrap();
        drop(ticket);
        assert_eq!(tracker.queued_runs(), 0);
        assert!(tracker.enqueue_run().is_ok());
    }

    #[test]
    fn test_running_nodes() {
        let tracker = tracker(1);
        let a = tracker.start_node();
        let b = tracker.start_node();
        assert_eq!(tracker.running_nodes(), 2);
        drop(a);
        drop(b);
        assert_eq!(tracker.running_nodes(), 0);
        assert_eq!(tracker.stats().peak_running_nodes, 2);
    }

    #[test]
    fn test_concurrent_enqueue_never_exceeds_limit() {
        let tracker = tracker(8);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.enqueue_run().ok().map(std::mem::forget))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(admitted, 8);
        assert_eq!(tracker.queued_runs(), 8);
    }
}
