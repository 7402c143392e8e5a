use crate::context::RunContext;
use crate::core::errors::EngineError;
use crate::events::RunEvent;
use crate::graph::{Phase, ResultCode};
use crate::messaging::{self, Inbox, Message, MessageType, Outbox};
use crate::threads::ExecutionHandle;
use crate::tracking::PhaseTrackingDetail;
use crate::watchdog::node_task::{run_node, NodeRuntime};
use crate::watchdog::{phase_step, PhaseRunner, Watchdog};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tracing::{debug, error, info, trace, warn};

/// One task per node; the watchdog runs the watch loop until every leaf ends
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrentPhaseRunner;

/// Live state of one phase under the watch loop
struct PhaseRun<'a> {
    watchdog: &'a Watchdog,
    phase: &'a Phase,
    runtimes: Vec<Arc<NodeRuntime>>,
    handles: Vec<ExecutionHandle<()>>,
    tracking: PhaseTrackingDetail,
}

#[async_trait]
impl PhaseRunner for ConcurrentPhaseRunner {
    fn name(&self) -> &'static str {
        "multi-thread"
    }

    async fn run_phase(&self, watchdog: &Watchdog, phase: &Phase) -> ResultCode {
        let mut tracking = PhaseTrackingDetail::new(phase);
        tracking.start();
        watchdog.update_phase_tracking(&tracking);

        let lifecycle = phase.lifecycle().clone();
        if !phase_step(watchdog, phase, "initialization", lifecycle.init()).await
            || !phase_step(watchdog, phase, "pre-execute initialization", lifecycle.pre_execute()).await
        {
            lifecycle.free().await;
            tracking.phase_finished(ResultCode::Error);
            watchdog.update_phase_tracking(&tracking);
            return ResultCode::Error;
        }

        let runtimes: Vec<Arc<NodeRuntime>> =
            phase.nodes().iter().cloned().map(NodeRuntime::new).collect();
        watchdog.set_current_nodes(runtimes.clone());
        let mut run = PhaseRun {
            watchdog,
            phase,
            runtimes,
            handles: Vec::new(),
            tracking,
        };

        let (messenger, mut inbox) = messaging::channel();
        let mut outbox = Outbox::new();
        let mut result = match run.start_nodes(messenger, &mut outbox).await {
            Ok(true) => run.watch(&mut inbox, &outbox).await,
            Ok(false) => {
                warn!(run_id = %watchdog.run_id(), phase = phase.number(), "Aborted while waiting for node threads");
                ResultCode::Aborted
            }
            Err(e) => {
                watchdog.record_failure(
                    format!("phase {}", phase.number()),
                    "Node start-up failed",
                    Arc::new(anyhow::Error::from(e)),
                );
                run.abort_nodes(None);
                ResultCode::Error
            }
        };

        run.finish().await;
        if !phase_step(watchdog, phase, "post-execute", lifecycle.post_execute()).await {
            result = ResultCode::Error;
        }
        lifecycle.free().await;
        watchdog.clear_current_nodes();

        run.tracking.phase_finished(result);
        watchdog.update_phase_tracking(&run.tracking);
        result
    }
}

impl PhaseRun<'_> {
    /// Start one task per node while holding the start-up lock.
    ///
    /// Returns `false` when the run was aborted before the node threads
    /// became available; no node is started then.
    async fn start_nodes(
        &mut self,
        messenger: messaging::Messenger,
        outbox: &mut Outbox,
    ) -> Result<bool, EngineError> {
        let number = self.phase.number();
        let threads = self.watchdog.threads().clone();
        let abort = self.watchdog.abort_signal().clone();
        let _startup = tokio::select! {
            biased;
            _ = abort.aborted() => return Ok(false),
            guard = threads.wait_for_node_threads(self.runtimes.len()) => guard?,
        };
        if self.runtimes.is_empty() {
            return Ok(true);
        }

        info!(run_id = %self.watchdog.run_id(), phase = number, "Starting up all nodes in phase [{}]", number);
        let barrier = Arc::new(Barrier::new(self.runtimes.len()));
        let base = RunContext::new(self.watchdog.run_id(), self.watchdog.graph().id());
        for runtime in &self.runtimes {
            let ctx = runtime.context(
                number,
                self.watchdog.run_id(),
                messenger.clone(),
                outbox.register(runtime.id()),
            );
            let task = run_node(runtime.clone(), ctx, barrier.clone(), messenger.clone()).boxed();
            let handle = threads.execute_node(base.for_node(runtime.id()), task)?;
            debug!(node_id = %runtime.id(), "{} ... started", runtime.id());
            self.handles.push(handle);
        }
        info!(run_id = %self.watchdog.run_id(), phase = number, "Successfully started all nodes in phase!");
        Ok(true)
    }

    /// Watch the leaves until they all end, an error arrives or the run is aborted
    async fn watch(&mut self, inbox: &mut Inbox, outbox: &Outbox) -> ResultCode {
        let abort = self.watchdog.abort_signal().clone();
        if abort.is_aborted() {
            return ResultCode::Aborted;
        }

        let watchdog = self.watchdog;
        let config = watchdog.config();
        let sleep = config.sleep_interval();
        let memory_ticks = u64::from(config.memory_sample_ticks.max(1));
        let tracking_interval = config.tracking_interval();
        let leaf_ids: HashSet<String> = self
            .phase
            .leaf_nodes()
            .iter()
            .map(|n| n.id().to_string())
            .collect();
        let mut leaves: Vec<usize> = (0..self.runtimes.len())
            .filter(|&i| leaf_ids.contains(self.runtimes[i].id()))
            .collect();

        let mut ticks: u64 = 0;
        let mut last_emission = Instant::now();
        self.tracking.sample_memory(&self.runtimes);

        loop {
            if leaves.is_empty() {
                // errors sent just before a leaf ended still win
                while let Some(message) = inbox.try_poll() {
                    if let Some(result) = self.dispatch(message, outbox, &mut leaves) {
                        return result;
                    }
                }
                return if abort.is_aborted() {
                    ResultCode::Aborted
                } else {
                    ResultCode::FinishedOk
                };
            }

            let message = tokio::select! {
                biased;
                _ = abort.aborted() => return ResultCode::Aborted,
                message = inbox.poll(sleep) => message,
            };
            if let Some(message) = message {
                if let Some(result) = self.dispatch(message, outbox, &mut leaves) {
                    return result;
                }
            }

            leaves.retain(|&i| !self.handles.get(i).map_or(true, |h| h.is_finished()));

            ticks += 1;
            if ticks % memory_ticks == 0 {
                self.tracking.sample_memory(&self.runtimes);
            }
            self.tracking.gather(&self.runtimes, config);

            if let Some(interval) = tracking_interval {
                if last_emission.elapsed() >= interval {
                    watchdog.update_phase_tracking(&self.tracking);
                    watchdog.bus().emit(RunEvent::TrackingUpdated {
                        phase: self.tracking.clone(),
                    });
                    last_emission = Instant::now();
                }
            }
        }
    }

    /// Handle one inbox message; `Some` ends the watch loop
    fn dispatch(
        &mut self,
        message: Message,
        outbox: &Outbox,
        leaves: &mut Vec<usize>,
    ) -> Option<ResultCode> {
        match message.msg_type {
            MessageType::Error => {
                let Some(report) = message.error_report() else {
                    return None;
                };
                self.watchdog.record_failure(
                    message.sender_id.clone(),
                    report.message.clone(),
                    report.cause.clone(),
                );
                error!(
                    run_id = %self.watchdog.run_id(),
                    phase = self.phase.number(),
                    "Fatal error in node {} - aborting phase",
                    message.sender_id
                );
                // freeze the surviving nodes at the moment of failure
                self.tracking.gather(&self.runtimes, self.watchdog.config());
                self.abort_nodes(Some(&message.sender_id));
                Some(ResultCode::Error)
            }
            MessageType::NodeFinished => {
                trace!(node_id = %message.sender_id, "Node reported finished");
                leaves.retain(|&i| self.runtimes[i].id() != message.sender_id);
                None
            }
            MessageType::Message => {
                outbox.deliver(message);
                None
            }
        }
    }

    fn abort_nodes(&self, except: Option<&str>) {
        for runtime in &self.runtimes {
            if Some(runtime.id()) == except || runtime.result().is_terminal() {
                continue;
            }
            if runtime.abort() {
                warn!(run_id = %self.watchdog.run_id(), "Interrupted node: {}", runtime.id());
            }
        }
    }

    /// Give the node threads back, stop what is still running and take a last sample
    async fn finish(&mut self) {
        let watchdog = self.watchdog;
        watchdog.threads().release_node_threads(self.handles.len());
        self.abort_nodes(None);

        let timeout: Duration = watchdog.config().abort_timeout();
        let handles = std::mem::take(&mut self.handles);
        match tokio::time::timeout(timeout, join_all(handles.into_iter().map(|h| h.join()))).await {
            Ok(joined) => {
                for outcome in joined {
                    if let Err(e) = outcome {
                        debug!(error = %e, "Node task ended abnormally");
                    }
                }
            }
            Err(_) => warn!(
                run_id = %self.watchdog.run_id(),
                phase = self.phase.number(),
                "Some nodes did not stop within {:?}",
                timeout
            ),
        }

        for runtime in &self.runtimes {
            runtime.skip();
        }
        self.tracking.gather(&self.runtimes, watchdog.config());
        self.tracking.sample_memory(&self.runtimes);
    }
}
