use crate::graph::{NodeContext, Phase, ResultCode};
use crate::messaging::{self, Outbox};
use crate::tracking::PhaseTrackingDetail;
use crate::watchdog::node_task::{NodeOutcome, NodeRuntime};
use crate::watchdog::{phase_step, PhaseRunner, Watchdog};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs every node of a phase in topological order on the watchdog's task.
///
/// There is no watch loop and no message routing: messages nodes send are
/// accepted and dropped. Aborting the run cancels the node that is currently
/// executing at its next await point and no further node starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialPhaseRunner;

#[async_trait]
impl PhaseRunner for SequentialPhaseRunner {
    fn name(&self) -> &'static str {
        "single-thread"
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

        let mut result = match phase.topological_order() {
            Ok(ordered) => {
                let runtimes: Vec<Arc<NodeRuntime>> =
                    ordered.into_iter().map(NodeRuntime::new).collect();
                watchdog.set_current_nodes(runtimes.clone());
                let result = run_in_order(watchdog, phase, &runtimes).await;
                for runtime in &runtimes {
                    runtime.skip();
                }
                tracking.gather(&runtimes, watchdog.config());
                tracking.sample_memory(&runtimes);
                result
            }
            Err(e) => {
                watchdog.record_failure(
                    format!("phase {}", phase.number()),
                    "Cannot order phase nodes",
                    Arc::new(anyhow::Error::from(e)),
                );
                ResultCode::Error
            }
        };

        if !phase_step(watchdog, phase, "post-execute", lifecycle.post_execute()).await {
            result = ResultCode::Error;
        }
        lifecycle.free().await;
        watchdog.clear_current_nodes();

        tracking.phase_finished(result);
        watchdog.update_phase_tracking(&tracking);
        result
    }
}

async fn run_in_order(watchdog: &Watchdog, phase: &Phase, runtimes: &[Arc<NodeRuntime>]) -> ResultCode {
    let order: Vec<&str> = runtimes.iter().map(|r| r.id()).collect();
    info!(
        run_id = %watchdog.run_id(),
        phase = phase.number(),
        "Executing phase [{}] in order: {}",
        phase.number(),
        order.join(", ")
    );

    // nodes may still send; the inbox is held but never read
    let (messenger, _inbox) = messaging::channel();
    let mut outbox = Outbox::new();
    let contexts: Vec<NodeContext> = runtimes
        .iter()
        .map(|r| {
            r.context(
                phase.number(),
                watchdog.run_id(),
                messenger.clone(),
                outbox.register(r.id()),
            )
        })
        .collect();

    for (runtime, ctx) in runtimes.iter().zip(&contexts) {
        if watchdog.is_aborted() {
            return ResultCode::Aborted;
        }
        if let Err(e) = runtime.pre_execute(ctx).await {
            let cause = runtime.fail(e.context("pre-execute failed"));
            watchdog.record_failure(
                runtime.id(),
                format!("Node {} finished with status ERROR", runtime.id()),
                cause,
            );
            return ResultCode::Error;
        }
    }

    for (runtime, ctx) in runtimes.iter().zip(&contexts) {
        if watchdog.is_aborted() {
            return ResultCode::Aborted;
        }
        debug!(node_id = %runtime.id(), "Executing node");
        match runtime.execute(ctx).await {
            NodeOutcome::Finished => {}
            NodeOutcome::Aborted => return ResultCode::Aborted,
            NodeOutcome::Failed(cause) => {
                watchdog.record_failure(
                    runtime.id(),
                    format!("Node {} finished with status ERROR", runtime.id()),
                    cause,
                );
                return ResultCode::Error;
            }
        }
    }
    ResultCode::FinishedOk
}
