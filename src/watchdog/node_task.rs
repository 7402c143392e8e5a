use crate::graph::{AbortSignal, Node, NodeContext, ResultCell, ResultCode};
use crate::messaging::{Message, Messenger};
use crate::threads::panic_message;
use crate::tracking::{metered, CpuClock, NodeProbe};
use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Barrier};
use tracing::{debug, error, trace};

/// How a node's `execute` ended
#[derive(Debug, Clone)]
pub(crate) enum NodeOutcome {
    Finished,
    Aborted,
    Failed(Arc<anyhow::Error>),
}

/// Scheduler-side state of one node for the duration of a phase
pub struct NodeRuntime {
    node: Arc<dyn Node>,
    result: ResultCell,
    signal: AbortSignal,
    cpu: CpuClock,
    error: Mutex<Option<Arc<anyhow::Error>>>,
}

impl NodeRuntime {
    pub fn new(node: Arc<dyn Node>) -> Arc<Self> {
        Arc::new(Self {
            node,
            result: ResultCell::default(),
            signal: AbortSignal::new(),
            cpu: CpuClock::new(),
            error: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        self.node.id()
    }

    pub fn result(&self) -> ResultCode {
        self.result.get()
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.error.lock().clone()
    }

    /// Raise the node's abort signal and call its abort hook, once
    pub fn abort(&self) -> bool {
        if self.signal.abort() {
            self.node.abort();
            true
        } else {
            false
        }
    }

    /// Close a node that never ran
    pub(crate) fn skip(&self) {
        if self.result.transition(ResultCode::Aborted) {
            trace!(node_id = %self.id(), "Node skipped");
        }
    }

    fn aborted(&self) -> NodeOutcome {
        self.result.transition(ResultCode::Aborted);
        debug!(node_id = %self.id(), "Node aborted");
        NodeOutcome::Aborted
    }

    pub(crate) fn context(
        &self,
        phase: i32,
        run_id: &str,
        messenger: Messenger,
        mailbox: mpsc::UnboundedReceiver<Message>,
    ) -> NodeContext {
        NodeContext::new(
            self.id(),
            phase,
            run_id,
            self.signal.clone(),
            messenger,
            mailbox,
        )
    }

    pub(crate) fn fail(&self, error: anyhow::Error) -> Arc<anyhow::Error> {
        let error = Arc::new(error);
        self.result.transition(ResultCode::Error);
        *self.error.lock() = Some(error.clone());
        error
    }

    pub(crate) async fn pre_execute(&self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.result.transition(ResultCode::Running);
        let work = AssertUnwindSafe(self.node.pre_execute(ctx)).catch_unwind();
        match metered(work, self.cpu.clone()).await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!(
                "node {} panicked in pre-execute: {}",
                self.id(),
                panic_message(&*panic)
            )),
        }
    }

    /// Run `execute`, racing it against the abort signal
    pub(crate) async fn execute(&self, ctx: &NodeContext) -> NodeOutcome {
        self.result.transition(ResultCode::Running);
        let work = metered(
            AssertUnwindSafe(self.node.execute(ctx)).catch_unwind(),
            self.cpu.clone(),
        );

        let finished = tokio::select! {
            biased;
            _ = self.signal.aborted() => None,
            finished = work => Some(finished),
        };

        match finished {
            None => self.aborted(),
            // failures after an abort request are the abort's doing
            Some(Ok(_)) if self.signal.is_aborted() => self.aborted(),
            Some(Ok(Ok(()))) => {
                self.result.transition(ResultCode::FinishedOk);
                debug!(node_id = %self.id(), "Node finished");
                NodeOutcome::Finished
            }
            Some(Ok(Err(e))) => NodeOutcome::Failed(self.fail(e)),
            Some(Err(panic)) => NodeOutcome::Failed(self.fail(anyhow!(
                "node {} panicked: {}",
                self.id(),
                panic_message(&*panic)
            ))),
        }
    }
}

impl NodeProbe for NodeRuntime {
    fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    fn result(&self) -> ResultCode {
        self.result.get()
    }

    fn cpu_nanos(&self) -> u64 {
        self.cpu.nanos()
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("id", &self.id())
            .field("result", &self.result())
            .finish()
    }
}

/// Body of a node task under the multi-thread scheduler.
///
/// Every node passes the start barrier before any of them executes. A failed
/// pre-execute still waits at the barrier so its siblings are not stranded.
pub(crate) async fn run_node(
    runtime: Arc<NodeRuntime>,
    ctx: NodeContext,
    barrier: Arc<Barrier>,
    messenger: Messenger,
) {
    let prepared = runtime.pre_execute(&ctx).await;

    tokio::select! {
        _ = barrier.wait() => {}
        _ = runtime.signal().aborted() => {}
    }

    let outcome = match prepared {
        Ok(()) => runtime.execute(&ctx).await,
        Err(e) => NodeOutcome::Failed(runtime.fail(e.context("pre-execute failed"))),
    };

    if let NodeOutcome::Failed(cause) = &outcome {
        error!(node_id = %runtime.id(), "Node finished with status ERROR: {:#}", cause);
        let report = Message::shared_error(
            runtime.id(),
            format!("Node {} finished with status ERROR", runtime.id()),
            cause.clone(),
        );
        if let Err(e) = messenger.send(report) {
            debug!(node_id = %runtime.id(), error = %e, "Failed to report node error");
        }
    }

    if let Err(e) = messenger.send(Message::finished(runtime.id(), runtime.result())) {
        trace!(node_id = %runtime.id(), error = %e, "Watch loop gone before node finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{self, MessageType};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Scripted {
        id: &'static str,
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl Node for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        async fn execute(&self, ctx: &NodeContext) -> anyhow::Result<()> {
            if self.hang {
                ctx.aborted().await;
                anyhow::bail!("interrupted");
            }
            if self.fail {
                anyhow::bail!("bad record");
            }
            Ok(())
        }
    }

    fn setup(node: Scripted) -> (Arc<NodeRuntime>, NodeContext, messaging::Inbox, Messenger) {
        let runtime = NodeRuntime::new(Arc::new(node));
        let (messenger, inbox) = messaging::channel();
        let (_tx, rx) = mpsc::unbounded_channel();
        let ctx = runtime.context(0, "run", messenger.clone(), rx);
        (runtime, ctx, inbox, messenger)
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let (runtime, ctx, _inbox, _m) = setup(Scripted { id: "a", fail: false, hang: false });
        assert!(matches!(runtime.execute(&ctx).await, NodeOutcome::Finished));
        assert_eq!(runtime.result(), ResultCode::FinishedOk);
    }

    #[tokio::test]
    async fn test_error_is_reported() {
        let (runtime, ctx, mut inbox, messenger) = setup(Scripted { id: "b", fail: true, hang: false });
        run_node(runtime.clone(), ctx, Arc::new(Barrier::new(1)), messenger).await;

        assert_eq!(runtime.result(), ResultCode::Error);
        assert!(runtime.error().is_some());
        let first = inbox.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.msg_type, MessageType::Error);
        assert_eq!(first.sender_id, "b");
        let second = inbox.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.msg_type, MessageType::NodeFinished);
    }

    #[tokio::test]
    async fn test_abort_wins_over_failure() {
        let (runtime, ctx, _inbox, _m) = setup(Scripted { id: "c", fail: false, hang: true });
        let aborter = runtime.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(aborter.abort());
        });

        assert!(matches!(runtime.execute(&ctx).await, NodeOutcome::Aborted));
        assert_eq!(runtime.result(), ResultCode::Aborted);
        assert!(!runtime.abort());
    }
}
