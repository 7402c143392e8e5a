use crate::core::errors::Result;
use crate::graph::port::Port;
use crate::messaging::{Message, Messenger};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A graph component scheduled by the watchdog.
///
/// Implementations own their record processing. The scheduler only calls
/// `pre_execute` once every node of the phase is bound to its execution task,
/// then `execute`, and observes progress through the ports.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique id within the graph
    fn id(&self) -> &str;

    /// Human readable component name, used in tracking tables
    fn name(&self) -> &str {
        self.id()
    }

    fn input_ports(&self) -> Vec<Arc<dyn Port>> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<Arc<dyn Port>> {
        Vec::new()
    }

    /// Runs on the node's own task before any node of the phase executes
    async fn pre_execute(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// The node's unit of work
    async fn execute(&self, ctx: &NodeContext) -> anyhow::Result<()>;

    /// Called when the phase aborts this node; the abort signal in the
    /// context is raised as well
    fn abort(&self) {}

    /// Bytes currently held by this node
    fn used_memory(&self) -> u64 {
        0
    }
}

/// Cloneable stop flag shared between a node, its task and the watchdog
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal; returns true only for the call that raised it
    pub fn abort(&self) -> bool {
        self.tx.send_if_modified(|aborted| {
            if *aborted {
                false
            } else {
                *aborted = true;
                true
            }
        })
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is raised
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

struct Mailbox {
    rx: mpsc::UnboundedReceiver<Message>,
    buffered: VecDeque<Message>,
}

impl Mailbox {
    fn fill(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.buffered.push_back(message);
        }
    }
}

/// Everything a running node may touch besides its own ports
pub struct NodeContext {
    node_id: String,
    phase: i32,
    run_id: String,
    abort: AbortSignal,
    messenger: Messenger,
    mailbox: Mutex<Mailbox>,
}

impl NodeContext {
    pub(crate) fn new(
        node_id: impl Into<String>,
        phase: i32,
        run_id: impl Into<String>,
        abort: AbortSignal,
        messenger: Messenger,
        mailbox: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            phase,
            run_id: run_id.into(),
            abort,
            messenger,
            mailbox: Mutex::new(Mailbox {
                rx: mailbox,
                buffered: VecDeque::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn phase(&self) -> i32 {
        self.phase
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Resolves once the phase asks this node to stop
    pub async fn aborted(&self) {
        self.abort.aborted().await
    }

    /// Send a message to another node of the phase through the watch loop
    pub fn send_message(
        &self,
        recipient: impl Into<String>,
        priority: i32,
        body: serde_json::Value,
    ) -> Result<()> {
        self.messenger
            .send(Message::payload(self.node_id.clone(), recipient, priority, body))
    }

    /// Take every message delivered to this node so far
    pub fn receive_messages(&self) -> Vec<Message> {
        let mut mailbox = self.mailbox.lock();
        mailbox.fill();
        mailbox.buffered.drain(..).collect()
    }

    pub fn has_messages(&self) -> bool {
        let mut mailbox = self.mailbox.lock();
        mailbox.fill();
        !mailbox.buffered.is_empty()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("phase", &self.phase)
            .field("run_id", &self.run_id)
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}
