//! Node/scheduler message passing.
//!
//! Nodes talk to the watch loop through a [`Messenger`]; errors travel on a
//! dedicated fast-path channel so they overtake regular traffic. The watch
//! loop drains both channels into a priority queue ([`Inbox`]) and forwards
//! addressed messages to their recipients through an [`Outbox`].

use crate::core::errors::{EngineError, Result};
use crate::graph::ResultCode;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Message kind; declaration order is delivery precedence (lowest first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Message,
    NodeFinished,
    Error,
}

/// Failure report carried by an ERROR message
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub code: ResultCode,
    pub message: String,
    pub cause: Arc<anyhow::Error>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.message, self.cause)
    }
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Error(ErrorReport),
    Payload(serde_json::Value),
    Finished(ResultCode),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub sender_id: String,
    pub sender_thread: Option<String>,
    pub recipient: Option<String>,
    pub priority: i32,
    pub body: MessageBody,
}

impl Message {
    pub fn error(sender_id: impl Into<String>, message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::shared_error(sender_id, message, Arc::new(cause))
    }

    /// ERROR message whose cause is also kept elsewhere
    pub fn shared_error(
        sender_id: impl Into<String>,
        message: impl Into<String>,
        cause: Arc<anyhow::Error>,
    ) -> Self {
        Self {
            msg_type: MessageType::Error,
            sender_id: sender_id.into(),
            sender_thread: current_thread_name(),
            recipient: None,
            priority: 0,
            body: MessageBody::Error(ErrorReport {
                code: ResultCode::Error,
                message: message.into(),
                cause,
            }),
        }
    }

    pub fn finished(sender_id: impl Into<String>, result: ResultCode) -> Self {
        Self {
            msg_type: MessageType::NodeFinished,
            sender_id: sender_id.into(),
            sender_thread: current_thread_name(),
            recipient: None,
            priority: 0,
            body: MessageBody::Finished(result),
        }
    }

    pub fn payload(
        sender_id: impl Into<String>,
        recipient: impl Into<String>,
        priority: i32,
        body: serde_json::Value,
    ) -> Self {
        Self {
            msg_type: MessageType::Message,
            sender_id: sender_id.into(),
            sender_thread: current_thread_name(),
            recipient: Some(recipient.into()),
            priority,
            body: MessageBody::Payload(body),
        }
    }

    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error
    }

    pub fn error_report(&self) -> Option<&ErrorReport> {
        match &self.body {
            MessageBody::Error(report) => Some(report),
            _ => None,
        }
    }
}

// Ordering compares the delivery key only: type first, then priority
impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.msg_type
            .cmp(&other.msg_type)
            .then(self.priority.cmp(&other.priority))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Message {}

fn current_thread_name() -> Option<String> {
    std::thread::current().name().map(str::to_owned)
}

/// Create a connected messenger/inbox pair for one phase
pub fn channel() -> (Messenger, Inbox) {
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    (
        Messenger {
            errors: error_tx,
            messages: message_tx,
        },
        Inbox {
            errors: error_rx,
            messages: message_rx,
            pending: BinaryHeap::new(),
            arrivals: 0,
        },
    )
}

/// Node-side sending half
#[derive(Debug, Clone)]
pub struct Messenger {
    errors: UnboundedSender<Message>,
    messages: UnboundedSender<Message>,
}

impl Messenger {
    pub fn send(&self, message: Message) -> Result<()> {
        let (tx, name) = if message.is_error() {
            (&self.errors, "errors")
        } else {
            (&self.messages, "messages")
        };
        tx.send(message)
            .map_err(|_| EngineError::channel(name, "watch loop inbox closed"))
    }
}

struct Queued {
    message: Message,
    arrival: u64,
}

// Max-heap: higher key first, earlier arrival first within equal keys
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .cmp(&other.message)
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

/// Scheduler-side receiving half with priority ordering
pub struct Inbox {
    errors: UnboundedReceiver<Message>,
    messages: UnboundedReceiver<Message>,
    pending: BinaryHeap<Queued>,
    arrivals: u64,
}

impl Inbox {
    fn push(&mut self, message: Message) {
        self.arrivals += 1;
        self.pending.push(Queued {
            message,
            arrival: self.arrivals,
        });
    }

    fn drain(&mut self) {
        while let Ok(message) = self.errors.try_recv() {
            self.push(message);
        }
        while let Ok(message) = self.messages.try_recv() {
            self.push(message);
        }
    }

    /// Take the highest-ranked message without waiting
    pub fn try_poll(&mut self) -> Option<Message> {
        self.drain();
        self.pending.pop().map(|q| q.message)
    }

    /// Take the highest-ranked message, waiting at most `timeout` for one to arrive
    pub async fn poll(&mut self, timeout: Duration) -> Option<Message> {
        if let Some(message) = self.try_poll() {
            return Some(message);
        }

        let received = tokio::select! {
            biased;
            Some(message) = self.errors.recv() => Some(message),
            Some(message) = self.messages.recv() => Some(message),
            _ = tokio::time::sleep(timeout) => None,
        };

        if let Some(message) = received {
            self.push(message);
        }
        self.try_poll()
    }

    /// Number of messages already drained and waiting
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Scheduler-to-node routing table, one channel per registered node
#[derive(Debug, Default)]
pub struct Outbox {
    routes: HashMap<String, UnboundedSender<Message>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recipient and hand back its receiving end
    pub fn register(&mut self, node_id: impl Into<String>) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(node_id.into(), tx);
        rx
    }

    /// Route a message to its recipient; returns false when it was dropped
    pub fn deliver(&self, message: Message) -> bool {
        let Some(recipient) = message.recipient.as_deref() else {
            debug!(sender = %message.sender_id, "Dropping message without recipient");
            return false;
        };
        match self.routes.get(recipient) {
            Some(tx) => {
                trace!(sender = %message.sender_id, recipient, "Delivering message");
                tx.send(message).is_ok()
            }
            None => {
                debug!(sender = %message.sender_id, recipient, "Dropping message for unknown recipient");
                false
            }
        }
    }
}
