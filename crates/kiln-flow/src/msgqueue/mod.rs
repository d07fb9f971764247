//! Message bus contract.
//!
//! The core depends on two capabilities only: sending a message to a named
//! queue, and receiving messages from a queue. Batching of received messages
//! into per-tenant, per-kind handler calls is done by [`buffer::SubBuffer`].
//!
//! Messages are delivered at least once. Handlers must be idempotent.

pub mod buffer;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kiln_core::{DispatcherId, TenantId};

use crate::error::{Error, Result};

/// Default retry budget of a published message.
pub const DEFAULT_MESSAGE_RETRIES: u32 = 5;

/// A named queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Lifecycle messages consumed by the task controller.
    TaskProcessing,
    /// Analytics ingestion consumed by the status reconciliation pipeline.
    Olap,
    /// Signals for one dispatcher (and the workers connected to it).
    Dispatcher(DispatcherId),
    /// Notifications for the scheduler owning a tenant partition.
    SchedulerPartition(String),
}

impl QueueType {
    /// Returns the broker-level queue name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::TaskProcessing => "task_processing_queue_v2".to_string(),
            Self::Olap => "olap_queue_v2".to_string(),
            Self::Dispatcher(id) => format!("{id}_dispatcher_v1"),
            Self::SchedulerPartition(partition) => format!("{partition}_scheduler"),
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// The kind of a message, carried in [`Message::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A worker reported a completed attempt.
    TaskCompleted,
    /// A worker or sweep reported a failed attempt.
    TaskFailed,
    /// A task must be cancelled (or, on a dispatcher queue, an attempt must stop).
    TaskCancelled,
    /// A user event that may match event triggers.
    UserEvent,
    /// An internal event that may satisfy match conditions.
    InternalEvent,
    /// A direct workflow trigger.
    TaskTrigger,
    /// A task was created (analytics ingestion).
    CreatedTask,
    /// A DAG was created (analytics ingestion).
    CreatedDag,
    /// A task lifecycle event for the analytics read model.
    CreateMonitoringEvent,
    /// Queued tasks were created (scheduler notification).
    NotifyTaskCreated,
    /// Tasks released queue capacity (scheduler notification).
    NotifyTaskReleased,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskCancelled,
        Self::UserEvent,
        Self::InternalEvent,
        Self::TaskTrigger,
        Self::CreatedTask,
        Self::CreatedDag,
        Self::CreateMonitoringEvent,
        Self::NotifyTaskCreated,
        Self::NotifyTaskReleased,
    ];

    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskCompleted => "task-completed",
            Self::TaskFailed => "task-failed",
            Self::TaskCancelled => "task-cancelled",
            Self::UserEvent => "user-event",
            Self::InternalEvent => "internal-event",
            Self::TaskTrigger => "task-trigger",
            Self::CreatedTask => "created-task",
            Self::CreatedDag => "created-dag",
            Self::CreateMonitoringEvent => "create-monitoring-event",
            Self::NotifyTaskCreated => "notify-task-created",
            Self::NotifyTaskReleased => "notify-task-released",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownMessageKind {
                kind: s.to_string(),
            })
    }
}

/// A bus message: one kind, one tenant, many serialized payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The message kind (see [`MessageKind`]).
    pub id: String,
    /// Serialized JSON payloads.
    #[serde(rename = "messages")]
    pub payloads: Vec<Vec<u8>>,
    /// The tenant the payloads belong to.
    pub tenant_id: TenantId,
    /// Drop the message if it reaches a queue without an active consumer.
    pub immediately_expire: bool,
    /// Persist the message across broker restarts.
    pub persistent: bool,
    /// Trace context propagated across the bus.
    #[serde(default)]
    pub otel_carrier: HashMap<String, String>,
    /// Remaining redelivery attempts.
    pub retries: u32,
}

impl Message {
    /// Creates a tenant-scoped message, serializing each payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if any payload fails to serialize.
    pub fn new_tenant_message<T: Serialize>(
        tenant_id: TenantId,
        kind: MessageKind,
        immediately_expire: bool,
        persistent: bool,
        payloads: &[T],
    ) -> Result<Self> {
        let payloads = payloads
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            id: kind.as_str().to_string(),
            payloads,
            tenant_id,
            immediately_expire,
            persistent,
            otel_carrier: HashMap::new(),
            retries: DEFAULT_MESSAGE_RETRIES,
        })
    }

    /// Returns the parsed kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMessageKind`] for unrecognized kinds.
    pub fn kind(&self) -> Result<MessageKind> {
        self.id.parse()
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Attaches a trace-context carrier.
    pub fn set_otel_carrier(&mut self, carrier: HashMap<String, String>) {
        self.otel_carrier = carrier;
    }

    /// Decodes every payload, skipping (and logging) the ones that fail.
    #[must_use]
    pub fn decode_payloads<T: DeserializeOwned>(&self) -> Vec<T> {
        decode_payloads(&self.payloads)
    }
}

/// Decodes raw payloads, skipping (and logging) the ones that fail.
#[must_use]
pub fn decode_payloads<T: DeserializeOwned>(payloads: &[Vec<u8>]) -> Vec<T> {
    payloads
        .iter()
        .filter_map(|raw| match serde_json::from_slice::<T>(raw) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::error!(error = %err, "could not decode message payload");
                None
            }
        })
        .collect()
}

/// Receiving half of a queue subscription.
pub type MessageReceiver = mpsc::UnboundedReceiver<Message>;

/// A durable, at-least-once message transport.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publishes a message to a queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message could not be handed to the broker.
    async fn send_message(&self, queue: &QueueType, msg: Message) -> Result<()>;

    /// Subscribes to a queue. Each message is delivered to one subscriber.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription could not be created.
    async fn subscribe(&self, queue: &QueueType) -> Result<MessageReceiver>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_a_classification_error() {
        let err = "task-exploded".parse::<MessageKind>().unwrap_err();
        assert!(err.is_classification());
    }

    #[test]
    fn queue_names_are_stable() {
        let dispatcher = DispatcherId::generate();
        assert_eq!(QueueType::TaskProcessing.name(), "task_processing_queue_v2");
        assert_eq!(QueueType::Olap.name(), "olap_queue_v2");
        assert_eq!(
            QueueType::Dispatcher(dispatcher).name(),
            format!("{dispatcher}_dispatcher_v1")
        );
        assert_eq!(
            QueueType::SchedulerPartition("p-1".into()).name(),
            "p-1_scheduler"
        );
    }

    #[test]
    fn tenant_message_defaults_to_five_retries() {
        let msg = Message::new_tenant_message(
            TenantId::generate(),
            MessageKind::TaskCompleted,
            false,
            true,
            &[serde_json::json!({"task_id": 1})],
        )
        .unwrap();

        assert_eq!(msg.retries, 5);
        assert_eq!(msg.kind().unwrap(), MessageKind::TaskCompleted);
        assert_eq!(msg.payloads.len(), 1);
    }

    #[test]
    fn undecodable_payloads_are_skipped() {
        let payloads = vec![b"{\"a\":1}".to_vec(), b"garbage".to_vec()];
        let decoded: Vec<serde_json::Value> = decode_payloads(&payloads);
        assert_eq!(decoded.len(), 1);
    }
}
