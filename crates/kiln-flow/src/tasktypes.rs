//! Message payloads exchanged over the bus, and their constructors.
//!
//! Each constructor fixes the delivery flags for its kind: task lifecycle
//! messages and analytics ingestion are persistent, monitoring events are
//! not, and scheduler notifications expire when nobody is listening.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_core::{ExternalId, TenantId, WorkerId};

use crate::error::Result;
use crate::msgqueue::{Message, MessageKind};
use crate::olap::OlapEventType;
use crate::task::{DagWithData, StrategyId, Task, TaskId, TaskIdRetryCount};

/// A worker finished an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTaskPayload {
    /// The task.
    pub task_id: TaskId,
    /// The attempt that finished.
    pub retry_count: i32,
    /// Output produced by the step.
    #[serde(default)]
    pub output: serde_json::Value,
}

impl CompletedTaskPayload {
    /// Returns the attempt this payload refers to.
    #[must_use]
    pub const fn attempt(&self) -> TaskIdRetryCount {
        TaskIdRetryCount::new(self.task_id, self.retry_count)
    }
}

/// An attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTaskPayload {
    /// The task.
    pub task_id: TaskId,
    /// The attempt that failed.
    pub retry_count: i32,
    /// True when user code failed, false for infrastructure failures.
    pub is_app_error: bool,
    /// Error text.
    pub error_msg: String,
}

impl FailedTaskPayload {
    /// Returns the attempt this payload refers to.
    #[must_use]
    pub const fn attempt(&self) -> TaskIdRetryCount {
        TaskIdRetryCount::new(self.task_id, self.retry_count)
    }
}

fn default_cancel_event_type() -> OlapEventType {
    OlapEventType::Cancelled
}

/// A task must be cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledTaskPayload {
    /// The task.
    pub task_id: TaskId,
    /// The attempt to cancel.
    pub retry_count: i32,
    /// Tell the task's dispatcher to stop the attempt.
    pub should_notify: bool,
    /// Monitoring event recorded for the cancellation.
    #[serde(default = "default_cancel_event_type")]
    pub event_type: OlapEventType,
    /// Note attached to the monitoring event.
    #[serde(default)]
    pub event_message: Option<String>,
}

impl CancelledTaskPayload {
    /// A plain cancellation recorded as `CANCELLED`.
    #[must_use]
    pub const fn new(task_id: TaskId, retry_count: i32, should_notify: bool) -> Self {
        Self {
            task_id,
            retry_count,
            should_notify,
            event_type: OlapEventType::Cancelled,
            event_message: None,
        }
    }

    /// Overrides the recorded monitoring event.
    #[must_use]
    pub fn with_event(mut self, event_type: OlapEventType, message: impl Into<String>) -> Self {
        self.event_type = event_type;
        self.event_message = Some(message.into());
        self
    }

    /// Returns the attempt this payload refers to.
    #[must_use]
    pub const fn attempt(&self) -> TaskIdRetryCount {
        TaskIdRetryCount::new(self.task_id, self.retry_count)
    }
}

/// A user event that may trigger workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEventTaskPayload {
    /// Event identifier.
    pub event_id: Uuid,
    /// Event key matched against workflow triggers.
    pub event_key: String,
    /// Event body, used as the input of triggered runs.
    #[serde(default)]
    pub event_data: serde_json::Value,
    /// Metadata copied onto triggered runs.
    #[serde(default)]
    pub event_additional_metadata: BTreeMap<String, String>,
}

/// An internal event (a task outcome) that may satisfy match conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEventTaskPayload {
    /// When the event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Event key (see [`crate::events`]).
    pub event_key: String,
    /// Event body.
    #[serde(default)]
    pub event_data: serde_json::Value,
}

/// A direct request to run a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerTaskPayload {
    /// External id to assign to the created run.
    pub task_external_id: ExternalId,
    /// Workflow to run.
    pub workflow_name: String,
    /// Run input.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Free-form metadata.
    #[serde(default)]
    pub additional_metadata: BTreeMap<String, String>,
    /// Spawning task, for child runs.
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    /// Position of the child within its parent.
    #[serde(default)]
    pub child_index: Option<i64>,
    /// Caller-supplied child key.
    #[serde(default)]
    pub child_key: Option<String>,
}

impl TriggerTaskPayload {
    /// A top-level trigger with a fresh external id.
    #[must_use]
    pub fn new(workflow_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            task_external_id: ExternalId::generate(),
            workflow_name: workflow_name.into(),
            data,
            additional_metadata: BTreeMap::new(),
            parent_task_id: None,
            child_index: None,
            child_key: None,
        }
    }

    /// Marks the trigger as a child spawn of `parent_task_id`.
    #[must_use]
    pub fn as_child(
        mut self,
        parent_task_id: TaskId,
        child_index: i64,
        child_key: Option<String>,
    ) -> Self {
        self.parent_task_id = Some(parent_task_id);
        self.child_index = Some(child_index);
        self.child_key = child_key;
        self
    }
}

/// Dispatcher-bound instruction to stop an attempt on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTaskCancelledPayload {
    /// The task.
    pub task_id: TaskId,
    /// Worker running the attempt.
    pub worker_id: WorkerId,
    /// The attempt.
    pub retry_count: i32,
}

/// A task lifecycle event bound for the read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMonitoringEventPayload {
    /// The task.
    pub task_id: TaskId,
    /// The attempt.
    pub retry_count: i32,
    /// Worker involved, if any.
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    /// Event type name; unknown names are rejected on ingestion.
    pub event_type: String,
    /// When it happened.
    pub event_timestamp: DateTime<Utc>,
    /// Output or error payload.
    #[serde(default)]
    pub event_payload: String,
    /// Human readable note.
    #[serde(default)]
    pub event_message: Option<String>,
}

impl CreateMonitoringEventPayload {
    /// An event of `event_type` for one attempt.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        retry_count: i32,
        event_type: OlapEventType,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            retry_count,
            worker_id: None,
            event_type: event_type.as_str().to_string(),
            event_timestamp,
            event_payload: String::new(),
            event_message: None,
        }
    }

    /// Sets the worker.
    #[must_use]
    pub const fn with_worker(mut self, worker_id: Option<WorkerId>) -> Self {
        self.worker_id = worker_id;
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.event_payload = payload.into();
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.event_message = Some(message.into());
        self
    }
}

/// Scheduler notification for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyQueuePayload {
    /// The queue that changed.
    pub queue: String,
    /// Concurrency strategies of the affected tasks.
    #[serde(default)]
    pub strategy_ids: Vec<StrategyId>,
}

/// Builds one notification per distinct queue, merging strategy ids.
pub fn notify_payloads<'a, I>(entries: I) -> Vec<NotifyQueuePayload>
where
    I: IntoIterator<Item = (&'a str, &'a [StrategyId])>,
{
    let mut by_queue: BTreeMap<&str, Vec<StrategyId>> = BTreeMap::new();
    for (queue, strategy_ids) in entries {
        let ids = by_queue.entry(queue).or_default();
        for id in strategy_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
    }
    by_queue
        .into_iter()
        .map(|(queue, strategy_ids)| NotifyQueuePayload {
            queue: queue.to_string(),
            strategy_ids,
        })
        .collect()
}

/// Builds a `task-completed` message.
///
/// # Errors
///
/// Returns a serialization error if the payload cannot be encoded.
pub fn completed_task_message(
    tenant_id: TenantId,
    task_id: TaskId,
    retry_count: i32,
    output: serde_json::Value,
) -> Result<Message> {
    Message::new_tenant_message(
        tenant_id,
        MessageKind::TaskCompleted,
        false,
        true,
        &[CompletedTaskPayload {
            task_id,
            retry_count,
            output,
        }],
    )
}

/// Builds a `task-failed` message.
///
/// # Errors
///
/// Returns a serialization error if the payload cannot be encoded.
pub fn failed_task_message(
    tenant_id: TenantId,
    task_id: TaskId,
    retry_count: i32,
    is_app_error: bool,
    error_msg: impl Into<String>,
) -> Result<Message> {
    Message::new_tenant_message(
        tenant_id,
        MessageKind::TaskFailed,
        false,
        true,
        &[FailedTaskPayload {
            task_id,
            retry_count,
            is_app_error,
            error_msg: error_msg.into(),
        }],
    )
}

/// Builds a `task-cancelled` message for the task controller.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn cancelled_task_message(
    tenant_id: TenantId,
    payloads: &[CancelledTaskPayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::TaskCancelled, false, true, payloads)
}

/// Builds a `user-event` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn user_event_message(
    tenant_id: TenantId,
    payloads: &[UserEventTaskPayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::UserEvent, false, true, payloads)
}

/// Builds an `internal-event` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn internal_event_message(
    tenant_id: TenantId,
    payloads: &[InternalEventTaskPayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::InternalEvent, false, true, payloads)
}

/// Builds a `task-trigger` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn trigger_task_message(
    tenant_id: TenantId,
    payloads: &[TriggerTaskPayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::TaskTrigger, false, true, payloads)
}

/// Builds a `created-task` message for the read model.
///
/// # Errors
///
/// Returns a serialization error if a task cannot be encoded.
pub fn created_task_message(tenant_id: TenantId, tasks: &[Task]) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::CreatedTask, false, true, tasks)
}

/// Builds a `created-dag` message for the read model.
///
/// # Errors
///
/// Returns a serialization error if a DAG cannot be encoded.
pub fn created_dag_message(tenant_id: TenantId, dags: &[DagWithData]) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::CreatedDag, false, true, dags)
}

/// Builds a `create-monitoring-event` message for the read model.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn monitoring_event_message(
    tenant_id: TenantId,
    payloads: &[CreateMonitoringEventPayload],
) -> Result<Message> {
    Message::new_tenant_message(
        tenant_id,
        MessageKind::CreateMonitoringEvent,
        false,
        false,
        payloads,
    )
}

/// Builds a dispatcher-bound `task-cancelled` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn signal_task_cancelled_message(
    tenant_id: TenantId,
    payloads: &[SignalTaskCancelledPayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::TaskCancelled, false, true, payloads)
}

/// Builds a scheduler `notify-task-created` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn notify_task_created_message(
    tenant_id: TenantId,
    payloads: &[NotifyQueuePayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::NotifyTaskCreated, true, false, payloads)
}

/// Builds a scheduler `notify-task-released` message.
///
/// # Errors
///
/// Returns a serialization error if a payload cannot be encoded.
pub fn notify_task_released_message(
    tenant_id: TenantId,
    payloads: &[NotifyQueuePayload],
) -> Result<Message> {
    Message::new_tenant_message(tenant_id, MessageKind::NotifyTaskReleased, true, false, payloads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_flags_follow_kind() {
        let tenant = TenantId::generate();

        let created = created_task_message(tenant, &[]).unwrap();
        assert!(!created.immediately_expire && created.persistent);

        let monitoring = monitoring_event_message(tenant, &[]).unwrap();
        assert!(!monitoring.immediately_expire && !monitoring.persistent);

        let signal = signal_task_cancelled_message(tenant, &[]).unwrap();
        assert_eq!(signal.kind().unwrap(), MessageKind::TaskCancelled);
        assert!(signal.persistent);

        let notify = notify_task_created_message(tenant, &[]).unwrap();
        assert!(notify.immediately_expire);
    }

    #[test]
    fn cancelled_payload_defaults_event_type() {
        let raw = br#"{"task_id":4,"retry_count":1,"should_notify":true}"#;
        let payload: CancelledTaskPayload = serde_json::from_slice(raw).unwrap();
        assert_eq!(payload.event_type, OlapEventType::Cancelled);
        assert_eq!(payload.attempt(), TaskIdRetryCount::new(4, 1));
    }

    #[test]
    fn notify_payloads_group_by_queue() {
        let entries: Vec<(&str, &[StrategyId])> =
            vec![("q1", &[1, 2]), ("q2", &[]), ("q1", &[2, 3])];
        let payloads = notify_payloads(entries);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].queue, "q1");
        assert_eq!(payloads[0].strategy_ids, vec![1, 2, 3]);
        assert!(payloads[1].strategy_ids.is_empty());
    }

    #[test]
    fn monitoring_payload_uses_wire_event_name() {
        let payload = CreateMonitoringEventPayload::new(
            1,
            0,
            OlapEventType::SchedulingTimedOut,
            Utc::now(),
        )
        .with_message("timed out waiting for a worker");
        assert_eq!(payload.event_type, "SCHEDULING_TIMED_OUT");
        assert!(payload.event_message.is_some());
    }
}
