//! Internal event keys and payload bodies.
//!
//! Every terminal transition of a task is announced as an internal event
//! whose key is derived from the task's external id. Match conditions (DAG
//! children waiting on parents) subscribe to these keys.

use serde::{Deserialize, Serialize};

use kiln_core::ExternalId;

/// Key announcing that a task completed (or was skipped).
#[must_use]
pub fn task_completed_event_key(external_id: &ExternalId) -> String {
    format!("task.completed.{external_id}")
}

/// Key announcing that a task failed terminally.
#[must_use]
pub fn task_failed_event_key(external_id: &ExternalId) -> String {
    format!("task.failed.{external_id}")
}

/// Key announcing that a task was cancelled.
#[must_use]
pub fn task_cancelled_event_key(external_id: &ExternalId) -> String {
    format!("task.cancelled.{external_id}")
}

/// Outcome announced by an internal task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// The task completed or was skipped.
    Completed,
    /// The task failed terminally.
    Failed,
    /// The task was cancelled.
    Cancelled,
}

impl TaskOutcome {
    /// Returns the event key announcing this outcome for a task.
    #[must_use]
    pub fn event_key(self, external_id: &ExternalId) -> String {
        match self {
            Self::Completed => task_completed_event_key(external_id),
            Self::Failed => task_failed_event_key(external_id),
            Self::Cancelled => task_cancelled_event_key(external_id),
        }
    }
}

/// Splits an internal event key into its outcome and task external id.
///
/// Returns `None` for keys that do not announce a task outcome.
#[must_use]
pub fn parse_task_event_key(key: &str) -> Option<(TaskOutcome, ExternalId)> {
    let (outcome, rest) = if let Some(rest) = key.strip_prefix("task.completed.") {
        (TaskOutcome::Completed, rest)
    } else if let Some(rest) = key.strip_prefix("task.failed.") {
        (TaskOutcome::Failed, rest)
    } else if let Some(rest) = key.strip_prefix("task.cancelled.") {
        (TaskOutcome::Cancelled, rest)
    } else {
        return None;
    };
    rest.parse().ok().map(|id| (outcome, id))
}

/// Body of a completion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedData {
    /// Readable id of the step that completed.
    pub step_readable_id: String,
    /// Output produced by the step.
    pub output: serde_json::Value,
}

impl CompletedData {
    /// Body announced for a task skipped at creation.
    #[must_use]
    pub fn skipped(step_readable_id: impl Into<String>) -> Self {
        Self {
            step_readable_id: step_readable_id.into(),
            output: serde_json::json!({ "skipped": true }),
        }
    }
}

/// Body of a failure or cancellation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedData {
    /// Readable id of the step that failed.
    pub step_readable_id: String,
    /// Error text.
    pub error: String,
}

/// Error text announced for cancellations.
pub const TASK_CANCELLED_ERROR: &str = "task was cancelled";
