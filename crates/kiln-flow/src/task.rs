//! Task model and lifecycle states.
//!
//! A task is one schedulable unit of work. Each execution attempt is
//! identified by `(id, retry_count)`; every per-attempt operation is keyed on
//! that pair so that duplicate or stale deliveries are no-ops.
//!
//! ## State Machine
//!
//! ```text
//! QUEUED ──► RUNNING ──► COMPLETED
//!    ▲          │
//!    │          ├──► FAILED (terminal)
//!    └─ retry ──┤
//!               └──► CANCELLED
//!
//! FAILED / CANCELLED / SKIPPED may also be assigned at creation time.
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use kiln_core::{DagExternalId, ExternalId, StepId, TenantId, WorkerId, WorkflowId};

/// Partition-local, monotonically assigned task identifier.
pub type TaskId = i64;

/// Partition-local DAG identifier.
pub type DagId = i64;

/// Identifier of a step concurrency strategy.
pub type StrategyId = i64;

/// The lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting for admission or assignment.
    Queued,
    /// Assigned to a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with no retries left.
    Failed,
    /// Cancelled by a user, a concurrency strategy or a timeout.
    Cancelled,
    /// Skipped at creation because a skip condition matched.
    Skipped,
}

impl TaskState {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// The state a task was created in.
///
/// Anything other than `Queued` bypasses `RUNNING` entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialState {
    /// Ready for concurrency admission or scheduling.
    Queued,
    /// A trigger-time evaluation failed.
    Failed,
    /// A parent failed or was cancelled.
    Cancelled,
    /// A skip condition matched.
    Skipped,
}

impl From<InitialState> for TaskState {
    fn from(state: InitialState) -> Self {
        match state {
            InitialState::Queued => Self::Queued,
            InitialState::Failed => Self::Failed,
            InitialState::Cancelled => Self::Cancelled,
            InitialState::Skipped => Self::Skipped,
        }
    }
}

/// Identifies one execution attempt of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskIdRetryCount {
    /// The task.
    pub id: TaskId,
    /// The attempt.
    pub retry_count: i32,
}

impl TaskIdRetryCount {
    /// Creates a new attempt key.
    #[must_use]
    pub const fn new(id: TaskId, retry_count: i32) -> Self {
        Self { id, retry_count }
    }
}

/// A canonical task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Numeric identifier.
    pub id: TaskId,
    /// Insertion timestamp; part of the row's unique key.
    pub inserted_at: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// API-facing identifier.
    pub external_id: ExternalId,
    /// Queue the task is scheduled from.
    pub queue: String,
    /// Step this task executes.
    pub step_id: StepId,
    /// Human readable step name, used as the key for parent outputs.
    pub step_readable_id: String,
    /// Workflow the step belongs to.
    pub workflow_id: WorkflowId,
    /// Display name used by read models.
    pub display_name: String,
    /// Parent DAG, if the task belongs to a multi-step run.
    pub dag_id: Option<DagId>,
    /// Insertion timestamp of the parent DAG.
    pub dag_inserted_at: Option<DateTime<Utc>>,
    /// Task input.
    pub input: serde_json::Value,
    /// Free-form metadata propagated from the trigger.
    pub additional_metadata: BTreeMap<String, String>,
    /// Current attempt. Only ever increases.
    pub retry_count: i32,
    /// Attempts consumed by infrastructure failures.
    pub internal_retry_count: i32,
    /// Application-error retries the step allows.
    pub retries: i32,
    /// Current lifecycle state.
    pub state: TaskState,
    /// State at creation.
    pub initial_state: InitialState,
    /// Why the task was created in a terminal state.
    pub initial_state_reason: Option<String>,
    /// Worker the task should preferably run on.
    pub desired_worker_id: Option<WorkerId>,
    /// Worker the current attempt is assigned to.
    pub worker_id: Option<WorkerId>,
    /// Evaluated concurrency keys, one per strategy.
    pub concurrency_keys: Vec<String>,
    /// Concurrency strategies the task must pass, in order.
    pub concurrency_strategy_ids: Vec<StrategyId>,
    /// Seconds the task may wait in the queue before it is cancelled.
    pub schedule_timeout_secs: i64,
    /// Seconds an attempt may run before it is failed.
    pub step_timeout_secs: i64,
    /// Deadline for leaving the queue, while queued.
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    /// Deadline for finishing, while running.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Spawning task for child workflows.
    pub parent_task_id: Option<TaskId>,
    /// Position among the parent's children.
    pub child_index: Option<i64>,
    /// Caller-chosen key among the parent's children.
    pub child_key: Option<String>,
}

impl Task {
    /// Returns the key of the currently active attempt.
    #[must_use]
    pub const fn attempt(&self) -> TaskIdRetryCount {
        TaskIdRetryCount::new(self.id, self.retry_count)
    }

    /// Returns true if `attempt` refers to the currently active attempt and
    /// the task can still transition.
    #[must_use]
    pub fn accepts(&self, attempt: TaskIdRetryCount) -> bool {
        attempt.id == self.id
            && attempt.retry_count == self.retry_count
            && !self.state.is_terminal()
    }

    /// Returns the schedule timeout as a duration.
    #[must_use]
    pub fn schedule_timeout(&self) -> Duration {
        Duration::seconds(self.schedule_timeout_secs)
    }

    /// Returns the step timeout as a duration.
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::seconds(self.step_timeout_secs)
    }
}

/// A task whose terminal transition released capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedTask {
    /// Numeric identifier.
    pub id: TaskId,
    /// Insertion timestamp.
    pub inserted_at: DateTime<Utc>,
    /// Attempt that was released.
    pub retry_count: i32,
    /// API-facing identifier.
    pub external_id: ExternalId,
    /// Human readable step name.
    pub step_readable_id: String,
    /// Queue the task was scheduled from.
    pub queue: String,
    /// Worker the attempt was assigned to, if any.
    pub worker_id: Option<WorkerId>,
    /// Concurrency strategies whose slots were freed.
    pub concurrency_strategy_ids: Vec<StrategyId>,
}

impl ReleasedTask {
    /// Builds the release record for a task's current attempt.
    #[must_use]
    pub fn from_task(task: &Task, concurrency_strategy_ids: Vec<StrategyId>) -> Self {
        Self {
            id: task.id,
            inserted_at: task.inserted_at,
            retry_count: task.retry_count,
            external_id: task.external_id,
            step_readable_id: task.step_readable_id.clone(),
            queue: task.queue.clone(),
            worker_id: task.worker_id,
            concurrency_strategy_ids,
        }
    }
}

/// A failed attempt that was re-queued under a new retry count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriedTask {
    /// Numeric identifier.
    pub id: TaskId,
    /// The new attempt.
    pub retry_count: i32,
    /// The attempt whose failure caused the retry.
    pub failed_attempt: TaskIdRetryCount,
    /// Queue the retry waits in.
    pub queue: String,
    /// Whether the failure that caused the retry came from user code.
    pub is_app_error: bool,
    /// Worker the failed attempt ran on.
    pub worker_id: Option<WorkerId>,
    /// Concurrency strategies whose slots were freed by the failed attempt.
    pub concurrency_strategy_ids: Vec<StrategyId>,
}

/// A DAG (workflow run) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    /// Numeric identifier.
    pub id: DagId,
    /// Insertion timestamp.
    pub inserted_at: DateTime<Utc>,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// API-facing identifier.
    pub external_id: DagExternalId,
    /// Workflow the run executes.
    pub workflow_id: WorkflowId,
    /// Display name used by read models.
    pub display_name: String,
}

/// A freshly created DAG together with the data read models need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagWithData {
    /// The DAG row.
    #[serde(flatten)]
    pub dag: Dag,
    /// Run input.
    pub input: serde_json::Value,
    /// Free-form metadata.
    pub additional_metadata: BTreeMap<String, String>,
    /// Number of steps (and therefore tasks) the run will have.
    pub total_tasks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
    }

    #[test]
    fn initial_state_maps_to_task_state() {
        assert_eq!(TaskState::from(InitialState::Skipped), TaskState::Skipped);
        assert_eq!(TaskState::from(InitialState::Queued), TaskState::Queued);
    }

    #[test]
    fn states_serialize_upper_case() {
        let json = serde_json::to_string(&TaskState::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        assert_eq!(TaskState::Cancelled.as_str(), "CANCELLED");
    }
}
