//! Persistence contracts consumed by the execution core.
//!
//! The core issues logical operations against these traits; it never sees
//! queries. Every operation is one transaction: either all of its effects are
//! visible or none are. Per-attempt operations are keyed by
//! [`TaskIdRetryCount`] and must be idempotent, since the bus delivers at
//! least once.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kiln_core::{DispatcherId, ExternalId, StepId, TenantId, WorkerId, WorkflowId};

use crate::error::Result;
use crate::task::{
    DagId, DagWithData, ReleasedTask, RetriedTask, StrategyId, Task, TaskId, TaskIdRetryCount,
};
use crate::workflow::ConcurrencyStrategyKind;

pub use memory::InMemoryRepository;

/// One attempt to complete.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteTaskOpts {
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// Output produced by the step.
    pub output: serde_json::Value,
}

/// One attempt to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailTaskOpts {
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// True when user code failed, false for infrastructure failures.
    pub is_app_error: bool,
    /// Error text.
    pub error_msg: String,
}

/// Outcome of [`TaskRepository::fail_tasks`]. The two sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailTasksResult {
    /// Attempts that failed terminally.
    pub released: Vec<ReleasedTask>,
    /// Tasks re-queued under a new retry count.
    pub retried: Vec<RetriedTask>,
}

/// A user event to match against workflow event triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTriggerOpts {
    /// Event identifier.
    pub event_id: Uuid,
    /// Event key.
    pub key: String,
    /// Event body.
    pub data: serde_json::Value,
    /// Metadata copied onto triggered runs.
    pub additional_metadata: BTreeMap<String, String>,
}

/// A direct workflow invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowNameTriggerOpts {
    /// External id of the run to create.
    pub external_id: ExternalId,
    /// Workflow to run.
    pub workflow_name: String,
    /// Run input.
    pub data: serde_json::Value,
    /// Free-form metadata.
    pub additional_metadata: BTreeMap<String, String>,
    /// Spawning task, for child runs.
    pub parent_task_id: Option<TaskId>,
    /// Position of the child within its parent.
    pub child_index: Option<i64>,
    /// Caller-supplied child key.
    pub child_key: Option<String>,
}

/// Tasks and runs created by a trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerResult {
    /// Every task created, in any initial state.
    pub tasks: Vec<Task>,
    /// Runs created for multi-step workflows.
    pub dags: Vec<DagWithData>,
}

/// An internal event offered to the registered match conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEventMatch {
    /// Identifier of this candidate.
    pub id: Uuid,
    /// When the event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Event key.
    pub key: String,
    /// Event body.
    pub data: serde_json::Value,
}

/// Tasks created by satisfied match conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    /// Every task created, in any initial state.
    pub created_tasks: Vec<Task>,
}

/// Identity of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// The task.
    pub id: TaskId,
    /// Insertion timestamp.
    pub inserted_at: DateTime<Utc>,
    /// API-facing identifier.
    pub external_id: ExternalId,
    /// Current attempt.
    pub retry_count: i32,
    /// Workflow.
    pub workflow_id: WorkflowId,
    /// Parent DAG, if any.
    pub dag_id: Option<DagId>,
    /// Insertion timestamp of the parent DAG.
    pub dag_inserted_at: Option<DateTime<Utc>>,
}

/// Which deadline a task missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Waited in the queue longer than its schedule timeout.
    Schedule,
    /// Ran longer than its step timeout.
    Step,
}

/// A task whose deadline has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedOutTask {
    /// Snapshot of the task.
    pub task: Task,
    /// The missed deadline.
    pub kind: TimeoutKind,
}

/// A running attempt whose worker is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskToReassign {
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// The lost worker.
    pub worker_id: WorkerId,
}

/// A tenant as seen by the execution core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Identifier.
    pub id: TenantId,
    /// Scheduler partition the tenant is assigned to, if any.
    pub scheduler_partition_id: Option<String>,
}

/// A concurrency strategy attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyStrategy {
    /// Identifier.
    pub id: StrategyId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Workflow.
    pub workflow_id: WorkflowId,
    /// Step the strategy guards.
    pub step_id: StepId,
    /// Policy.
    pub kind: ConcurrencyStrategyKind,
    /// Key expression.
    pub expression: String,
    /// Admission bound.
    pub max_concurrency: i32,
    /// Whether the strategy still has work or recent activity.
    pub is_active: bool,
}

/// An attempt together with its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWithQueue {
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// The task's queue.
    pub queue: String,
}

/// Committed decisions of one strategy evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConcurrencyResult {
    /// Attempts moved into their queue.
    pub queued: Vec<TaskWithQueue>,
    /// Attempts that must be cancelled.
    pub cancelled: Vec<TaskWithQueue>,
    /// Strategies that received deferred attempts.
    pub next_strategy_ids: Vec<StrategyId>,
}

impl RunConcurrencyResult {
    /// Returns true if the evaluation changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.cancelled.is_empty() && self.next_strategy_ids.is_empty()
    }
}

/// Task mutations.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Completes each attempt that is still the active one. Returns the
    /// attempts whose completion released capacity.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn complete_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[CompleteTaskOpts],
    ) -> Result<Vec<ReleasedTask>>;

    /// Fails each attempt that is still the active one, re-queueing it when
    /// its retry budget allows.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn fail_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[FailTaskOpts],
    ) -> Result<FailTasksResult>;

    /// Cancels each attempt that is still the active one. Returns the
    /// cancelled attempts.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn cancel_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[TaskIdRetryCount],
    ) -> Result<Vec<ReleasedTask>>;

    /// Moves admitted, queued attempts onto workers. Returns the attempts
    /// that were assigned.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn assign_tasks(
        &self,
        tenant_id: TenantId,
        assignments: &[(TaskIdRetryCount, WorkerId)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskIdRetryCount>>;

    /// Lists up to `limit` tasks whose schedule or step deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_tasks_to_timeout(
        &self,
        tenant_id: TenantId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedOutTask>>;

    /// Lists up to `limit` running attempts whose worker is inactive.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_tasks_to_reassign(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<TaskToReassign>>;

    /// Resolves task ids to their row identity. Unknown ids are omitted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_task_metas(&self, tenant_id: TenantId, ids: &[TaskId]) -> Result<Vec<TaskMeta>>;

    /// Reads one task.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn read_task(&self, tenant_id: TenantId, id: TaskId) -> Result<Option<Task>>;

    /// Ensures the task table has partitions for today and tomorrow.
    ///
    /// # Errors
    ///
    /// Returns a storage error if partition DDL fails.
    async fn update_table_partitions(&self, now: DateTime<Utc>) -> Result<()>;
}

/// Task creation from events and direct invocations.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    /// Creates runs for every workflow whose event trigger matches.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn trigger_from_events(
        &self,
        tenant_id: TenantId,
        opts: &[EventTriggerOpts],
    ) -> Result<TriggerResult>;

    /// Creates runs by workflow name. Child spawns are idempotent on
    /// (parent, child index, child key).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn trigger_from_workflow_names(
        &self,
        tenant_id: TenantId,
        opts: &[WorkflowNameTriggerOpts],
    ) -> Result<TriggerResult>;
}

/// Event match conditions.
#[async_trait]
pub trait MatchRepository: Send + Sync {
    /// Offers internal events to the registered conditions and creates the
    /// tasks whose conditions became satisfied.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the transaction fails.
    async fn process_internal_event_matches(
        &self,
        tenant_id: TenantId,
        events: &[CandidateEventMatch],
    ) -> Result<MatchResult>;
}

/// Worker routing.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Resolves workers to the dispatcher that owns their connection.
    /// Unknown workers are omitted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn get_dispatcher_ids_for_workers(
        &self,
        tenant_id: TenantId,
        worker_ids: &[WorkerId],
    ) -> Result<HashMap<WorkerId, DispatcherId>>;
}

/// Tenant lookup.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Lists every tenant.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    /// Reads one tenant.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>>;
}

/// Concurrency strategy state.
#[async_trait]
pub trait ConcurrencyRepository: Send + Sync {
    /// Lists the active strategies of a tenant.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_active_strategies(&self, tenant_id: TenantId) -> Result<Vec<ConcurrencyStrategy>>;

    /// Evaluates a strategy under its advisory lock and commits the decisions.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::LockTimeout`] if the lock could not be
    /// acquired in time, or a storage error if the transaction fails.
    async fn run_concurrency_strategy(
        &self,
        tenant_id: TenantId,
        strategy: &ConcurrencyStrategy,
    ) -> Result<RunConcurrencyResult>;

    /// Refreshes the strategy's liveness flag. Returns the new value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    async fn update_concurrency_strategy_is_active(
        &self,
        tenant_id: TenantId,
        strategy: &ConcurrencyStrategy,
    ) -> Result<bool>;
}

/// Every repository the controller and concurrency supervisor use.
#[derive(Clone)]
pub struct Repositories {
    /// Task mutations.
    pub tasks: Arc<dyn TaskRepository>,
    /// Triggers.
    pub triggers: Arc<dyn TriggerRepository>,
    /// Match conditions.
    pub matches: Arc<dyn MatchRepository>,
    /// Worker routing.
    pub workers: Arc<dyn WorkerRepository>,
    /// Tenants.
    pub tenants: Arc<dyn TenantRepository>,
    /// Concurrency strategies.
    pub concurrency: Arc<dyn ConcurrencyRepository>,
}

impl Repositories {
    /// Uses one in-memory store for every repository.
    #[must_use]
    pub fn in_memory(store: &Arc<InMemoryRepository>) -> Self {
        Self {
            tasks: store.clone(),
            triggers: store.clone(),
            matches: store.clone(),
            workers: store.clone(),
            tenants: store.clone(),
            concurrency: store.clone(),
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
