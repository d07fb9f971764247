//! Analytical read model and status reconciliation.
//!
//! Task lifecycle events are appended to an immutable event log and to a
//! temporary reconciliation queue. A periodic fold applies the queued events
//! to the materialized `readable_status` of each task and DAG, advancing it
//! monotonically:
//!
//! ```text
//! QUEUED(0) < RUNNING(1) < COMPLETED(2) < CANCELLED(3) < FAILED(4)
//! ```
//!
//! A status only changes when the candidate attempt is at least the recorded
//! one and the candidate status outranks the recorded status, so duplicate
//! and out-of-order deliveries can never regress what readers see.

pub mod controller;
pub mod dedup;
pub mod fold;
pub mod memory;
pub mod partitions;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use kiln_core::{DagExternalId, ExternalId, TenantId, WorkerId, WorkflowId};

use crate::error::{Error, Result};
use crate::task::{DagId, DagWithData, Task, TaskId};

/// The status shown to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadableStatus {
    /// Waiting to run.
    Queued,
    /// Running on a worker.
    Running,
    /// Finished successfully (or skipped).
    Completed,
    /// Cancelled.
    Cancelled,
    /// Failed terminally.
    Failed,
}

impl ReadableStatus {
    /// Every status, in rank order.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Cancelled,
        Self::Failed,
    ];

    /// Returns the rank used for monotonic advancement.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Cancelled => 3,
            Self::Failed => 4,
        }
    }

    /// Returns true if `self` strictly outranks `other`.
    #[must_use]
    pub const fn outranks(self, other: Self) -> bool {
        self.rank() > other.rank()
    }

    /// Returns true for statuses that end an attempt.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReadableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task lifecycle event recorded in the analytical log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OlapEventType {
    /// A failed attempt will be retried.
    Retrying,
    /// The attempt was moved off a lost worker.
    Reassigned,
    /// A user requested a retry.
    RetriedByUser,
    /// The task was created.
    Created,
    /// The task entered the queue.
    Queued,
    /// No worker was available.
    RequeuedNoWorker,
    /// A rate limit deferred the task.
    RequeuedRateLimit,
    /// The task was assigned to a worker.
    Assigned,
    /// The worker acknowledged the assignment.
    Acknowledged,
    /// The task was sent to the worker.
    SentToWorker,
    /// The worker released its slot early.
    SlotReleased,
    /// The worker started executing.
    Started,
    /// The worker extended its timeout.
    TimeoutRefreshed,
    /// The task waited in the queue past its schedule timeout.
    SchedulingTimedOut,
    /// The attempt finished successfully.
    Finished,
    /// The attempt failed.
    Failed,
    /// The task was cancelled.
    Cancelled,
    /// The attempt exceeded its step timeout.
    TimedOut,
    /// The attempt failed on a rate limit error.
    RateLimitError,
    /// The task was skipped at creation.
    Skipped,
}

impl OlapEventType {
    /// Every event type.
    pub const ALL: [Self; 20] = [
        Self::Retrying,
        Self::Reassigned,
        Self::RetriedByUser,
        Self::Created,
        Self::Queued,
        Self::RequeuedNoWorker,
        Self::RequeuedRateLimit,
        Self::Assigned,
        Self::Acknowledged,
        Self::SentToWorker,
        Self::SlotReleased,
        Self::Started,
        Self::TimeoutRefreshed,
        Self::SchedulingTimedOut,
        Self::Finished,
        Self::Failed,
        Self::Cancelled,
        Self::TimedOut,
        Self::RateLimitError,
        Self::Skipped,
    ];

    /// Returns the readable status the event implies.
    #[must_use]
    pub const fn readable_status(self) -> ReadableStatus {
        match self {
            Self::Retrying
            | Self::Reassigned
            | Self::RetriedByUser
            | Self::Created
            | Self::Queued
            | Self::RequeuedNoWorker
            | Self::RequeuedRateLimit => ReadableStatus::Queued,
            Self::Assigned
            | Self::Acknowledged
            | Self::SentToWorker
            | Self::SlotReleased
            | Self::Started
            | Self::TimeoutRefreshed => ReadableStatus::Running,
            Self::Finished | Self::Skipped => ReadableStatus::Completed,
            Self::Cancelled | Self::SchedulingTimedOut => ReadableStatus::Cancelled,
            Self::Failed | Self::TimedOut | Self::RateLimitError => ReadableStatus::Failed,
        }
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retrying => "RETRYING",
            Self::Reassigned => "REASSIGNED",
            Self::RetriedByUser => "RETRIED_BY_USER",
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::RequeuedNoWorker => "REQUEUED_NO_WORKER",
            Self::RequeuedRateLimit => "REQUEUED_RATE_LIMIT",
            Self::Assigned => "ASSIGNED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::SentToWorker => "SENT_TO_WORKER",
            Self::SlotReleased => "SLOT_RELEASED",
            Self::Started => "STARTED",
            Self::TimeoutRefreshed => "TIMEOUT_REFRESHED",
            Self::SchedulingTimedOut => "SCHEDULING_TIMED_OUT",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
            Self::RateLimitError => "RATE_LIMIT_ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for OlapEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OlapEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEventType {
                event_type: s.to_string(),
            })
    }
}

/// An immutable entry of the analytical event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The task.
    pub task_id: TaskId,
    /// Insertion timestamp of the task.
    pub task_inserted_at: DateTime<Utc>,
    /// The attempt.
    pub retry_count: i32,
    /// What happened.
    pub event_type: OlapEventType,
    /// Status implied by `event_type`.
    pub readable_status: ReadableStatus,
    /// When it happened.
    pub event_timestamp: DateTime<Utc>,
    /// Worker involved, if any.
    pub worker_id: Option<WorkerId>,
    /// Output or error payload.
    pub payload: String,
    /// Human readable note.
    pub message: Option<String>,
}

impl TaskEvent {
    /// Creates an event whose readable status is derived from its type.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        task_id: TaskId,
        task_inserted_at: DateTime<Utc>,
        retry_count: i32,
        event_type: OlapEventType,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            task_id,
            task_inserted_at,
            retry_count,
            event_type,
            readable_status: event_type.readable_status(),
            event_timestamp,
            worker_id: None,
            payload: String::new(),
            message: None,
        }
    }

    /// Natural key used for deduplication: one event type per attempt.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}-{}-{}", self.task_id, self.event_type, self.retry_count)
    }
}

/// A task row of the read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlapTask {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Numeric identifier.
    pub id: TaskId,
    /// Insertion timestamp.
    pub inserted_at: DateTime<Utc>,
    /// API-facing identifier.
    pub external_id: ExternalId,
    /// Queue.
    pub queue: String,
    /// Workflow.
    pub workflow_id: WorkflowId,
    /// Parent DAG, if any.
    pub dag_id: Option<DagId>,
    /// Insertion timestamp of the parent DAG.
    pub dag_inserted_at: Option<DateTime<Utc>>,
    /// Display name.
    pub display_name: String,
    /// Task input.
    pub input: serde_json::Value,
    /// Free-form metadata.
    pub additional_metadata: BTreeMap<String, String>,
    /// Materialized status.
    pub readable_status: ReadableStatus,
    /// Attempt the status belongs to.
    pub latest_retry_count: i32,
    /// Worker of the latest applied event that named one.
    pub latest_worker_id: Option<WorkerId>,
}

impl OlapTask {
    /// Builds the read-model row for a freshly created task.
    ///
    /// Tasks created in a terminal state start out `QUEUED` like every other
    /// task; their terminal event moves them forward.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            tenant_id: task.tenant_id,
            id: task.id,
            inserted_at: task.inserted_at,
            external_id: task.external_id,
            queue: task.queue.clone(),
            workflow_id: task.workflow_id,
            dag_id: task.dag_id,
            dag_inserted_at: task.dag_inserted_at,
            display_name: task.display_name.clone(),
            input: task.input.clone(),
            additional_metadata: task.additional_metadata.clone(),
            readable_status: ReadableStatus::Queued,
            latest_retry_count: 0,
            latest_worker_id: None,
        }
    }
}

/// A DAG row of the read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlapDag {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Numeric identifier.
    pub id: DagId,
    /// Insertion timestamp.
    pub inserted_at: DateTime<Utc>,
    /// API-facing identifier.
    pub external_id: DagExternalId,
    /// Workflow.
    pub workflow_id: WorkflowId,
    /// Display name.
    pub display_name: String,
    /// Run input.
    pub input: serde_json::Value,
    /// Free-form metadata.
    pub additional_metadata: BTreeMap<String, String>,
    /// Number of tasks the run will have.
    pub total_tasks: usize,
    /// Materialized status folded from the run's tasks.
    pub readable_status: ReadableStatus,
}

impl OlapDag {
    /// Builds the read-model row for a freshly created DAG.
    #[must_use]
    pub fn from_dag(dag: &DagWithData) -> Self {
        Self {
            tenant_id: dag.dag.tenant_id,
            id: dag.dag.id,
            inserted_at: dag.dag.inserted_at,
            external_id: dag.dag.external_id,
            workflow_id: dag.dag.workflow_id,
            display_name: dag.dag.display_name.clone(),
            input: dag.input.clone(),
            additional_metadata: dag.additional_metadata.clone(),
            total_tasks: dag.total_tasks,
            readable_status: ReadableStatus::Queued,
        }
    }
}

/// Filters for [`OlapRepository::list_tasks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTaskRunOpts {
    /// Only tasks inserted at or after this instant.
    pub created_after: DateTime<Utc>,
    /// Statuses to include; empty means all.
    pub statuses: Vec<ReadableStatus>,
    /// Workflows to include; empty means all.
    pub workflow_ids: Vec<WorkflowId>,
    /// Only tasks whose latest attempt ran on this worker.
    pub worker_id: Option<WorkerId>,
    /// Only tasks that reached a terminal status at or before this instant.
    pub finished_before: Option<DateTime<Utc>>,
    /// Metadata pairs that must all be present.
    pub additional_metadata: BTreeMap<String, String>,
    /// Page size.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
}

impl ListTaskRunOpts {
    /// Lists everything created after `created_after`, fifty at a time.
    #[must_use]
    pub fn since(created_after: DateTime<Utc>) -> Self {
        Self {
            created_after,
            statuses: Vec::new(),
            workflow_ids: Vec::new(),
            worker_id: None,
            finished_before: None,
            additional_metadata: BTreeMap::new(),
            limit: 50,
            offset: 0,
        }
    }

    /// Returns the statuses to include, defaulting to all of them.
    #[must_use]
    pub fn effective_statuses(&self) -> Vec<ReadableStatus> {
        if self.statuses.is_empty() {
            ReadableStatus::ALL.to_vec()
        } else {
            self.statuses.clone()
        }
    }
}

/// Task count per readable status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunMetric {
    /// The status.
    pub status: ReadableStatus,
    /// How many tasks currently have it.
    pub count: u64,
}

/// Date-partitioned tables of the read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OlapTable {
    /// Task rows.
    Tasks,
    /// DAG rows.
    Dags,
    /// Run lookup rows (one per task or DAG run).
    Runs,
}

impl OlapTable {
    /// Every partitioned table.
    pub const ALL: [Self; 3] = [Self::Tasks, Self::Dags, Self::Runs];

    /// Returns the table name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tasks => "v2_tasks_olap",
            Self::Dags => "v2_dags_olap",
            Self::Runs => "v2_runs_olap",
        }
    }
}

/// Outcome of one partition maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMaintenance {
    /// Partitions created by this pass.
    pub created: Vec<String>,
    /// Partitions detached and dropped by this pass.
    pub dropped: Vec<String>,
}

/// Maps a numeric id onto one of `partitions` reconciliation shards.
#[must_use]
pub fn hash_partition(id: i64, partitions: usize) -> usize {
    let partitions = i64::try_from(partitions.max(1)).unwrap_or(i64::MAX);
    usize::try_from(id.rem_euclid(partitions)).unwrap_or(0)
}

/// Storage for the analytical read model.
#[async_trait]
pub trait OlapRepository: Send + Sync {
    /// Number of hash partitions reconciliation is sharded across.
    fn partition_count(&self) -> usize;

    /// Inserts task rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartitionMissing`] if no partition covers a task's date.
    async fn create_tasks(&self, tenant_id: TenantId, tasks: &[Task]) -> Result<()>;

    /// Inserts DAG rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartitionMissing`] if no partition covers a DAG's date.
    async fn create_dags(&self, tenant_id: TenantId, dags: &[DagWithData]) -> Result<()>;

    /// Appends events to the permanent log and to the reconciliation queue in
    /// one transaction. Duplicates are harmless.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    async fn insert_task_events(&self, tenant_id: TenantId, events: &[TaskEvent]) -> Result<()>;

    /// Folds up to `limit` queued events of one partition into task statuses.
    /// Returns how many events were taken from the queue.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the fold fails.
    async fn update_task_statuses(
        &self,
        tenant_id: TenantId,
        partition: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Folds up to `limit` queued DAG updates of one partition into DAG
    /// statuses. Returns how many updates were taken from the queue.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the fold fails.
    async fn update_dag_statuses(
        &self,
        tenant_id: TenantId,
        partition: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    /// Creates today's and tomorrow's partitions and drops expired ones.
    ///
    /// # Errors
    ///
    /// Returns a storage error if partition DDL fails.
    async fn update_table_partitions(&self, now: DateTime<Utc>) -> Result<PartitionMaintenance>;

    /// Lists the attached partitions of a table by date.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the catalog cannot be read.
    async fn list_partitions(&self, table: OlapTable) -> Result<Vec<NaiveDate>>;

    /// Reads one task by external id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn read_task_run(
        &self,
        tenant_id: TenantId,
        external_id: ExternalId,
    ) -> Result<Option<OlapTask>>;

    /// Reads one DAG by external id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn read_dag(
        &self,
        tenant_id: TenantId,
        external_id: DagExternalId,
    ) -> Result<Option<OlapDag>>;

    /// Lists tasks matching `opts`, newest first, with the total match count.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_tasks(
        &self,
        tenant_id: TenantId,
        opts: &ListTaskRunOpts,
    ) -> Result<(Vec<OlapTask>, usize)>;

    /// Lists the events of one task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn list_task_events(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        task_inserted_at: DateTime<Utc>,
    ) -> Result<Vec<TaskEvent>>;

    /// Counts tasks per readable status.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    async fn read_task_run_metrics(
        &self,
        tenant_id: TenantId,
        created_after: DateTime<Utc>,
        workflow_ids: &[WorkflowId],
    ) -> Result<Vec<TaskRunMetric>>;
}
