//! In-memory read model.
//!
//! Like the in-memory task store, every operation holds the state lock for
//! its whole duration. Pending events and DAG updates are kept in arrival
//! order and carry the hash partition they belong to.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use kiln_core::{DagExternalId, ExternalId, TenantId, WorkflowId};

use super::fold::{MAX_REQUEUE_RETRIES, PendingEvent, fold_dag_status, fold_pending, should_apply};
use super::partitions::{partition_name, plan_partitions};
use super::{
    ListTaskRunOpts, OlapDag, OlapRepository, OlapTable, OlapTask, PartitionMaintenance,
    ReadableStatus, TaskEvent, TaskRunMetric, hash_partition,
};
use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::task::{DagId, DagWithData, Task, TaskId};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// A DAG whose status may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingDagUpdate {
    tenant_id: TenantId,
    dag_id: DagId,
    requeue_after: DateTime<Utc>,
    requeue_retries: i32,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, OlapTask>,
    tasks_by_external_id: HashMap<ExternalId, TaskId>,
    finished_at: HashMap<TaskId, DateTime<Utc>>,
    dags: BTreeMap<DagId, OlapDag>,
    dags_by_external_id: HashMap<DagExternalId, DagId>,
    events: Vec<TaskEvent>,
    pending_events: Vec<(usize, PendingEvent)>,
    pending_dags: Vec<(usize, PendingDagUpdate)>,
    partitions: BTreeMap<OlapTable, BTreeSet<NaiveDate>>,
}

impl State {
    fn require_partition(&self, table: OlapTable, at: DateTime<Utc>) -> Result<()> {
        let date = at.date_naive();
        if self.partitions.get(&table).is_some_and(|p| p.contains(&date)) {
            Ok(())
        } else {
            Err(Error::PartitionMissing {
                table: table.name().to_string(),
                date,
            })
        }
    }

    /// Removes up to `limit` due entries of one tenant and partition.
    fn take_due<T, F>(
        queue: &mut Vec<(usize, T)>,
        partition: usize,
        limit: usize,
        is_due: F,
    ) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(queue.len());
        for (p, item) in queue.drain(..) {
            if taken.len() < limit && p == partition && is_due(&item) {
                taken.push(item);
            } else {
                kept.push((p, item));
            }
        }
        *queue = kept;
        taken
    }
}

/// In-memory [`OlapRepository`].
pub struct InMemoryOlapRepository {
    state: RwLock<State>,
    partition_count: usize,
    retention_days: u32,
}

impl std::fmt::Debug for InMemoryOlapRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOlapRepository")
            .field("partition_count", &self.partition_count)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryOlapRepository {
    fn default() -> Self {
        Self::with_config(&FlowConfig::default())
    }
}

impl InMemoryOlapRepository {
    /// Creates an empty read model using the partition count and retention
    /// window from `config`.
    #[must_use]
    pub fn with_config(config: &FlowConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            partition_count: config.reconcile_partitions.max(1),
            retention_days: config.retention_days,
        }
    }

    /// Number of events in the permanent log.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn event_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.events.len())
    }

    /// Number of events waiting for reconciliation, due or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_event_count(&self) -> Result<usize> {
        Ok(self.state.read().map_err(poison_err)?.pending_events.len())
    }

    /// Earliest instant a pending event of `task_id` becomes due, with its
    /// requeue count.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pending_event_schedule(&self, task_id: TaskId) -> Result<Option<(DateTime<Utc>, i32)>> {
        let state = self.state.read().map_err(poison_err)?;
        let schedule = state
            .pending_events
            .iter()
            .filter(|(_, e)| e.task_id == task_id)
            .map(|(_, e)| (e.requeue_after, e.requeue_retries))
            .min();
        drop(state);
        Ok(schedule)
    }

    /// Attaches a partition directly, for backfills and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn attach_partition(&self, table: OlapTable, date: NaiveDate) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.partitions.entry(table).or_default().insert(date);
        drop(state);
        Ok(())
    }
}

#[async_trait]
impl OlapRepository for InMemoryOlapRepository {
    fn partition_count(&self) -> usize {
        self.partition_count
    }

    async fn create_tasks(&self, tenant_id: TenantId, tasks: &[Task]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for task in tasks {
            state.require_partition(OlapTable::Tasks, task.inserted_at)?;
            state.require_partition(OlapTable::Runs, task.inserted_at)?;
        }
        for task in tasks.iter().filter(|t| t.tenant_id == tenant_id) {
            if state.tasks.contains_key(&task.id) {
                continue;
            }
            state.tasks_by_external_id.insert(task.external_id, task.id);
            state.tasks.insert(task.id, OlapTask::from_task(task));
        }
        drop(state);
        Ok(())
    }

    async fn create_dags(&self, tenant_id: TenantId, dags: &[DagWithData]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for dag in dags {
            state.require_partition(OlapTable::Dags, dag.dag.inserted_at)?;
            state.require_partition(OlapTable::Runs, dag.dag.inserted_at)?;
        }
        for dag in dags.iter().filter(|d| d.dag.tenant_id == tenant_id) {
            if state.dags.contains_key(&dag.dag.id) {
                continue;
            }
            state.dags_by_external_id.insert(dag.dag.external_id, dag.dag.id);
            state.dags.insert(dag.dag.id, OlapDag::from_dag(dag));
        }
        drop(state);
        Ok(())
    }

    async fn insert_task_events(&self, tenant_id: TenantId, events: &[TaskEvent]) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        for event in events.iter().filter(|e| e.tenant_id == tenant_id) {
            let partition = hash_partition(event.task_id, self.partition_count);
            state.events.push(event.clone());
            state
                .pending_events
                .push((partition, PendingEvent::from_event(event, now)));
        }
        drop(state);
        Ok(())
    }

    async fn update_task_statuses(
        &self,
        tenant_id: TenantId,
        partition: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut guard = self.state.write().map_err(poison_err)?;
        let state = &mut *guard;
        // Fresh events are always due; only requeued ones wait for their backoff.
        let batch = State::take_due(&mut state.pending_events, partition, limit, |e| {
            e.tenant_id == tenant_id && (e.requeue_retries == 0 || e.requeue_after <= now)
        });
        let taken = batch.len();

        let mut changed_dags = BTreeSet::new();
        for update in fold_pending(&batch) {
            let Some(task) = state.tasks.get_mut(&update.task_id) else {
                continue;
            };
            if !should_apply(
                task.latest_retry_count,
                task.readable_status,
                update.retry_count,
                update.readable_status,
            ) {
                continue;
            }
            task.readable_status = update.readable_status;
            task.latest_retry_count = update.retry_count;
            if update.worker_id.is_some() {
                task.latest_worker_id = update.worker_id;
            }
            if let Some(dag_id) = task.dag_id {
                changed_dags.insert(dag_id);
            }
            if update.readable_status.is_terminal() {
                state.finished_at.insert(update.task_id, update.event_timestamp);
            } else {
                state.finished_at.remove(&update.task_id);
            }
        }

        // Events that arrived before their task are retried later.
        let mut dropped = 0_usize;
        for event in batch {
            if state.tasks.contains_key(&event.task_id) {
                continue;
            }
            match event.requeued(now) {
                Some(requeued) => state.pending_events.push((partition, requeued)),
                None => dropped += 1,
            }
        }

        for dag_id in changed_dags {
            let dag_partition = hash_partition(dag_id, self.partition_count);
            let already_pending = state
                .pending_dags
                .iter()
                .any(|(_, d)| d.dag_id == dag_id && d.requeue_retries == 0);
            if !already_pending {
                state.pending_dags.push((
                    dag_partition,
                    PendingDagUpdate {
                        tenant_id,
                        dag_id,
                        requeue_after: now,
                        requeue_retries: 0,
                    },
                ));
            }
        }
        drop(guard);

        if dropped > 0 {
            tracing::warn!(
                tenant_id = %tenant_id,
                partition,
                dropped,
                max_requeues = MAX_REQUEUE_RETRIES,
                "dropped events whose task never appeared"
            );
        }
        Ok(taken)
    }

    async fn update_dag_statuses(
        &self,
        tenant_id: TenantId,
        partition: usize,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut guard = self.state.write().map_err(poison_err)?;
        let state = &mut *guard;
        let batch = State::take_due(&mut state.pending_dags, partition, limit, |d| {
            d.tenant_id == tenant_id && d.requeue_after <= now
        });
        let taken = batch.len();

        let mut seen = BTreeSet::new();
        for update in batch {
            if !seen.insert(update.dag_id) {
                continue;
            }
            let Some(total_tasks) = state.dags.get(&update.dag_id).map(|d| d.total_tasks) else {
                if update.requeue_retries < MAX_REQUEUE_RETRIES {
                    let delay = super::fold::requeue_delay(update.requeue_retries);
                    state.pending_dags.push((
                        partition,
                        PendingDagUpdate {
                            requeue_after: now + delay,
                            requeue_retries: update.requeue_retries + 1,
                            ..update
                        },
                    ));
                }
                continue;
            };
            let statuses: Vec<ReadableStatus> = state
                .tasks
                .values()
                .filter(|t| t.dag_id == Some(update.dag_id))
                .map(|t| t.readable_status)
                .collect();
            let candidate = fold_dag_status(total_tasks, &statuses);
            if let Some(dag) = state.dags.get_mut(&update.dag_id) {
                if candidate.outranks(dag.readable_status) {
                    dag.readable_status = candidate;
                }
            }
        }
        drop(guard);
        Ok(taken)
    }

    async fn update_table_partitions(&self, now: DateTime<Utc>) -> Result<PartitionMaintenance> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut maintenance = PartitionMaintenance::default();
        for table in OlapTable::ALL {
            let existing = state.partitions.entry(table).or_default();
            let plan = plan_partitions(existing, now, self.retention_days);
            for date in &plan.create {
                existing.insert(*date);
                maintenance.created.push(partition_name(table, *date));
            }
            for date in &plan.drop {
                existing.remove(date);
                maintenance.dropped.push(partition_name(table, *date));
            }
            let expired: BTreeSet<NaiveDate> = plan.drop.into_iter().collect();
            if expired.is_empty() {
                continue;
            }
            match table {
                OlapTable::Tasks => {
                    let removed: Vec<(TaskId, ExternalId)> = state
                        .tasks
                        .values()
                        .filter(|t| expired.contains(&t.inserted_at.date_naive()))
                        .map(|t| (t.id, t.external_id))
                        .collect();
                    for (id, external_id) in removed {
                        state.tasks.remove(&id);
                        state.tasks_by_external_id.remove(&external_id);
                        state.finished_at.remove(&id);
                    }
                }
                OlapTable::Dags => {
                    let removed: Vec<(DagId, DagExternalId)> = state
                        .dags
                        .values()
                        .filter(|d| expired.contains(&d.inserted_at.date_naive()))
                        .map(|d| (d.id, d.external_id))
                        .collect();
                    for (id, external_id) in removed {
                        state.dags.remove(&id);
                        state.dags_by_external_id.remove(&external_id);
                    }
                }
                OlapTable::Runs => {}
            }
        }
        drop(state);
        Ok(maintenance)
    }

    async fn list_partitions(&self, table: OlapTable) -> Result<Vec<NaiveDate>> {
        let state = self.state.read().map_err(poison_err)?;
        let dates = state
            .partitions
            .get(&table)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        drop(state);
        Ok(dates)
    }

    async fn read_task_run(
        &self,
        tenant_id: TenantId,
        external_id: ExternalId,
    ) -> Result<Option<OlapTask>> {
        let state = self.state.read().map_err(poison_err)?;
        let task = state
            .tasks_by_external_id
            .get(&external_id)
            .and_then(|id| state.tasks.get(id))
            .filter(|t| t.tenant_id == tenant_id)
            .cloned();
        drop(state);
        Ok(task)
    }

    async fn read_dag(
        &self,
        tenant_id: TenantId,
        external_id: DagExternalId,
    ) -> Result<Option<OlapDag>> {
        let state = self.state.read().map_err(poison_err)?;
        let dag = state
            .dags_by_external_id
            .get(&external_id)
            .and_then(|id| state.dags.get(id))
            .filter(|d| d.tenant_id == tenant_id)
            .cloned();
        drop(state);
        Ok(dag)
    }

    async fn list_tasks(
        &self,
        tenant_id: TenantId,
        opts: &ListTaskRunOpts,
    ) -> Result<(Vec<OlapTask>, usize)> {
        let statuses = opts.effective_statuses();
        let state = self.state.read().map_err(poison_err)?;
        let mut matching: Vec<&OlapTask> = state
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.inserted_at >= opts.created_after)
            .filter(|t| statuses.contains(&t.readable_status))
            .filter(|t| opts.workflow_ids.is_empty() || opts.workflow_ids.contains(&t.workflow_id))
            .filter(|t| opts.worker_id.is_none() || t.latest_worker_id == opts.worker_id)
            .filter(|t| {
                opts.finished_before.is_none_or(|before| {
                    state.finished_at.get(&t.id).is_some_and(|at| *at <= before)
                })
            })
            .filter(|t| {
                opts.additional_metadata
                    .iter()
                    .all(|(k, v)| t.additional_metadata.get(k) == Some(v))
            })
            .collect();
        matching.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .cloned()
            .collect();
        drop(state);
        Ok((page, total))
    }

    async fn list_task_events(
        &self,
        tenant_id: TenantId,
        task_id: TaskId,
        task_inserted_at: DateTime<Utc>,
    ) -> Result<Vec<TaskEvent>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut events: Vec<TaskEvent> = state
            .events
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.task_id == task_id
                    && e.task_inserted_at == task_inserted_at
            })
            .cloned()
            .collect();
        drop(state);
        events.sort_by_key(|e| (e.event_timestamp, e.retry_count, e.readable_status.rank()));
        Ok(events)
    }

    async fn read_task_run_metrics(
        &self,
        tenant_id: TenantId,
        created_after: DateTime<Utc>,
        workflow_ids: &[WorkflowId],
    ) -> Result<Vec<TaskRunMetric>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut counts: HashMap<ReadableStatus, u64> = HashMap::new();
        for task in state.tasks.values().filter(|t| {
            t.tenant_id == tenant_id
                && t.inserted_at >= created_after
                && (workflow_ids.is_empty() || workflow_ids.contains(&t.workflow_id))
        }) {
            *counts.entry(task.readable_status).or_default() += 1;
        }
        drop(state);
        Ok(ReadableStatus::ALL
            .into_iter()
            .map(|status| TaskRunMetric {
                status,
                count: counts.get(&status).copied().unwrap_or(0),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use kiln_core::{StepId, WorkerId};
    use serde_json::json;

    use super::*;
    use crate::olap::OlapEventType;
    use crate::task::{Dag, InitialState, TaskState};

    fn task(tenant_id: TenantId, id: TaskId, inserted_at: DateTime<Utc>) -> Task {
        Task {
            id,
            inserted_at,
            tenant_id,
            external_id: ExternalId::generate(),
            queue: "q".into(),
            step_id: StepId::generate(),
            step_readable_id: "s".into(),
            workflow_id: WorkflowId::generate(),
            display_name: "w".into(),
            dag_id: None,
            dag_inserted_at: None,
            input: json!({}),
            additional_metadata: BTreeMap::new(),
            retry_count: 0,
            internal_retry_count: 0,
            retries: 0,
            state: TaskState::Queued,
            initial_state: InitialState::Queued,
            initial_state_reason: None,
            desired_worker_id: None,
            worker_id: None,
            concurrency_keys: Vec::new(),
            concurrency_strategy_ids: Vec::new(),
            schedule_timeout_secs: 300,
            step_timeout_secs: 60,
            schedule_timeout_at: None,
            timeout_at: None,
            parent_task_id: None,
            child_index: None,
            child_key: None,
        }
    }

    fn event(t: &Task, retry_count: i32, event_type: OlapEventType) -> TaskEvent {
        TaskEvent::new(t.tenant_id, t.id, t.inserted_at, retry_count, event_type, t.inserted_at)
    }

    async fn setup() -> (InMemoryOlapRepository, TenantId, DateTime<Utc>) {
        let repo = InMemoryOlapRepository::with_config(&FlowConfig {
            reconcile_partitions: 1,
            ..FlowConfig::default()
        });
        let now = Utc::now();
        repo.update_table_partitions(now).await.unwrap();
        (repo, TenantId::generate(), now)
    }

    #[tokio::test]
    async fn rows_require_a_partition() {
        let repo = InMemoryOlapRepository::default();
        let tenant = TenantId::generate();
        let err = repo
            .create_tasks(tenant, &[task(tenant, 1, Utc::now())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PartitionMissing { .. }));
    }

    #[tokio::test]
    async fn status_advances_monotonically() {
        let (repo, tenant, now) = setup().await;
        let t = task(tenant, 1, now);
        repo.create_tasks(tenant, std::slice::from_ref(&t)).await.unwrap();

        repo.insert_task_events(tenant, &[event(&t, 0, OlapEventType::Started)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();

        // A late QUEUED for the same attempt must not regress RUNNING.
        repo.insert_task_events(tenant, &[event(&t, 0, OlapEventType::Queued)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();
        let read = repo.read_task_run(tenant, t.external_id).await.unwrap().unwrap();
        assert_eq!(read.readable_status, ReadableStatus::Running);

        // A newer attempt still has to outrank the recorded status.
        repo.insert_task_events(tenant, &[event(&t, 1, OlapEventType::Queued)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();
        let read = repo.read_task_run(tenant, t.external_id).await.unwrap().unwrap();
        assert_eq!(read.latest_retry_count, 0);
        assert_eq!(read.readable_status, ReadableStatus::Running);

        repo.insert_task_events(tenant, &[event(&t, 1, OlapEventType::Finished)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();
        let read = repo.read_task_run(tenant, t.external_id).await.unwrap().unwrap();
        assert_eq!(read.latest_retry_count, 1);
        assert_eq!(read.readable_status, ReadableStatus::Completed);
    }

    #[tokio::test]
    async fn events_for_unknown_tasks_are_requeued_with_backoff() {
        let (repo, tenant, now) = setup().await;
        let t = task(tenant, 5, now);
        repo.insert_task_events(tenant, &[event(&t, 0, OlapEventType::Finished)])
            .await
            .unwrap();

        assert_eq!(repo.update_task_statuses(tenant, 0, 100, now).await.unwrap(), 1);
        let (after, retries) = repo.pending_event_schedule(5).unwrap().unwrap();
        assert_eq!(retries, 1);
        assert_eq!(after, now + Duration::seconds(2));

        // Not due yet.
        assert_eq!(repo.update_task_statuses(tenant, 0, 100, now).await.unwrap(), 0);

        repo.create_tasks(tenant, std::slice::from_ref(&t)).await.unwrap();
        let later = now + Duration::seconds(3);
        assert_eq!(repo.update_task_statuses(tenant, 0, 100, later).await.unwrap(), 1);
        assert_eq!(repo.pending_event_count().unwrap(), 0);
        let read = repo.read_task_run(tenant, t.external_id).await.unwrap().unwrap();
        assert_eq!(read.readable_status, ReadableStatus::Completed);
    }

    #[tokio::test]
    async fn batch_limit_bounds_each_fold() {
        let (repo, tenant, now) = setup().await;
        let tasks: Vec<_> = (1..=3).map(|id| task(tenant, id, now)).collect();
        repo.create_tasks(tenant, &tasks).await.unwrap();
        let events: Vec<_> = tasks.iter().map(|t| event(t, 0, OlapEventType::Started)).collect();
        repo.insert_task_events(tenant, &events).await.unwrap();

        assert_eq!(repo.update_task_statuses(tenant, 0, 2, now).await.unwrap(), 2);
        assert_eq!(repo.update_task_statuses(tenant, 0, 2, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dag_status_is_folded_from_tasks() {
        let (repo, tenant, now) = setup().await;
        let dag = DagWithData {
            dag: Dag {
                id: 1,
                inserted_at: now,
                tenant_id: tenant,
                external_id: DagExternalId::generate(),
                workflow_id: WorkflowId::generate(),
                display_name: "dag".into(),
            },
            input: json!({}),
            additional_metadata: BTreeMap::new(),
            total_tasks: 2,
        };
        repo.create_dags(tenant, std::slice::from_ref(&dag)).await.unwrap();
        let mut first = task(tenant, 1, now);
        first.dag_id = Some(1);
        first.dag_inserted_at = Some(now);
        repo.create_tasks(tenant, std::slice::from_ref(&first)).await.unwrap();

        repo.insert_task_events(tenant, &[event(&first, 0, OlapEventType::Finished)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();
        assert_eq!(repo.update_dag_statuses(tenant, 0, 100, now).await.unwrap(), 1);
        let read = repo.read_dag(tenant, dag.dag.external_id).await.unwrap().unwrap();
        assert_eq!(read.readable_status, ReadableStatus::Running);

        let mut second = task(tenant, 2, now);
        second.dag_id = Some(1);
        repo.create_tasks(tenant, std::slice::from_ref(&second)).await.unwrap();
        repo.insert_task_events(tenant, &[event(&second, 0, OlapEventType::Failed)])
            .await
            .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();
        repo.update_dag_statuses(tenant, 0, 100, now).await.unwrap();
        let read = repo.read_dag(tenant, dag.dag.external_id).await.unwrap().unwrap();
        assert_eq!(read.readable_status, ReadableStatus::Failed);
    }

    #[tokio::test]
    async fn retention_drops_old_partitions_and_rows() {
        let repo = InMemoryOlapRepository::default();
        let tenant = TenantId::generate();
        let old = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        repo.update_table_partitions(old).await.unwrap();
        let t = task(tenant, 1, old);
        repo.create_tasks(tenant, std::slice::from_ref(&t)).await.unwrap();

        let now = old + Duration::days(10);
        let maintenance = repo.update_table_partitions(now).await.unwrap();
        assert!(maintenance.dropped.contains(&"v2_tasks_olap_20250101".to_string()));
        assert!(maintenance.created.contains(&"v2_runs_olap_20250112".to_string()));

        for table in OlapTable::ALL {
            let partitions = repo.list_partitions(table).await.unwrap();
            assert!(partitions.contains(&now.date_naive()));
            assert!(partitions.iter().all(|d| *d >= now.date_naive() - Duration::days(7)));
        }
        assert!(repo.read_task_run(tenant, t.external_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let (repo, tenant, now) = setup().await;
        let worker = WorkerId::generate();
        let mut tasks: Vec<_> = (1..=4).map(|id| task(tenant, id, now)).collect();
        tasks[0].additional_metadata.insert("env".into(), "prod".into());
        repo.create_tasks(tenant, &tasks).await.unwrap();

        let mut started = event(&tasks[1], 0, OlapEventType::Started);
        started.worker_id = Some(worker);
        repo.insert_task_events(
            tenant,
            &[started, event(&tasks[2], 0, OlapEventType::Finished)],
        )
        .await
        .unwrap();
        repo.update_task_statuses(tenant, 0, 100, now).await.unwrap();

        let mut opts = ListTaskRunOpts::since(now - Duration::hours(1));
        opts.limit = 2;
        let (page, total) = repo.list_tasks(tenant, &opts).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(page.iter().map(|t| t.id).collect::<Vec<_>>(), vec![4, 3]);

        let mut by_worker = ListTaskRunOpts::since(now - Duration::hours(1));
        by_worker.worker_id = Some(worker);
        assert_eq!(repo.list_tasks(tenant, &by_worker).await.unwrap().1, 1);

        let mut finished = ListTaskRunOpts::since(now - Duration::hours(1));
        finished.finished_before = Some(now + Duration::minutes(1));
        let (rows, _) = repo.list_tasks(tenant, &finished).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 3);

        let mut by_meta = ListTaskRunOpts::since(now - Duration::hours(1));
        by_meta.additional_metadata.insert("env".into(), "prod".into());
        assert_eq!(repo.list_tasks(tenant, &by_meta).await.unwrap().1, 1);

        let metrics = repo
            .read_task_run_metrics(tenant, now - Duration::hours(1), &[])
            .await
            .unwrap();
        let queued = metrics.iter().find(|m| m.status == ReadableStatus::Queued).unwrap();
        assert_eq!(queued.count, 2);
    }
}
