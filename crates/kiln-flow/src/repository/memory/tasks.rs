//! Task lifecycle mutations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln_core::{TenantId, WorkerId};

use super::{InMemoryRepository, poison_err};
use crate::error::Result;
use crate::repository::{
    CompleteTaskOpts, FailTaskOpts, FailTasksResult, TaskMeta, TaskRepository, TaskToReassign,
    TimedOutTask, TimeoutKind,
};
use crate::task::{ReleasedTask, RetriedTask, Task, TaskId, TaskIdRetryCount, TaskState};

/// Whether a failed attempt gets another try.
fn should_retry(task: &Task, is_app_error: bool, internal_retries: i32) -> bool {
    if is_app_error {
        task.retry_count < task.retries
    } else {
        task.internal_retry_count < internal_retries
    }
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn complete_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[CompleteTaskOpts],
    ) -> Result<Vec<ReleasedTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut released = Vec::new();
        for opt in tasks {
            let Some(task) = state.tenant_task_mut(tenant_id, opt.task.id) else {
                continue;
            };
            if !task.accepts(opt.task) {
                continue;
            }
            task.state = TaskState::Completed;
            task.timeout_at = None;
            let snapshot = task.clone();
            let strategies = state.release(snapshot.id);
            released.push(ReleasedTask::from_task(&snapshot, strategies));
        }
        drop(state);
        Ok(released)
    }

    async fn fail_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[FailTaskOpts],
    ) -> Result<FailTasksResult> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(poison_err)?;
        let mut result = FailTasksResult::default();
        for opt in tasks {
            let Some(task) = state.tenant_task_mut(tenant_id, opt.task.id) else {
                continue;
            };
            if !task.accepts(opt.task) {
                continue;
            }

            if should_retry(task, opt.is_app_error, self.internal_retries) {
                let failed_worker = task.worker_id.take();
                task.retry_count += 1;
                if !opt.is_app_error {
                    task.internal_retry_count += 1;
                }
                task.state = TaskState::Queued;
                task.timeout_at = None;
                task.schedule_timeout_at = Some(now + task.schedule_timeout());
                let id = task.id;
                let retry_count = task.retry_count;
                let queue = task.queue.clone();

                let strategies = state.release(id);
                state.enqueue(id);
                result.retried.push(RetriedTask {
                    id,
                    retry_count,
                    failed_attempt: opt.task,
                    queue,
                    is_app_error: opt.is_app_error,
                    worker_id: failed_worker,
                    concurrency_strategy_ids: strategies,
                });
            } else {
                task.state = TaskState::Failed;
                task.timeout_at = None;
                let snapshot = task.clone();
                let strategies = state.release(snapshot.id);
                result
                    .released
                    .push(ReleasedTask::from_task(&snapshot, strategies));
            }
        }
        drop(state);
        Ok(result)
    }

    async fn cancel_tasks(
        &self,
        tenant_id: TenantId,
        tasks: &[TaskIdRetryCount],
    ) -> Result<Vec<ReleasedTask>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut released = Vec::new();
        for attempt in tasks {
            let Some(task) = state.tenant_task_mut(tenant_id, attempt.id) else {
                continue;
            };
            if !task.accepts(*attempt) {
                continue;
            }
            task.state = TaskState::Cancelled;
            task.timeout_at = None;
            task.schedule_timeout_at = None;
            let snapshot = task.clone();
            let strategies = state.release(snapshot.id);
            released.push(ReleasedTask::from_task(&snapshot, strategies));
        }
        drop(state);
        Ok(released)
    }

    async fn assign_tasks(
        &self,
        tenant_id: TenantId,
        assignments: &[(TaskIdRetryCount, WorkerId)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskIdRetryCount>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut assigned = Vec::new();
        for (attempt, worker_id) in assignments {
            let admitted = state
                .queue_items
                .get(&attempt.id)
                .is_some_and(|item| item.task == *attempt && item.tenant_id == tenant_id);
            if !admitted {
                continue;
            }
            let Some(task) = state.tenant_task_mut(tenant_id, attempt.id) else {
                continue;
            };
            if !task.accepts(*attempt) || task.state != TaskState::Queued {
                continue;
            }
            task.state = TaskState::Running;
            task.worker_id = Some(*worker_id);
            task.schedule_timeout_at = None;
            task.timeout_at = Some(now + task.step_timeout());
            state.queue_items.remove(&attempt.id);
            assigned.push(*attempt);
        }
        drop(state);
        Ok(assigned)
    }

    async fn list_tasks_to_timeout(
        &self,
        tenant_id: TenantId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedOutTask>> {
        let timed_out = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| t.tenant_id == tenant_id)
                .filter_map(|t| {
                    let kind = match t.state {
                        TaskState::Queued if t.schedule_timeout_at.is_some_and(|at| at <= now) => {
                            TimeoutKind::Schedule
                        }
                        TaskState::Running if t.timeout_at.is_some_and(|at| at <= now) => {
                            TimeoutKind::Step
                        }
                        _ => return None,
                    };
                    Some(TimedOutTask {
                        task: t.clone(),
                        kind,
                    })
                })
                .take(limit)
                .collect()
        };
        Ok(timed_out)
    }

    async fn list_tasks_to_reassign(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> Result<Vec<TaskToReassign>> {
        let stranded = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| t.tenant_id == tenant_id && t.state == TaskState::Running)
                .filter_map(|t| {
                    let worker_id = t.worker_id?;
                    let alive = state.workers.get(&worker_id).is_some_and(|w| w.is_active);
                    (!alive).then(|| TaskToReassign {
                        task: t.attempt(),
                        worker_id,
                    })
                })
                .take(limit)
                .collect()
        };
        Ok(stranded)
    }

    async fn list_task_metas(&self, tenant_id: TenantId, ids: &[TaskId]) -> Result<Vec<TaskMeta>> {
        let metas = {
            let state = self.state.read().map_err(poison_err)?;
            ids.iter()
                .filter_map(|id| state.tenant_task(tenant_id, *id))
                .map(|t| TaskMeta {
                    id: t.id,
                    inserted_at: t.inserted_at,
                    external_id: t.external_id,
                    retry_count: t.retry_count,
                    workflow_id: t.workflow_id,
                    dag_id: t.dag_id,
                    dag_inserted_at: t.dag_inserted_at,
                })
                .collect()
        };
        Ok(metas)
    }

    async fn read_task(&self, tenant_id: TenantId, id: TaskId) -> Result<Option<Task>> {
        let task = {
            let state = self.state.read().map_err(poison_err)?;
            state.tenant_task(tenant_id, id).cloned()
        };
        Ok(task)
    }

    async fn update_table_partitions(&self, now: DateTime<Utc>) -> Result<()> {
        self.create_partitions(now)
    }
}
