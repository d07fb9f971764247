//! Follow-on messages emitted after task mutations.
//!
//! Every helper here is a pure fan-out: the database mutation already
//! committed, so a redelivered batch would find nothing left to do. Send
//! failures are therefore logged and counted by
//! [`TasksController::report_send_failures`] instead of failing the batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use kiln_core::{ExternalId, TenantId, WorkerId};

use super::TasksController;
use crate::error::{Error, MultiError, Result};
use crate::events::{
    CompletedData, FailedData, TASK_CANCELLED_ERROR, task_cancelled_event_key,
    task_completed_event_key, task_failed_event_key,
};
use crate::msgqueue::QueueType;
use crate::olap::OlapEventType;
use crate::task::{DagWithData, InitialState, Task, TaskIdRetryCount};
use crate::tasktypes::{
    CreateMonitoringEventPayload, InternalEventTaskPayload, NotifyQueuePayload,
    SignalTaskCancelledPayload, created_dag_message, created_task_message, internal_event_message,
    monitoring_event_message, notify_payloads, notify_task_created_message,
    notify_task_released_message, signal_task_cancelled_message,
};

/// Which scheduler notification to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerNotice {
    /// New work entered a queue.
    Created,
    /// Capacity was freed in a queue.
    Released,
}

pub(crate) fn completed_event(
    external_id: &ExternalId,
    data: &CompletedData,
    ts: DateTime<Utc>,
) -> Result<InternalEventTaskPayload> {
    Ok(InternalEventTaskPayload {
        event_timestamp: ts,
        event_key: task_completed_event_key(external_id),
        event_data: serde_json::to_value(data)?,
    })
}

pub(crate) fn failed_event(
    external_id: &ExternalId,
    step_readable_id: &str,
    error: &str,
    ts: DateTime<Utc>,
) -> Result<InternalEventTaskPayload> {
    Ok(InternalEventTaskPayload {
        event_timestamp: ts,
        event_key: task_failed_event_key(external_id),
        event_data: serde_json::to_value(FailedData {
            step_readable_id: step_readable_id.to_string(),
            error: error.to_string(),
        })?,
    })
}

pub(crate) fn cancelled_event(
    external_id: &ExternalId,
    step_readable_id: &str,
    ts: DateTime<Utc>,
) -> Result<InternalEventTaskPayload> {
    Ok(InternalEventTaskPayload {
        event_timestamp: ts,
        event_key: task_cancelled_event_key(external_id),
        event_data: serde_json::to_value(FailedData {
            step_readable_id: step_readable_id.to_string(),
            error: TASK_CANCELLED_ERROR.to_string(),
        })?,
    })
}

impl TasksController {
    /// Logs and counts the send failures collected while handling `kind`.
    pub(crate) fn report_send_failures(&self, tenant_id: TenantId, kind: &str, errors: MultiError) {
        let failures: Vec<Error> = errors
            .into_errors()
            .into_iter()
            .flat_map(|err| match err {
                Error::Multiple(nested) => nested.into_errors(),
                other => vec![other],
            })
            .collect();
        if failures.is_empty() {
            return;
        }
        self.metrics.record_send_failures(kind, failures.len());
        for err in &failures {
            tracing::error!(
                tenant_id = %tenant_id,
                kind,
                error = %err,
                "could not publish follow-up message"
            );
        }
    }

    /// Announces freshly created tasks and DAGs.
    ///
    /// Every task and DAG is sent to the read model. Queued tasks wake the
    /// tenant's scheduler partition; tasks created in a terminal state emit
    /// the matching internal event and monitoring event instead.
    ///
    /// # Errors
    ///
    /// Returns the accumulated send failures; every group is attempted.
    pub async fn signal_created(
        &self,
        tenant_id: TenantId,
        tasks: &[Task],
        dags: &[DagWithData],
    ) -> Result<()> {
        let mut errors = MultiError::new();

        if !tasks.is_empty() {
            match created_task_message(tenant_id, tasks) {
                Ok(msg) => {
                    errors.absorb(self.mq.send_message(&QueueType::Olap, msg).await);
                }
                Err(err) => errors.push(err),
            }
        }
        if !dags.is_empty() {
            match created_dag_message(tenant_id, dags) {
                Ok(msg) => {
                    errors.absorb(self.mq.send_message(&QueueType::Olap, msg).await);
                }
                Err(err) => errors.push(err),
            }
        }

        let now = Utc::now();
        let mut queued = Vec::new();
        let mut internal = Vec::new();
        let mut monitoring = Vec::new();
        for task in tasks {
            let reason = task.initial_state_reason.clone().unwrap_or_default();
            let event = match task.initial_state {
                InitialState::Queued => {
                    queued.push(task);
                    continue;
                }
                InitialState::Failed => {
                    monitoring.push(
                        CreateMonitoringEventPayload::new(
                            task.id,
                            task.retry_count,
                            OlapEventType::Failed,
                            now,
                        )
                        .with_payload(reason.clone())
                        .with_message(reason.clone()),
                    );
                    failed_event(&task.external_id, &task.step_readable_id, &reason, now)
                }
                InitialState::Cancelled => {
                    monitoring.push(
                        CreateMonitoringEventPayload::new(
                            task.id,
                            task.retry_count,
                            OlapEventType::Cancelled,
                            now,
                        )
                        .with_message(reason.clone()),
                    );
                    cancelled_event(&task.external_id, &task.step_readable_id, now)
                }
                InitialState::Skipped => {
                    monitoring.push(
                        CreateMonitoringEventPayload::new(
                            task.id,
                            task.retry_count,
                            OlapEventType::Skipped,
                            now,
                        )
                        .with_message(reason.clone()),
                    );
                    completed_event(
                        &task.external_id,
                        &CompletedData::skipped(&task.step_readable_id),
                        now,
                    )
                }
            };
            if let Some(event) = errors.absorb(event) {
                internal.push(event);
            }
        }

        if !queued.is_empty() {
            let payloads = notify_payloads(
                queued
                    .iter()
                    .map(|t| (t.queue.as_str(), t.concurrency_strategy_ids.as_slice())),
            );
            errors.absorb(
                self.notify_scheduler(tenant_id, SchedulerNotice::Created, &payloads)
                    .await,
            );
        }
        errors.absorb(self.send_internal_events(tenant_id, &internal).await);
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);

        tracing::debug!(
            tenant_id = %tenant_id,
            tasks = tasks.len(),
            dags = dags.len(),
            queued = queued.len(),
            terminal = internal.len(),
            "signalled created tasks"
        );
        errors.into_result()
    }

    /// Sends internal events back to the task processing queue.
    ///
    /// # Errors
    ///
    /// Returns the serialization or transport error.
    pub(crate) async fn send_internal_events(
        &self,
        tenant_id: TenantId,
        events: &[InternalEventTaskPayload],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let msg = internal_event_message(tenant_id, events)?;
        self.mq.send_message(&QueueType::TaskProcessing, msg).await
    }

    /// Sends monitoring events to the read model.
    ///
    /// # Errors
    ///
    /// Returns the serialization or transport error.
    pub(crate) async fn send_monitoring_events(
        &self,
        tenant_id: TenantId,
        events: &[CreateMonitoringEventPayload],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let msg = monitoring_event_message(tenant_id, events)?;
        self.mq.send_message(&QueueType::Olap, msg).await
    }

    /// Notifies the tenant's scheduler partition. Tenants without a
    /// partition are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] for an unknown tenant, or the
    /// serialization or transport error.
    pub(crate) async fn notify_scheduler(
        &self,
        tenant_id: TenantId,
        notice: SchedulerNotice,
        payloads: &[NotifyQueuePayload],
    ) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let Some(tenant) = self.repos.tenants.get_tenant(tenant_id).await? else {
            return Err(Error::resource_not_found("tenant", tenant_id));
        };
        let Some(partition) = tenant.scheduler_partition_id else {
            tracing::debug!(tenant_id = %tenant_id, "tenant has no scheduler partition");
            return Ok(());
        };
        let msg = match notice {
            SchedulerNotice::Created => notify_task_created_message(tenant_id, payloads)?,
            SchedulerNotice::Released => notify_task_released_message(tenant_id, payloads)?,
        };
        self.mq
            .send_message(&QueueType::SchedulerPartition(partition), msg)
            .await
    }

    /// Tells the dispatchers owning `attempts`' workers to stop them.
    ///
    /// Workers without a known dispatcher are logged and skipped; one
    /// message is sent per dispatcher.
    ///
    /// # Errors
    ///
    /// Returns the lookup error, or the accumulated send failures.
    pub(crate) async fn signal_workers_cancelled(
        &self,
        tenant_id: TenantId,
        attempts: &[(TaskIdRetryCount, WorkerId)],
    ) -> Result<()> {
        if attempts.is_empty() {
            return Ok(());
        }
        let mut worker_ids: Vec<WorkerId> = attempts.iter().map(|(_, w)| *w).collect();
        worker_ids.sort_unstable();
        worker_ids.dedup();
        let dispatchers = self
            .repos
            .workers
            .get_dispatcher_ids_for_workers(tenant_id, &worker_ids)
            .await?;

        let mut by_dispatcher: HashMap<_, Vec<SignalTaskCancelledPayload>> = HashMap::new();
        for (attempt, worker_id) in attempts {
            let Some(dispatcher_id) = dispatchers.get(worker_id) else {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    task_id = attempt.id,
                    worker_id = %worker_id,
                    "no dispatcher for worker, skipping cancellation signal"
                );
                continue;
            };
            by_dispatcher
                .entry(*dispatcher_id)
                .or_default()
                .push(SignalTaskCancelledPayload {
                    task_id: attempt.id,
                    worker_id: *worker_id,
                    retry_count: attempt.retry_count,
                });
        }

        let mut errors = MultiError::new();
        for (dispatcher_id, payloads) in by_dispatcher {
            match signal_task_cancelled_message(tenant_id, &payloads) {
                Ok(msg) => {
                    errors.absorb(
                        self.mq
                            .send_message(&QueueType::Dispatcher(dispatcher_id), msg)
                            .await,
                    );
                }
                Err(err) => errors.push(err),
            }
        }
        errors.into_result()
    }
}
