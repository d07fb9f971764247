//! The task lifecycle controller.
//!
//! [`TasksController`] consumes the task processing queue. Each batch holds
//! payloads of one kind for one tenant:
//!
//! - `task-completed`, `task-failed` and `task-cancelled` mutate attempts
//!   through the [`TaskRepository`](crate::repository::TaskRepository) and
//!   announce the outcome
//! - `user-event` and `task-trigger` create tasks and DAGs
//! - `internal-event` offers task outcomes to registered match conditions
//!
//! Besides the consumer, the controller runs the per-tenant timeout and
//! reassignment sweeps and keeps the task table partitions current.

mod maintenance;
mod operation_pool;
mod signal;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use kiln_core::observability::controller_span;
use kiln_core::TenantId;

use crate::config::FlowConfig;
use crate::error::{Error, MultiError, Result};
use crate::events::CompletedData;
use crate::metrics::FlowMetrics;
use crate::msgqueue::buffer::{BufferOptions, MessageHandler, SubBuffer};
use crate::msgqueue::{MessageKind, MessageQueue, QueueType, decode_payloads};
use crate::olap::OlapEventType;
use crate::recovery::{Alerter, TracingAlerter, recover_with_alert};
use crate::repository::{
    CandidateEventMatch, CompleteTaskOpts, EventTriggerOpts, FailTaskOpts, FailTasksResult,
    Repositories, WorkflowNameTriggerOpts,
};
use crate::service::ServiceHandle;
use crate::task::{DagWithData, ReleasedTask, Task, TaskIdRetryCount, TaskState};
use crate::tasktypes::{
    CancelledTaskPayload, CompletedTaskPayload, CreateMonitoringEventPayload, FailedTaskPayload,
    InternalEventTaskPayload, TriggerTaskPayload, UserEventTaskPayload, notify_payloads,
};

pub use operation_pool::{Operation, OperationPool};
use signal::{SchedulerNotice, cancelled_event, completed_event, failed_event};

/// Drives task attempts through their lifecycle.
pub struct TasksController {
    mq: Arc<dyn MessageQueue>,
    repos: Repositories,
    alerter: Arc<dyn Alerter>,
    config: FlowConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for TasksController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TasksController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TasksController {
    /// Creates a controller publishing to `mq`.
    #[must_use]
    pub fn new(mq: Arc<dyn MessageQueue>, repos: Repositories, config: FlowConfig) -> Self {
        Self {
            mq,
            repos,
            alerter: Arc::new(TracingAlerter),
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Replaces the alerter notified about recovered panics.
    #[must_use]
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Completes attempts and announces the released ones.
    ///
    /// Stale attempts are ignored by the repository and produce no events.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the completion. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_task_completed(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let payloads: Vec<CompletedTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let opts: Vec<CompleteTaskOpts> = payloads
            .into_iter()
            .map(|p| CompleteTaskOpts {
                task: p.attempt(),
                output: p.output,
            })
            .collect();

        let released = self.repos.tasks.complete_tasks(tenant_id, &opts).await?;
        self.metrics
            .record_task_transitions(TaskState::Completed.as_str(), released.len());

        let outputs: HashMap<TaskIdRetryCount, &serde_json::Value> =
            opts.iter().map(|o| (o.task, &o.output)).collect();
        let now = Utc::now();
        let mut errors = MultiError::new();
        let mut internal = Vec::with_capacity(released.len());
        let mut monitoring = Vec::with_capacity(released.len());
        for task in &released {
            let output = outputs
                .get(&TaskIdRetryCount::new(task.id, task.retry_count))
                .map_or(serde_json::Value::Null, |v| (*v).clone());
            monitoring.push(
                CreateMonitoringEventPayload::new(
                    task.id,
                    task.retry_count,
                    OlapEventType::Finished,
                    now,
                )
                .with_worker(task.worker_id)
                .with_payload(output.to_string()),
            );
            let data = CompletedData {
                step_readable_id: task.step_readable_id.clone(),
                output,
            };
            if let Some(event) = errors.absorb(completed_event(&task.external_id, &data, now)) {
                internal.push(event);
            }
        }

        errors.absorb(self.send_internal_events(tenant_id, &internal).await);
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);
        errors.absorb(self.notify_released(tenant_id, &released).await);
        self.report_send_failures(tenant_id, MessageKind::TaskCompleted.as_str(), errors);
        Ok(())
    }

    /// Fails attempts, re-queueing those with retry budget left.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the failure. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_task_failed(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let payloads: Vec<FailedTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let opts: Vec<FailTaskOpts> = payloads
            .into_iter()
            .map(|p| FailTaskOpts {
                task: p.attempt(),
                is_app_error: p.is_app_error,
                error_msg: p.error_msg,
            })
            .collect();

        let mut errors = MultiError::new();
        self.fail_and_signal(tenant_id, &opts, &mut errors).await?;
        self.report_send_failures(tenant_id, MessageKind::TaskFailed.as_str(), errors);
        Ok(())
    }

    /// Cancels attempts, telling the dispatchers of assigned attempts to stop
    /// them when the payload asks for it.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the cancellation. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_task_cancelled(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let payloads: Vec<CancelledTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let attempts: Vec<TaskIdRetryCount> =
            payloads.iter().map(CancelledTaskPayload::attempt).collect();
        let by_attempt: HashMap<TaskIdRetryCount, &CancelledTaskPayload> =
            payloads.iter().map(|p| (p.attempt(), p)).collect();

        let released = self.repos.tasks.cancel_tasks(tenant_id, &attempts).await?;
        self.metrics
            .record_task_transitions(TaskState::Cancelled.as_str(), released.len());

        let now = Utc::now();
        let mut errors = MultiError::new();
        let mut to_signal = Vec::new();
        let mut internal = Vec::with_capacity(released.len());
        let mut monitoring = Vec::with_capacity(released.len());
        for task in &released {
            let attempt = TaskIdRetryCount::new(task.id, task.retry_count);
            let request = by_attempt.get(&attempt);
            if let (Some(worker_id), Some(true)) =
                (task.worker_id, request.map(|r| r.should_notify))
            {
                to_signal.push((attempt, worker_id));
            }

            let mut event = CreateMonitoringEventPayload::new(
                task.id,
                task.retry_count,
                request.map_or(OlapEventType::Cancelled, |r| r.event_type),
                now,
            )
            .with_worker(task.worker_id);
            if let Some(message) = request.and_then(|r| r.event_message.as_deref()) {
                event = event.with_message(message);
            }
            monitoring.push(event);

            if let Some(event) =
                errors.absorb(cancelled_event(&task.external_id, &task.step_readable_id, now))
            {
                internal.push(event);
            }
        }

        errors.absorb(self.signal_workers_cancelled(tenant_id, &to_signal).await);
        errors.absorb(self.send_internal_events(tenant_id, &internal).await);
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);
        errors.absorb(self.notify_released(tenant_id, &released).await);
        self.report_send_failures(tenant_id, MessageKind::TaskCancelled.as_str(), errors);
        Ok(())
    }

    /// Triggers workflows from user events.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the trigger. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_user_events(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let payloads: Vec<UserEventTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let opts: Vec<EventTriggerOpts> = payloads
            .into_iter()
            .map(|p| EventTriggerOpts {
                event_id: p.event_id,
                key: p.event_key,
                data: p.event_data,
                additional_metadata: p.event_additional_metadata,
            })
            .collect();

        let result = self.repos.triggers.trigger_from_events(tenant_id, &opts).await?;
        self.announce_created(tenant_id, MessageKind::UserEvent, &result.tasks, &result.dags)
            .await;
        Ok(())
    }

    /// Triggers workflows by name, including child spawns.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the trigger. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_trigger(&self, tenant_id: TenantId, payloads: &[Vec<u8>]) -> Result<()> {
        let payloads: Vec<TriggerTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let opts: Vec<WorkflowNameTriggerOpts> = payloads
            .into_iter()
            .map(|p| WorkflowNameTriggerOpts {
                external_id: p.task_external_id,
                workflow_name: p.workflow_name,
                data: p.data,
                additional_metadata: p.additional_metadata,
                parent_task_id: p.parent_task_id,
                child_index: p.child_index,
                child_key: p.child_key,
            })
            .collect();

        let result = self
            .repos
            .triggers
            .trigger_from_workflow_names(tenant_id, &opts)
            .await?;
        self.announce_created(tenant_id, MessageKind::TaskTrigger, &result.tasks, &result.dags)
            .await;
        Ok(())
    }

    /// Offers internal events to match conditions and announces the tasks
    /// they create.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the match. Send failures are logged
    /// and counted, not returned.
    pub async fn handle_internal_events(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let payloads: Vec<InternalEventTaskPayload> = decode_payloads(payloads);
        if payloads.is_empty() {
            return Ok(());
        }
        let candidates: Vec<CandidateEventMatch> = payloads
            .into_iter()
            .map(|p| CandidateEventMatch {
                id: Uuid::new_v4(),
                event_timestamp: p.event_timestamp,
                key: p.event_key,
                data: p.event_data,
            })
            .collect();

        let result = self
            .repos
            .matches
            .process_internal_event_matches(tenant_id, &candidates)
            .await?;
        self.announce_created(tenant_id, MessageKind::InternalEvent, &result.created_tasks, &[])
            .await;
        Ok(())
    }

    async fn announce_created(
        &self,
        tenant_id: TenantId,
        kind: MessageKind,
        tasks: &[Task],
        dags: &[DagWithData],
    ) {
        let mut errors = MultiError::new();
        errors.absorb(self.signal_created(tenant_id, tasks, dags).await);
        self.report_send_failures(tenant_id, kind.as_str(), errors);
    }

    /// Fails attempts and announces the outcome. Send failures are pushed
    /// into `errors`; only the repository error is returned.
    ///
    /// Terminal failures emit a failure event and a `FAILED` monitoring
    /// event. Retried attempts emit a `QUEUED` monitoring event for the new
    /// retry count and wake the scheduler.
    async fn fail_and_signal(
        &self,
        tenant_id: TenantId,
        opts: &[FailTaskOpts],
        errors: &mut MultiError,
    ) -> Result<FailTasksResult> {
        let result = self.repos.tasks.fail_tasks(tenant_id, opts).await?;
        self.metrics
            .record_task_transitions(TaskState::Failed.as_str(), result.released.len());
        self.metrics
            .record_task_transitions(TaskState::Queued.as_str(), result.retried.len());

        let messages: HashMap<TaskIdRetryCount, &str> =
            opts.iter().map(|o| (o.task, o.error_msg.as_str())).collect();
        let now = Utc::now();
        let mut internal = Vec::with_capacity(result.released.len());
        let mut monitoring = Vec::with_capacity(result.released.len() + result.retried.len());

        for task in &result.released {
            let error = messages
                .get(&TaskIdRetryCount::new(task.id, task.retry_count))
                .copied()
                .unwrap_or_default();
            monitoring.push(
                CreateMonitoringEventPayload::new(
                    task.id,
                    task.retry_count,
                    OlapEventType::Failed,
                    now,
                )
                .with_worker(task.worker_id)
                .with_payload(error)
                .with_message(error),
            );
            if let Some(event) =
                errors.absorb(failed_event(&task.external_id, &task.step_readable_id, error, now))
            {
                internal.push(event);
            }
        }
        for task in &result.retried {
            let error = messages
                .get(&task.failed_attempt)
                .copied()
                .unwrap_or_default();
            monitoring.push(
                CreateMonitoringEventPayload::new(
                    task.id,
                    task.retry_count,
                    OlapEventType::Queued,
                    now,
                )
                .with_message(format!("retrying after failure: {error}")),
            );
        }

        errors.absorb(self.send_internal_events(tenant_id, &internal).await);
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);
        errors.absorb(self.notify_released(tenant_id, &result.released).await);
        if !result.retried.is_empty() {
            let payloads = notify_payloads(
                result
                    .retried
                    .iter()
                    .map(|t| (t.queue.as_str(), t.concurrency_strategy_ids.as_slice())),
            );
            errors.absorb(
                self.notify_scheduler(tenant_id, SchedulerNotice::Created, &payloads)
                    .await,
            );
        }

        tracing::debug!(
            tenant_id = %tenant_id,
            failed = result.released.len(),
            retried = result.retried.len(),
            "failed task attempts"
        );
        Ok(result)
    }

    async fn notify_released(&self, tenant_id: TenantId, released: &[ReleasedTask]) -> Result<()> {
        if released.is_empty() {
            return Ok(());
        }
        let payloads = notify_payloads(
            released
                .iter()
                .map(|t| (t.queue.as_str(), t.concurrency_strategy_ids.as_slice())),
        );
        self.notify_scheduler(tenant_id, SchedulerNotice::Released, &payloads)
            .await
    }

    /// Creates the current task partitions, then starts the queue consumer,
    /// the timeout and reassignment sweeps and the partition maintenance
    /// loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial partition maintenance or the queue
    /// subscription fails.
    pub async fn start(self: &Arc<Self>) -> Result<ServiceHandle> {
        self.maintain_partitions(Utc::now()).await?;

        let cancel = CancellationToken::new();
        let consumer = SubBuffer::new(
            QueueType::TaskProcessing,
            self.mq.clone(),
            self.clone(),
            BufferOptions {
                max_batch: self.config.buffer_max_batch,
                flush_interval: self.config.buffer_flush_interval,
            },
        )
        .start(cancel.clone())
        .await?;

        let this = self.clone();
        let timeouts = self.spawn_sweep(
            "timeout",
            self.config.timeout_sweep_interval,
            Arc::new(move |tenant_id: TenantId| {
                let this = this.clone();
                async move { this.process_timeouts(tenant_id).await }.boxed()
            }),
            cancel.clone(),
        );
        let this = self.clone();
        let reassignments = self.spawn_sweep(
            "reassign",
            self.config.reassign_sweep_interval,
            Arc::new(move |tenant_id: TenantId| {
                let this = this.clone();
                async move { this.process_reassignments(tenant_id).await }.boxed()
            }),
            cancel.clone(),
        );

        let this = self.clone();
        let token = cancel.clone();
        let partitions = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.partition_maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.maintain_partitions(Utc::now()).await {
                            tracing::error!(error = %err, "task partition maintenance failed");
                        }
                    }
                }
            }
        });

        tracing::info!("tasks controller started");
        Ok(ServiceHandle::new(
            "tasks-controller",
            cancel,
            vec![consumer, timeouts, reassignments, partitions],
        ))
    }

    fn spawn_sweep(
        &self,
        name: &'static str,
        interval: std::time::Duration,
        operation: Operation,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = OperationPool::new(
            name,
            self.config.operation_timeout,
            operation,
            cancel.clone(),
        );
        let tenants = self.repos.tenants.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match tenants.list_tenants().await {
                            Ok(tenants) => {
                                for tenant in tenants {
                                    pool.run_or_continue(tenant.id);
                                }
                            }
                            Err(err) => {
                                tracing::error!(
                                    sweep = name,
                                    error = %err,
                                    "could not list tenants"
                                );
                            }
                        }
                    }
                }
            }
            pool.shutdown().await;
        })
    }
}

#[async_trait]
impl MessageHandler for TasksController {
    async fn handle(
        &self,
        tenant_id: TenantId,
        msg_id: &str,
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        let kind = msg_id.parse::<MessageKind>()?;
        let span = controller_span(kind.as_str(), &tenant_id.to_string());
        let result = recover_with_alert(&self.alerter, msg_id, async {
            match kind {
                MessageKind::TaskCompleted => {
                    self.handle_task_completed(tenant_id, &payloads).await
                }
                MessageKind::TaskFailed => self.handle_task_failed(tenant_id, &payloads).await,
                MessageKind::TaskCancelled => {
                    self.handle_task_cancelled(tenant_id, &payloads).await
                }
                MessageKind::UserEvent => self.handle_user_events(tenant_id, &payloads).await,
                MessageKind::TaskTrigger => self.handle_trigger(tenant_id, &payloads).await,
                MessageKind::InternalEvent => {
                    self.handle_internal_events(tenant_id, &payloads).await
                }
                other => Err(Error::UnknownMessageKind {
                    kind: other.as_str().to_string(),
                }),
            }
        })
        .instrument(span)
        .await;
        self.metrics.record_message(kind.as_str(), result.is_ok());
        if let Err(err) = &result {
            tracing::warn!(
                tenant_id = %tenant_id,
                kind = kind.as_str(),
                error = %err,
                "task batch failed"
            );
        }
        result
    }
}
