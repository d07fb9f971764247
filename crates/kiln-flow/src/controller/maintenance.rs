//! Periodic sweeps run by the tasks controller.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use kiln_core::TenantId;

use super::TasksController;
use crate::error::{MultiError, Result};
use crate::olap::OlapEventType;
use crate::repository::{FailTaskOpts, FailTasksResult, TimedOutTask, TimeoutKind};
use crate::task::TaskIdRetryCount;
use crate::tasktypes::CreateMonitoringEventPayload;

const WORKER_INACTIVE: &str = "worker became inactive";

/// Attempts that actually transitioned, as opposed to those already moved on
/// by a concurrent completion.
fn transitioned(result: &FailTasksResult) -> HashSet<TaskIdRetryCount> {
    result
        .released
        .iter()
        .map(|t| TaskIdRetryCount::new(t.id, t.retry_count))
        .chain(result.retried.iter().map(|t| t.failed_attempt))
        .collect()
}

fn timeout_reason(timed_out: &TimedOutTask) -> (OlapEventType, String) {
    match timed_out.kind {
        TimeoutKind::Schedule => (
            OlapEventType::SchedulingTimedOut,
            format!(
                "task waited in the queue longer than its schedule timeout of {}s",
                timed_out.task.schedule_timeout_secs
            ),
        ),
        TimeoutKind::Step => (
            OlapEventType::TimedOut,
            format!(
                "task exceeded its step timeout of {}s",
                timed_out.task.step_timeout_secs
            ),
        ),
    }
}

impl TasksController {
    /// Fails one batch of the tenant's timed-out attempts as infrastructure
    /// failures. Running attempts are also stopped on their worker.
    ///
    /// Returns true if the batch was full and more timeouts may be pending.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the listing or the failure. Send
    /// failures are logged and counted.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn process_timeouts(&self, tenant_id: TenantId) -> Result<bool> {
        let limit = self.config.sweep_batch_limit;
        let timed_out = self
            .repos
            .tasks
            .list_tasks_to_timeout(tenant_id, limit, Utc::now())
            .await?;
        if timed_out.is_empty() {
            return Ok(false);
        }

        let opts: Vec<FailTaskOpts> = timed_out
            .iter()
            .map(|t| FailTaskOpts {
                task: t.task.attempt(),
                is_app_error: false,
                error_msg: timeout_reason(t).1,
            })
            .collect();

        let mut errors = MultiError::new();
        let result = self.fail_and_signal(tenant_id, &opts, &mut errors).await?;
        let moved = transitioned(&result);

        let now = Utc::now();
        let mut monitoring = Vec::new();
        let mut to_signal = Vec::new();
        for t in timed_out.iter().filter(|t| moved.contains(&t.task.attempt())) {
            let (event_type, reason) = timeout_reason(t);
            monitoring.push(
                CreateMonitoringEventPayload::new(t.task.id, t.task.retry_count, event_type, now)
                    .with_worker(t.task.worker_id)
                    .with_message(reason),
            );
            if let (TimeoutKind::Step, Some(worker_id)) = (t.kind, t.task.worker_id) {
                to_signal.push((t.task.attempt(), worker_id));
            }
        }
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);
        errors.absorb(self.signal_workers_cancelled(tenant_id, &to_signal).await);

        self.metrics.record_sweep("timeout", moved.len());
        tracing::info!(
            tenant_id = %tenant_id,
            timed_out = moved.len(),
            retried = result.retried.len(),
            "processed task timeouts"
        );
        self.report_send_failures(tenant_id, "timeout", errors);
        Ok(timed_out.len() >= limit)
    }

    /// Moves one batch of attempts off inactive workers by failing them as
    /// infrastructure failures.
    ///
    /// Returns true if the batch was full and more attempts may be pending.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the listing or the failure. Send
    /// failures are logged and counted.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn process_reassignments(&self, tenant_id: TenantId) -> Result<bool> {
        let limit = self.config.sweep_batch_limit;
        let lost = self
            .repos
            .tasks
            .list_tasks_to_reassign(tenant_id, limit)
            .await?;
        if lost.is_empty() {
            return Ok(false);
        }

        let opts: Vec<FailTaskOpts> = lost
            .iter()
            .map(|t| FailTaskOpts {
                task: t.task,
                is_app_error: false,
                error_msg: WORKER_INACTIVE.to_string(),
            })
            .collect();

        let mut errors = MultiError::new();
        let result = self.fail_and_signal(tenant_id, &opts, &mut errors).await?;
        let moved = transitioned(&result);

        let now = Utc::now();
        let monitoring: Vec<_> = lost
            .iter()
            .filter(|t| moved.contains(&t.task))
            .map(|t| {
                CreateMonitoringEventPayload::new(
                    t.task.id,
                    t.task.retry_count,
                    OlapEventType::Reassigned,
                    now,
                )
                .with_worker(Some(t.worker_id))
                .with_message(WORKER_INACTIVE)
            })
            .collect();
        errors.absorb(self.send_monitoring_events(tenant_id, &monitoring).await);

        self.metrics.record_sweep("reassign", moved.len());
        tracing::info!(
            tenant_id = %tenant_id,
            reassigned = result.retried.len(),
            failed = result.released.len(),
            "processed lost workers"
        );
        self.report_send_failures(tenant_id, "reassign", errors);
        Ok(lost.len() >= limit)
    }

    /// Ensures the task table partitions for today and tomorrow exist.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the partition DDL.
    pub async fn maintain_partitions(&self, now: DateTime<Utc>) -> Result<()> {
        self.repos.tasks.update_table_partitions(now).await?;
        self.metrics.record_partition("tasks", "ensured");
        tracing::debug!(date = %now.date_naive(), "task partitions ensured");
        Ok(())
    }
}
