//! Pure folding rules of status reconciliation.
//!
//! A batch of pending events is grouped per task; within a task only the
//! highest attempt counts, and within that attempt the highest ranked status
//! wins. The winner is applied only when [`should_apply`] holds, which makes
//! the fold idempotent and immune to out-of-order delivery.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use kiln_core::{TenantId, WorkerId};

use super::{ReadableStatus, TaskEvent};
use crate::task::TaskId;

/// Events whose task did not show up are retried this many times.
pub const MAX_REQUEUE_RETRIES: i32 = 10;

/// Base delay of the requeue backoff.
pub const REQUEUE_BASE_DELAY_SECS: i64 = 2;

/// An event waiting in the reconciliation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The task.
    pub task_id: TaskId,
    /// Insertion timestamp of the task.
    pub task_inserted_at: DateTime<Utc>,
    /// The attempt.
    pub retry_count: i32,
    /// Status implied by the event.
    pub readable_status: ReadableStatus,
    /// When the event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Worker named by the event.
    pub worker_id: Option<WorkerId>,
    /// Earliest instant the event may be folded.
    pub requeue_after: DateTime<Utc>,
    /// How often the event was already requeued.
    pub requeue_retries: i32,
}

impl PendingEvent {
    /// Queues `event` for immediate reconciliation.
    #[must_use]
    pub fn from_event(event: &TaskEvent, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: event.tenant_id,
            task_id: event.task_id,
            task_inserted_at: event.task_inserted_at,
            retry_count: event.retry_count,
            readable_status: event.readable_status,
            event_timestamp: event.event_timestamp,
            worker_id: event.worker_id,
            requeue_after: now,
            requeue_retries: 0,
        }
    }

    /// Returns the event rescheduled with backoff, or `None` once the requeue
    /// budget is spent.
    #[must_use]
    pub fn requeued(&self, now: DateTime<Utc>) -> Option<Self> {
        if self.requeue_retries >= MAX_REQUEUE_RETRIES {
            return None;
        }
        Some(Self {
            requeue_after: now + requeue_delay(self.requeue_retries),
            requeue_retries: self.requeue_retries + 1,
            ..self.clone()
        })
    }
}

/// Returns `2^retries * 2s`.
#[must_use]
pub fn requeue_delay(requeue_retries: i32) -> Duration {
    let exponent = u32::try_from(requeue_retries.clamp(0, MAX_REQUEUE_RETRIES)).unwrap_or(0);
    Duration::seconds(REQUEUE_BASE_DELAY_SECS * (1_i64 << exponent))
}

/// The winning candidate of one task within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldedUpdate {
    /// The task.
    pub task_id: TaskId,
    /// Insertion timestamp of the task.
    pub task_inserted_at: DateTime<Utc>,
    /// Highest attempt seen.
    pub retry_count: i32,
    /// Highest status of that attempt.
    pub readable_status: ReadableStatus,
    /// Timestamp of the winning event.
    pub event_timestamp: DateTime<Utc>,
    /// Worker of the winning event, or of any event of that attempt.
    pub worker_id: Option<WorkerId>,
}

/// Reduces a batch to one candidate per task, ordered by task id.
#[must_use]
pub fn fold_pending(events: &[PendingEvent]) -> Vec<FoldedUpdate> {
    let mut folded: BTreeMap<(TaskId, DateTime<Utc>), FoldedUpdate> = BTreeMap::new();
    for event in events {
        let candidate = FoldedUpdate {
            task_id: event.task_id,
            task_inserted_at: event.task_inserted_at,
            retry_count: event.retry_count,
            readable_status: event.readable_status,
            event_timestamp: event.event_timestamp,
            worker_id: event.worker_id,
        };
        folded
            .entry((event.task_id, event.task_inserted_at))
            .and_modify(|current| merge(current, &candidate))
            .or_insert(candidate);
    }
    folded.into_values().collect()
}

fn merge(current: &mut FoldedUpdate, candidate: &FoldedUpdate) {
    if candidate.retry_count > current.retry_count {
        *current = *candidate;
        return;
    }
    if candidate.retry_count < current.retry_count {
        return;
    }
    let worker_id = current.worker_id.or(candidate.worker_id);
    if candidate.readable_status.outranks(current.readable_status) {
        *current = *candidate;
    }
    current.worker_id = current.worker_id.or(worker_id);
}

/// Returns true if a candidate may replace the recorded status.
#[must_use]
pub fn should_apply(
    recorded_retry_count: i32,
    recorded_status: ReadableStatus,
    candidate_retry_count: i32,
    candidate_status: ReadableStatus,
) -> bool {
    candidate_retry_count >= recorded_retry_count && candidate_status.outranks(recorded_status)
}

/// Derives a run's status from its tasks.
///
/// A run is queued until one of its tasks moves, running until all
/// `total_tasks` reached a terminal status, and then failed, cancelled or
/// completed in that order of precedence.
#[must_use]
pub fn fold_dag_status(total_tasks: usize, task_statuses: &[ReadableStatus]) -> ReadableStatus {
    if task_statuses.iter().all(|s| *s == ReadableStatus::Queued) {
        return ReadableStatus::Queued;
    }
    let terminal = task_statuses.iter().filter(|s| s.is_terminal()).count();
    if terminal < total_tasks.max(1) {
        return ReadableStatus::Running;
    }
    if task_statuses.contains(&ReadableStatus::Failed) {
        ReadableStatus::Failed
    } else if task_statuses.contains(&ReadableStatus::Cancelled) {
        ReadableStatus::Cancelled
    } else {
        ReadableStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(task_id: TaskId, retry_count: i32, status: ReadableStatus) -> PendingEvent {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        PendingEvent {
            tenant_id: TenantId::generate(),
            task_id,
            task_inserted_at: at,
            retry_count,
            readable_status: status,
            event_timestamp: at,
            worker_id: None,
            requeue_after: at,
            requeue_retries: 0,
        }
    }

    #[test]
    fn highest_attempt_wins_before_highest_status() {
        let events = vec![
            pending(1, 0, ReadableStatus::Failed),
            pending(1, 1, ReadableStatus::Queued),
            pending(1, 1, ReadableStatus::Running),
            pending(2, 0, ReadableStatus::Completed),
        ];
        let folded = fold_pending(&events);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].retry_count, 1);
        assert_eq!(folded[0].readable_status, ReadableStatus::Running);
        assert_eq!(folded[1].readable_status, ReadableStatus::Completed);
    }

    #[test]
    fn worker_is_kept_from_any_event_of_the_attempt() {
        let worker = WorkerId::generate();
        let mut assigned = pending(1, 0, ReadableStatus::Running);
        assigned.worker_id = Some(worker);
        let events = vec![assigned, pending(1, 0, ReadableStatus::Completed)];
        let folded = fold_pending(&events);
        assert_eq!(folded[0].readable_status, ReadableStatus::Completed);
        assert_eq!(folded[0].worker_id, Some(worker));
    }

    #[test]
    fn stale_or_equal_candidates_are_not_applied() {
        assert!(!should_apply(0, ReadableStatus::Running, 0, ReadableStatus::Queued));
        assert!(!should_apply(0, ReadableStatus::Running, 0, ReadableStatus::Running));
        assert!(!should_apply(2, ReadableStatus::Queued, 1, ReadableStatus::Failed));
        assert!(should_apply(0, ReadableStatus::Running, 1, ReadableStatus::Failed));
        assert!(should_apply(1, ReadableStatus::Queued, 1, ReadableStatus::Completed));
    }

    #[test]
    fn requeue_backs_off_exponentially_until_budget_is_spent() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(requeue_delay(0), Duration::seconds(2));
        assert_eq!(requeue_delay(3), Duration::seconds(16));

        let mut event = pending(1, 0, ReadableStatus::Queued);
        for expected in 1..=MAX_REQUEUE_RETRIES {
            event = event.requeued(now).unwrap();
            assert_eq!(event.requeue_retries, expected);
        }
        assert_eq!(event.requeue_after, now + requeue_delay(MAX_REQUEUE_RETRIES - 1));
        assert!(event.requeued(now).is_none());
    }

    #[test]
    fn dag_status_follows_its_tasks() {
        use ReadableStatus::{Cancelled, Completed, Failed, Queued, Running};

        assert_eq!(fold_dag_status(2, &[]), Queued);
        assert_eq!(fold_dag_status(2, &[Queued]), Queued);
        assert_eq!(fold_dag_status(2, &[Completed]), Running);
        assert_eq!(fold_dag_status(2, &[Completed, Running]), Running);
        assert_eq!(fold_dag_status(2, &[Completed, Completed]), Completed);
        assert_eq!(fold_dag_status(3, &[Completed, Failed, Cancelled]), Failed);
        assert_eq!(fold_dag_status(2, &[Cancelled, Completed]), Cancelled);
    }
}
