//! Metrics for the execution core.
//!
//! Everything is recorded through the `metrics` facade; installing an
//! exporter is left to the embedding service.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `kiln_flow_messages_handled_total` | Counter | `kind`, `result` |
//! | `kiln_flow_task_transitions_total` | Counter | `to_state` |
//! | `kiln_flow_concurrency_evaluation_seconds` | Histogram | `strategy` |
//! | `kiln_flow_concurrency_decisions_total` | Counter | `strategy`, `decision` |
//! | `kiln_flow_reconcile_batch_size` | Histogram | `table` |
//! | `kiln_flow_reconcile_saturated_total` | Counter | `table` |
//! | `kiln_flow_dedup_hits_total` | Counter | - |
//! | `kiln_flow_partitions_total` | Counter | `table`, `action` |
//! | `kiln_flow_sweep_tasks_total` | Counter | `sweep` |
//! | `kiln_flow_send_failures_total` | Counter | `kind` |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: messages handled by the task controller.
    pub const MESSAGES_HANDLED_TOTAL: &str = "kiln_flow_messages_handled_total";
    /// Counter: task state transitions committed by the controller.
    pub const TASK_TRANSITIONS_TOTAL: &str = "kiln_flow_task_transitions_total";
    /// Histogram: time spent evaluating one concurrency strategy.
    pub const CONCURRENCY_EVALUATION_SECONDS: &str = "kiln_flow_concurrency_evaluation_seconds";
    /// Counter: admission decisions made by concurrency strategies.
    pub const CONCURRENCY_DECISIONS_TOTAL: &str = "kiln_flow_concurrency_decisions_total";
    /// Histogram: rows folded per reconciliation batch.
    pub const RECONCILE_BATCH_SIZE: &str = "kiln_flow_reconcile_batch_size";
    /// Counter: reconciliation batches that hit their limit.
    pub const RECONCILE_SATURATED_TOTAL: &str = "kiln_flow_reconcile_saturated_total";
    /// Counter: monitoring events dropped as duplicates.
    pub const DEDUP_HITS_TOTAL: &str = "kiln_flow_dedup_hits_total";
    /// Counter: partitions created or dropped.
    pub const PARTITIONS_TOTAL: &str = "kiln_flow_partitions_total";
    /// Counter: tasks picked up by timeout and reassignment sweeps.
    pub const SWEEP_TASKS_TOTAL: &str = "kiln_flow_sweep_tasks_total";
    /// Counter: follow-up messages that could not be published.
    pub const SEND_FAILURES_TOTAL: &str = "kiln_flow_send_failures_total";
}

/// Label keys.
pub mod labels {
    /// Message kind.
    pub const KIND: &str = "kind";
    /// Handling result (ok, error).
    pub const RESULT: &str = "result";
    /// Target task state.
    pub const TO_STATE: &str = "to_state";
    /// Concurrency strategy kind.
    pub const STRATEGY: &str = "strategy";
    /// Concurrency decision (queued, cancelled, deferred).
    pub const DECISION: &str = "decision";
    /// Read model table.
    pub const TABLE: &str = "table";
    /// Partition action (created, dropped).
    pub const ACTION: &str = "action";
    /// Sweep name (timeout, reassign).
    pub const SWEEP: &str = "sweep";
}

/// Records execution core metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one handled message.
    pub fn record_message(&self, kind: &str, ok: bool) {
        counter!(
            names::MESSAGES_HANDLED_TOTAL,
            labels::KIND => kind.to_string(),
            labels::RESULT => if ok { "ok" } else { "error" },
        )
        .increment(1);
    }

    /// Records `count` tasks moving to `to_state`.
    pub fn record_task_transitions(&self, to_state: &str, count: usize) {
        if count == 0 {
            return;
        }
        counter!(
            names::TASK_TRANSITIONS_TOTAL,
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(count as u64);
    }

    /// Records how long one strategy evaluation took.
    pub fn observe_concurrency_evaluation(&self, strategy: &str, duration: Duration) {
        histogram!(
            names::CONCURRENCY_EVALUATION_SECONDS,
            labels::STRATEGY => strategy.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records `count` admission decisions of one kind.
    pub fn record_concurrency_decisions(&self, strategy: &str, decision: &str, count: usize) {
        if count == 0 {
            return;
        }
        counter!(
            names::CONCURRENCY_DECISIONS_TOTAL,
            labels::STRATEGY => strategy.to_string(),
            labels::DECISION => decision.to_string(),
        )
        .increment(count as u64);
    }

    /// Records one reconciliation batch, noting saturation.
    #[allow(clippy::cast_precision_loss)] // Batch sizes are bounded by the batch limit
    pub fn observe_reconcile_batch(&self, table: &str, rows: usize, saturated: bool) {
        histogram!(
            names::RECONCILE_BATCH_SIZE,
            labels::TABLE => table.to_string(),
        )
        .record(rows as f64);
        if saturated {
            counter!(
                names::RECONCILE_SATURATED_TOTAL,
                labels::TABLE => table.to_string(),
            )
            .increment(1);
        }
    }

    /// Records monitoring events dropped as duplicates.
    pub fn record_dedup_hits(&self, count: usize) {
        if count > 0 {
            counter!(names::DEDUP_HITS_TOTAL).increment(count as u64);
        }
    }

    /// Records one partition created or dropped.
    pub fn record_partition(&self, table: &str, action: &str) {
        counter!(
            names::PARTITIONS_TOTAL,
            labels::TABLE => table.to_string(),
            labels::ACTION => action.to_string(),
        )
        .increment(1);
    }

    /// Records tasks picked up by a sweep.
    pub fn record_sweep(&self, sweep: &str, count: usize) {
        if count > 0 {
            counter!(
                names::SWEEP_TASKS_TOTAL,
                labels::SWEEP => sweep.to_string(),
            )
            .increment(count as u64);
        }
    }

    /// Records follow-up messages of `kind` that could not be published.
    pub fn record_send_failures(&self, kind: &str, count: usize) {
        if count > 0 {
            counter!(
                names::SEND_FAILURES_TOTAL,
                labels::KIND => kind.to_string(),
            )
            .increment(count as u64);
        }
    }
}

/// Measures the time between creation and [`Stopwatch::stop`].
#[derive(Debug)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    /// Starts a stopwatch.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn stop(self) -> Duration {
        self.start.elapsed()
    }
}
