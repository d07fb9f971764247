//! Property-based tests for status reconciliation invariants.
//!
//! These tests use proptest to verify that folding arbitrary event streams,
//! in arbitrary batches, never regresses a recorded status.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;
use tokio_test::block_on;

use kiln_core::TenantId;
use kiln_flow::config::FlowConfig;
use kiln_flow::olap::fold::{PendingEvent, fold_dag_status, fold_pending, should_apply};
use kiln_flow::olap::memory::InMemoryOlapRepository;
use kiln_flow::olap::{OlapEventType, OlapRepository, ReadableStatus, TaskEvent};
use kiln_test_utils::{FlowHarness, WorkflowFactory};

/// Generates a readable status.
fn arb_status() -> impl Strategy<Value = ReadableStatus> {
    prop::sample::select(ReadableStatus::ALL.to_vec())
}

/// Generates one (retry count, status) event.
fn arb_event() -> impl Strategy<Value = (i32, ReadableStatus)> {
    (0i32..4, arb_status())
}

fn pending(tenant_id: TenantId, retry_count: i32, readable_status: ReadableStatus) -> PendingEvent {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    PendingEvent {
        tenant_id,
        task_id: 7,
        task_inserted_at: at,
        retry_count,
        readable_status,
        event_timestamp: at,
        worker_id: None,
        requeue_after: at,
        requeue_retries: 0,
    }
}

/// Applies batches the way the repository does and returns every recorded
/// state, starting from a fresh queued task.
fn reconcile(batches: &[Vec<(i32, ReadableStatus)>]) -> Vec<(i32, ReadableStatus)> {
    let tenant_id = TenantId::generate();
    let mut recorded = (0, ReadableStatus::Queued);
    let mut history = vec![recorded];
    for batch in batches {
        let events: Vec<_> = batch
            .iter()
            .map(|(retry, status)| pending(tenant_id, *retry, *status))
            .collect();
        for update in fold_pending(&events) {
            if should_apply(recorded.0, recorded.1, update.retry_count, update.readable_status) {
                recorded = (update.retry_count, update.readable_status);
            }
        }
        history.push(recorded);
    }
    history
}

/// Generates an event type of any readable status.
fn arb_event_type() -> impl Strategy<Value = OlapEventType> {
    prop::sample::select(OlapEventType::ALL.to_vec())
}

/// Runs the same batches through the in-memory analytics store, one
/// reconcile pass per batch, and returns the recorded attempt and status.
async fn reconcile_in_store(batches: &[Vec<(i32, OlapEventType)>]) -> (i32, ReadableStatus) {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);

    let olap = InMemoryOlapRepository::with_config(&FlowConfig {
        reconcile_partitions: 1,
        ..FlowConfig::default()
    });
    let now = Utc::now();
    olap.update_table_partitions(now).await.unwrap();
    olap.create_tasks(h.tenant_id, std::slice::from_ref(&task))
        .await
        .unwrap();

    for batch in batches {
        let events: Vec<TaskEvent> = batch
            .iter()
            .map(|(retry, event_type)| {
                TaskEvent::new(h.tenant_id, task.id, task.inserted_at, *retry, *event_type, now)
            })
            .collect();
        olap.insert_task_events(h.tenant_id, &events).await.unwrap();
        olap.update_task_statuses(h.tenant_id, 0, 10_000, now)
            .await
            .unwrap();
    }

    let row = olap
        .read_task_run(h.tenant_id, task.external_id)
        .await
        .unwrap()
        .expect("task row");
    (row.latest_retry_count, row.readable_status)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_records_what_the_fold_decides(
        batches in prop::collection::vec(
            prop::collection::vec((0i32..3, arb_event_type()), 1..5),
            1..5,
        )
    ) {
        let statuses: Vec<Vec<(i32, ReadableStatus)>> = batches
            .iter()
            .map(|b| b.iter().map(|(r, t)| (*r, t.readable_status())).collect())
            .collect();
        let expected = *reconcile(&statuses).last().unwrap();
        let recorded = block_on(reconcile_in_store(&batches));
        prop_assert_eq!(recorded, expected);
    }
}

proptest! {
    #[test]
    fn recorded_status_never_regresses(
        batches in prop::collection::vec(prop::collection::vec(arb_event(), 0..6), 1..8)
    ) {
        let history = reconcile(&batches);
        for pair in history.windows(2) {
            prop_assert!(pair[1].1.rank() >= pair[0].1.rank());
            prop_assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn redelivering_a_batch_is_idempotent(batch in prop::collection::vec(arb_event(), 1..8)) {
        let once = reconcile(&[batch.clone()]);
        let twice = reconcile(&[batch.clone(), batch]);
        prop_assert_eq!(once.last(), twice.last());
    }

    #[test]
    fn running_is_never_replaced_by_queued(retry in 0i32..4) {
        let history = reconcile(&[
            vec![(retry, ReadableStatus::Running)],
            vec![(retry, ReadableStatus::Queued)],
        ]);
        prop_assert_eq!(history.last().unwrap().1, ReadableStatus::Running);
    }

    #[test]
    fn dag_status_is_terminal_only_when_every_task_is(
        statuses in prop::collection::vec(arb_status(), 1..6),
        extra in 0usize..3,
    ) {
        let total = statuses.len() + extra;
        let folded = fold_dag_status(total, &statuses);
        let all_terminal = extra == 0 && statuses.iter().all(|s| s.is_terminal());
        prop_assert_eq!(folded.is_terminal(), all_terminal);
    }
}
