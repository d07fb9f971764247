//! Concurrency strategy admission through the repository, supervisor and
//! controller.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use kiln_flow::concurrency::{ConcurrencyResults, ConcurrencySupervisor};
use kiln_flow::config::FlowConfig;
use kiln_flow::msgqueue::{MessageKind, QueueType};
use kiln_flow::task::{Task, TaskState};
use kiln_flow::tasktypes::CancelledTaskPayload;
use kiln_flow::workflow::ConcurrencyStrategyKind;
use kiln_test_utils::{
    FlowHarness, TEST_PARTITION, WorkflowFactory, assert_published, assert_task_state, encode,
    published_payloads,
};

async fn trigger_groups(h: &FlowHarness, groups: &[&str]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for group in groups {
        tasks.extend(h.trigger("W", json!({ "group": group })).await);
    }
    tasks
}

fn ids<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> BTreeSet<i64> {
    tasks.into_iter().map(|t| t.id).collect()
}

#[tokio::test]
async fn cancel_in_progress_keeps_exactly_max_newest() {
    let h = FlowHarness::new().await;
    let strategy = h
        .register(WorkflowFactory::concurrency("W", ConcurrencyStrategyKind::CancelInProgress, 2))
        .remove(0);
    let tasks = trigger_groups(&h, &["g", "g", "g", "g"]).await;

    let result = h
        .repos
        .concurrency
        .run_concurrency_strategy(h.tenant_id, &strategy)
        .await
        .unwrap();
    assert_eq!(result.queued.len(), 2);
    assert_eq!(result.cancelled.len(), 2);
    let cancelled: BTreeSet<i64> = result.cancelled.iter().map(|t| t.task.id).collect();
    assert_eq!(cancelled, ids(&tasks[..2]));

    let supervisor = ConcurrencySupervisor::new(
        TEST_PARTITION,
        h.mq.clone(),
        h.repos.clone(),
        h.config.clone(),
    );
    supervisor
        .handle_results(ConcurrencyResults {
            tenant_id: h.tenant_id,
            strategy_id: strategy.id,
            result,
        })
        .await
        .unwrap();

    let requests: Vec<CancelledTaskPayload> =
        published_payloads(&h.mq, &QueueType::TaskProcessing, MessageKind::TaskCancelled);
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.should_notify));
    h.controller
        .handle_task_cancelled(h.tenant_id, &encode(&requests))
        .await
        .unwrap();

    for task in &tasks[..2] {
        assert_task_state(&h.task(task.id).await, TaskState::Cancelled);
    }
    let pending: BTreeSet<i64> = h
        .store
        .queue_items(h.tenant_id)
        .unwrap()
        .iter()
        .map(|item| item.task.id)
        .collect();
    assert_eq!(pending, ids(&tasks[2..]));
    assert!(
        h.store
            .slots(strategy.id)
            .unwrap()
            .iter()
            .all(|slot| !cancelled.contains(&slot.task.id))
    );
}

#[tokio::test]
async fn round_robin_admits_one_per_group_first() {
    let h = FlowHarness::new().await;
    let strategy = h
        .register(WorkflowFactory::concurrency("W", ConcurrencyStrategyKind::GroupRoundRobin, 2))
        .remove(0);
    let tasks = trigger_groups(&h, &["a", "a", "a", "b"]).await;

    let result = h
        .repos
        .concurrency
        .run_concurrency_strategy(h.tenant_id, &strategy)
        .await
        .unwrap();

    let queued: BTreeSet<i64> = result.queued.iter().map(|t| t.task.id).collect();
    assert_eq!(queued, ids([&tasks[0], &tasks[3]]));
    assert!(result.cancelled.is_empty());

    // Freeing one slot of group "a" admits its next task.
    h.controller
        .handle_task_completed(
            h.tenant_id,
            &encode(&[kiln_flow::tasktypes::CompletedTaskPayload {
                task_id: tasks[0].id,
                retry_count: 0,
                output: json!(null),
            }]),
        )
        .await
        .unwrap();
    let result = h
        .repos
        .concurrency
        .run_concurrency_strategy(h.tenant_id, &strategy)
        .await
        .unwrap();
    let queued: Vec<i64> = result.queued.iter().map(|t| t.task.id).collect();
    assert_eq!(queued, vec![tasks[1].id]);
}

#[tokio::test]
async fn running_supervisor_enforces_cancel_newest() {
    let config = FlowConfig {
        concurrency_tick: Duration::from_millis(20),
        liveness_tick: Duration::from_millis(50),
        ..FlowConfig::default()
    };
    let h = FlowHarness::with_config(config).await;
    h.register(WorkflowFactory::concurrency("W", ConcurrencyStrategyKind::CancelNewest, 1));

    let supervisor = ConcurrencySupervisor::new(
        TEST_PARTITION,
        h.mq.clone(),
        h.repos.clone(),
        h.config.clone(),
    );
    supervisor.start().await.unwrap();
    let tasks = trigger_groups(&h, &["g", "g", "g"]).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let cancelled: Vec<CancelledTaskPayload> =
                published_payloads(&h.mq, &QueueType::TaskProcessing, MessageKind::TaskCancelled);
            if cancelled.len() == 2 && h.store.queue_items(h.tenant_id).unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("strategy evaluated");

    let admitted = h.store.queue_items(h.tenant_id).unwrap();
    assert_eq!(admitted[0].task.id, tasks[0].id);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn failed_eviction_still_admits_the_survivors() {
    let (h, faulty) = FlowHarness::with_faulty_queue().await;
    let strategy = h
        .register(WorkflowFactory::concurrency("W", ConcurrencyStrategyKind::CancelInProgress, 1))
        .remove(0);
    let tasks = trigger_groups(&h, &["g", "g"]).await;
    h.mq.clear_published().unwrap();

    let result = h
        .repos
        .concurrency
        .run_concurrency_strategy(h.tenant_id, &strategy)
        .await
        .unwrap();
    assert_eq!(result.cancelled.len(), 1);

    faulty.fail_queue(&QueueType::TaskProcessing);
    let supervisor =
        ConcurrencySupervisor::new(
            TEST_PARTITION,
            faulty.clone(),
            h.repos.clone(),
            h.config.clone(),
        );
    let err = supervisor
        .handle_results(ConcurrencyResults {
            tenant_id: h.tenant_id,
            strategy_id: strategy.id,
            result,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected failure"));

    assert_eq!(faulty.rejected(), vec![QueueType::TaskProcessing.name()]);
    assert_published(&h.mq, &QueueType::TaskProcessing, MessageKind::TaskCancelled, 0);
    assert_published(&h.mq, &FlowHarness::scheduler_queue(), MessageKind::NotifyTaskCreated, 1);
    // The evicted task was never cancelled.
    assert_task_state(&h.task(tasks[0].id).await, TaskState::Queued);
}
