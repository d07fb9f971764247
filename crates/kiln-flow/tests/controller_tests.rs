//! Task lifecycle controller tests over the in-memory store and bus.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use serde_json::json;

use kiln_flow::error::Error;
use kiln_flow::events::{task_cancelled_event_key, task_completed_event_key, task_failed_event_key};
use kiln_flow::msgqueue::buffer::MessageHandler;
use kiln_flow::msgqueue::{MessageKind, MessageQueue, QueueType};
use kiln_flow::task::TaskState;
use kiln_flow::tasktypes::{
    CancelledTaskPayload, CompletedTaskPayload, FailedTaskPayload, NotifyQueuePayload,
    SignalTaskCancelledPayload, TriggerTaskPayload, trigger_task_message,
};
use kiln_test_utils::{
    FlowHarness, WorkflowFactory, assert_no_monitoring_event, assert_published, assert_task_state,
    encode, init_test_logging, internal_events, monitoring_events, published_payloads,
};

#[tokio::test]
async fn trigger_creates_one_queued_task() {
    init_test_logging();
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));

    let tasks = h.trigger("W", json!({"n": 1})).await;

    assert_eq!(tasks.len(), 1);
    assert_task_state(&h.task(tasks[0].id).await, TaskState::Queued);
    assert_published(&h.mq, &FlowHarness::scheduler_queue(), MessageKind::NotifyTaskCreated, 1);
    assert_published(&h.mq, &QueueType::Olap, MessageKind::CreatedTask, 1);
    assert_published(&h.mq, &QueueType::Olap, MessageKind::CreatedDag, 0);
}

#[tokio::test]
async fn infrastructure_failure_is_retried_without_terminal_events() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, _) = h.register_worker();
    h.assign(task.attempt(), worker).await;

    h.controller
        .handle_task_failed(
            h.tenant_id,
            &encode(&[FailedTaskPayload {
                task_id: task.id,
                retry_count: 0,
                is_app_error: false,
                error_msg: "connection reset".into(),
            }]),
        )
        .await
        .unwrap();

    let current = h.task(task.id).await;
    assert_eq!(current.retry_count, 1);
    assert_task_state(&current, TaskState::Queued);

    assert_no_monitoring_event(&h.mq, task.id, 0, "FAILED");
    assert!(internal_events(&h.mq).is_empty());
    let queued: Vec<_> = monitoring_events(&h.mq)
        .into_iter()
        .filter(|e| e.task_id == task.id && e.retry_count == 1 && e.event_type == "QUEUED")
        .collect();
    assert_eq!(queued.len(), 1);
    assert_published(&h.mq, &FlowHarness::scheduler_queue(), MessageKind::NotifyTaskCreated, 2);
}

#[tokio::test]
async fn application_failure_without_retries_is_terminal() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::with_retries("W", 0));
    let task = h.trigger("W", json!({})).await.remove(0);

    h.controller
        .handle_task_failed(
            h.tenant_id,
            &encode(&[FailedTaskPayload {
                task_id: task.id,
                retry_count: 0,
                is_app_error: true,
                error_msg: "boom".into(),
            }]),
        )
        .await
        .unwrap();

    assert_task_state(&h.task(task.id).await, TaskState::Failed);
    let events = internal_events(&h.mq);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_key, task_failed_event_key(&task.external_id));
    assert_eq!(events[0].event_data["error"], "boom");

    let failed: Vec<_> = monitoring_events(&h.mq)
        .into_iter()
        .filter(|e| e.event_type == "FAILED")
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event_message.as_deref(), Some("boom"));

    let released: Vec<NotifyQueuePayload> = published_payloads(
        &h.mq,
        &FlowHarness::scheduler_queue(),
        MessageKind::NotifyTaskReleased,
    );
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].queue, task.queue);
}

#[tokio::test]
async fn application_failure_with_budget_is_retried() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::with_retries("W", 1));
    let task = h.trigger("W", json!({})).await.remove(0);

    let fail = |retry_count| {
        encode(&[FailedTaskPayload {
            task_id: task.id,
            retry_count,
            is_app_error: true,
            error_msg: "boom".into(),
        }])
    };
    h.controller.handle_task_failed(h.tenant_id, &fail(0)).await.unwrap();
    assert_eq!(h.task(task.id).await.retry_count, 1);

    h.controller.handle_task_failed(h.tenant_id, &fail(1)).await.unwrap();
    let current = h.task(task.id).await;
    assert_eq!(current.retry_count, 1);
    assert_task_state(&current, TaskState::Failed);
}

#[tokio::test]
async fn completion_announces_output() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, _) = h.register_worker();
    h.assign(task.attempt(), worker).await;

    h.controller
        .handle_task_completed(
            h.tenant_id,
            &encode(&[CompletedTaskPayload {
                task_id: task.id,
                retry_count: 0,
                output: json!({"rows": 3}),
            }]),
        )
        .await
        .unwrap();

    assert_task_state(&h.task(task.id).await, TaskState::Completed);

    let events = internal_events(&h.mq);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_key, task_completed_event_key(&task.external_id));
    assert_eq!(events[0].event_data["output"], json!({"rows": 3}));

    let finished: Vec<_> = monitoring_events(&h.mq)
        .into_iter()
        .filter(|e| e.event_type == "FINISHED")
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].worker_id, Some(worker));
    assert_eq!(finished[0].event_payload, json!({"rows": 3}).to_string());
    assert_published(&h.mq, &FlowHarness::scheduler_queue(), MessageKind::NotifyTaskReleased, 1);
}

#[tokio::test]
async fn cancelling_an_assigned_task_signals_its_dispatcher() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, dispatcher) = h.register_worker();
    h.assign(task.attempt(), worker).await;

    h.controller
        .handle_task_cancelled(
            h.tenant_id,
            &encode(&[CancelledTaskPayload::new(task.id, 0, true)]),
        )
        .await
        .unwrap();

    assert_task_state(&h.task(task.id).await, TaskState::Cancelled);
    let signals: Vec<SignalTaskCancelledPayload> = published_payloads(
        &h.mq,
        &QueueType::Dispatcher(dispatcher),
        MessageKind::TaskCancelled,
    );
    assert_eq!(
        signals,
        vec![SignalTaskCancelledPayload {
            task_id: task.id,
            worker_id: worker,
            retry_count: 0,
        }]
    );

    let cancelled: Vec<_> = internal_events(&h.mq)
        .into_iter()
        .filter(|e| e.event_key == task_cancelled_event_key(&task.external_id))
        .collect();
    assert_eq!(cancelled.len(), 1);
}

#[tokio::test]
async fn cancelling_a_queued_task_skips_the_dispatcher() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);
    h.register_worker();

    h.controller
        .handle_task_cancelled(
            h.tenant_id,
            &encode(&[CancelledTaskPayload::new(task.id, 0, true)]),
        )
        .await
        .unwrap();

    assert_task_state(&h.task(task.id).await, TaskState::Cancelled);
    let dispatcher_queues = h
        .mq
        .queue_names()
        .unwrap()
        .into_iter()
        .filter(|name| name.ends_with("_dispatcher_v1"))
        .count();
    assert_eq!(dispatcher_queues, 0);
    assert_eq!(internal_events(&h.mq).len(), 1);
}

#[tokio::test]
async fn stale_attempts_are_ignored() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::with_retries("W", 2));
    let task = h.trigger("W", json!({})).await.remove(0);

    h.controller
        .handle_task_failed(
            h.tenant_id,
            &encode(&[FailedTaskPayload {
                task_id: task.id,
                retry_count: 0,
                is_app_error: true,
                error_msg: "first".into(),
            }]),
        )
        .await
        .unwrap();
    h.mq.clear_published().unwrap();

    h.controller
        .handle_task_completed(
            h.tenant_id,
            &encode(&[CompletedTaskPayload {
                task_id: task.id,
                retry_count: 0,
                output: json!(null),
            }]),
        )
        .await
        .unwrap();
    h.controller
        .handle_task_cancelled(
            h.tenant_id,
            &encode(&[CancelledTaskPayload::new(task.id, 0, true)]),
        )
        .await
        .unwrap();

    let current = h.task(task.id).await;
    assert_eq!(current.retry_count, 1);
    assert_task_state(&current, TaskState::Queued);
    assert!(internal_events(&h.mq).is_empty());
    assert!(monitoring_events(&h.mq).is_empty());
}

#[tokio::test]
async fn completing_a_parent_creates_its_child() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::chain("W"));
    let created = h.trigger("W", json!({})).await;
    assert_eq!(created.len(), 1);
    assert_published(&h.mq, &QueueType::Olap, MessageKind::CreatedDag, 1);
    let first = &created[0];

    h.controller
        .handle_task_completed(
            h.tenant_id,
            &encode(&[CompletedTaskPayload {
                task_id: first.id,
                retry_count: 0,
                output: json!({"ok": true}),
            }]),
        )
        .await
        .unwrap();

    let events = internal_events(&h.mq);
    h.controller
        .handle_internal_events(h.tenant_id, &encode(&events))
        .await
        .unwrap();

    let tasks = h.created_tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].step_readable_id, "second");
    assert_eq!(tasks[1].dag_id, first.dag_id);
    assert_task_state(&h.task(tasks[1].id).await, TaskState::Queued);
}

#[tokio::test]
async fn failing_a_parent_cancels_its_child() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::chain("W"));
    let first = h.trigger("W", json!({})).await.remove(0);

    h.controller
        .handle_task_failed(
            h.tenant_id,
            &encode(&[FailedTaskPayload {
                task_id: first.id,
                retry_count: 0,
                is_app_error: true,
                error_msg: "boom".into(),
            }]),
        )
        .await
        .unwrap();
    let events = internal_events(&h.mq);
    h.controller
        .handle_internal_events(h.tenant_id, &encode(&events))
        .await
        .unwrap();

    let child = h.created_tasks().pop().unwrap();
    assert_eq!(child.step_readable_id, "second");
    assert_task_state(&h.task(child.id).await, TaskState::Cancelled);
    assert!(
        monitoring_events(&h.mq)
            .iter()
            .any(|e| e.task_id == child.id && e.event_type == "CANCELLED")
    );
}

#[tokio::test]
async fn step_timeouts_fail_the_attempt_and_stop_the_worker() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::with_step_timeout("W", 0));
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, dispatcher) = h.register_worker();
    h.assign(task.attempt(), worker).await;

    let more = h.controller.process_timeouts(h.tenant_id).await.unwrap();

    assert!(!more);
    let current = h.task(task.id).await;
    assert_eq!(current.retry_count, 1);
    assert_task_state(&current, TaskState::Queued);
    assert!(
        monitoring_events(&h.mq)
            .iter()
            .any(|e| e.task_id == task.id && e.retry_count == 0 && e.event_type == "TIMED_OUT")
    );
    assert_published(&h.mq, &QueueType::Dispatcher(dispatcher), MessageKind::TaskCancelled, 1);

    assert!(!h.controller.process_timeouts(h.tenant_id).await.unwrap());
}

#[tokio::test]
async fn lost_workers_are_reassigned() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, _) = h.register_worker();
    h.assign(task.attempt(), worker).await;
    h.store.set_worker_active(worker, false).unwrap();

    h.controller.process_reassignments(h.tenant_id).await.unwrap();

    let current = h.task(task.id).await;
    assert_eq!(current.retry_count, 1);
    assert_task_state(&current, TaskState::Queued);
    assert!(current.worker_id.is_none());
    assert!(
        monitoring_events(&h.mq)
            .iter()
            .any(|e| e.task_id == task.id && e.retry_count == 0 && e.event_type == "REASSIGNED")
    );
}

#[tokio::test]
async fn unknown_and_foreign_kinds_are_rejected() {
    let h = FlowHarness::new().await;

    let err = h
        .controller
        .handle(h.tenant_id, "created-task", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMessageKind { .. }));

    let err = h
        .controller
        .handle(h.tenant_id, "no-such-kind", Vec::new())
        .await
        .unwrap_err();
    assert!(err.is_classification());
}

#[tokio::test]
async fn started_controller_consumes_the_task_queue() {
    let h = FlowHarness::new().await;
    h.register(WorkflowFactory::single_step("W"));
    let handle = h.controller.start().await.unwrap();

    let msg =
        trigger_task_message(h.tenant_id, &[TriggerTaskPayload::new("W", json!({}))]).unwrap();
    h.mq.send_message(&QueueType::TaskProcessing, msg).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.created_tasks().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("trigger was consumed");

    handle.shutdown().await;
}

#[tokio::test]
async fn lost_scheduler_notifications_do_not_fail_the_batch() {
    let (h, faulty) = FlowHarness::with_faulty_queue().await;
    h.register(WorkflowFactory::single_step("W"));
    faulty.fail_queue(&FlowHarness::scheduler_queue());

    // Creation still commits and reaches the read model.
    let task = h.trigger("W", json!({})).await.remove(0);
    let (worker, _) = h.register_worker();
    h.assign(task.attempt(), worker).await;

    let completed = encode(&[CompletedTaskPayload {
        task_id: task.id,
        retry_count: 0,
        output: json!({"ok": true}),
    }]);
    h.controller
        .handle_task_completed(h.tenant_id, &completed)
        .await
        .unwrap();

    assert_task_state(&h.task(task.id).await, TaskState::Completed);
    assert_eq!(
        faulty.rejected(),
        vec![FlowHarness::scheduler_queue().name(); 2]
    );
    assert_published(&h.mq, &FlowHarness::scheduler_queue(), MessageKind::NotifyTaskReleased, 0);
    let finished: Vec<_> = monitoring_events(&h.mq)
        .into_iter()
        .filter(|e| e.task_id == task.id && e.event_type == "FINISHED")
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(internal_events(&h.mq).len(), 1);

    // The whole message is handled the same way through the bus entry point.
    h.controller
        .handle(h.tenant_id, MessageKind::TaskCompleted.as_str(), completed)
        .await
        .unwrap();
}
