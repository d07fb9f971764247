//! Custom assertion helpers for integration tests.

use serde::de::DeserializeOwned;

use kiln_flow::msgqueue::memory::InMemoryMessageQueue;
use kiln_flow::msgqueue::{Message, MessageKind, QueueType};
use kiln_flow::task::{Task, TaskState};
use kiln_flow::tasktypes::{CreateMonitoringEventPayload, InternalEventTaskPayload};

/// Returns the decoded payloads of every `kind` message published to `queue`.
pub fn published_payloads<T: DeserializeOwned>(
    mq: &InMemoryMessageQueue,
    queue: &QueueType,
    kind: MessageKind,
) -> Vec<T> {
    mq.published_of_kind(queue, kind)
        .expect("published")
        .iter()
        .flat_map(Message::decode_payloads::<T>)
        .collect()
}

/// Asserts that exactly `count` messages of `kind` were published to `queue`
/// and returns them.
///
/// # Panics
///
/// Panics if the count differs.
pub fn assert_published(
    mq: &InMemoryMessageQueue,
    queue: &QueueType,
    kind: MessageKind,
    count: usize,
) -> Vec<Message> {
    let messages = mq.published_of_kind(queue, kind).expect("published");
    assert_eq!(
        messages.len(),
        count,
        "Expected {count} {kind} message(s) on {queue}, found {}",
        messages.len()
    );
    messages
}

/// Asserts that a task is in `state`.
///
/// # Panics
///
/// Panics if the state differs.
pub fn assert_task_state(task: &Task, state: TaskState) {
    assert_eq!(
        task.state, state,
        "Expected task {} to be {state:?}, but it was {:?}",
        task.id, task.state
    );
}

/// Returns every monitoring event sent to the read model.
pub fn monitoring_events(mq: &InMemoryMessageQueue) -> Vec<CreateMonitoringEventPayload> {
    published_payloads(mq, &QueueType::Olap, MessageKind::CreateMonitoringEvent)
}

/// Returns every internal event sent back to the controller.
pub fn internal_events(mq: &InMemoryMessageQueue) -> Vec<InternalEventTaskPayload> {
    published_payloads(mq, &QueueType::TaskProcessing, MessageKind::InternalEvent)
}

/// Asserts that no monitoring event of `event_type` was recorded for the
/// attempt.
///
/// # Panics
///
/// Panics if such an event exists.
pub fn assert_no_monitoring_event(
    mq: &InMemoryMessageQueue,
    task_id: i64,
    retry_count: i32,
    event_type: &str,
) {
    let found = monitoring_events(mq)
        .into_iter()
        .any(
            |e| e.task_id == task_id && e.retry_count == retry_count && e.event_type == event_type,
        );
    assert!(
        !found,
        "Unexpected {event_type} monitoring event for task {task_id} attempt {retry_count}"
    );
}
