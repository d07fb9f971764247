//! Status reconciliation fed by the messages the tasks controller emits.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use kiln_flow::msgqueue::buffer::MessageHandler;
use kiln_flow::msgqueue::{MessageKind, QueueType};
use kiln_flow::olap::controller::OlapController;
use kiln_flow::olap::memory::InMemoryOlapRepository;
use kiln_flow::olap::{OlapRepository, OlapTable, ReadableStatus};
use kiln_flow::task::{DagWithData, Task};
use kiln_flow::tasktypes::{CompletedTaskPayload, FailedTaskPayload};
use kiln_test_utils::{FlowHarness, WorkflowFactory, encode, internal_events, published_payloads};

struct Pipeline {
    h: FlowHarness,
    olap: Arc<InMemoryOlapRepository>,
    controller: OlapController,
}

impl Pipeline {
    async fn new() -> Self {
        let h = FlowHarness::new().await;
        let olap = Arc::new(InMemoryOlapRepository::with_config(&h.config));
        let controller = OlapController::new(
            h.mq.clone(),
            olap.clone(),
            &h.repos,
            h.config.clone(),
        );
        controller.maintain_partitions(Utc::now()).await.unwrap();
        Self { h, olap, controller }
    }

    /// Delivers every analytics message published so far, then reconciles.
    async fn pump(&self) {
        for msg in self.h.mq.published(&QueueType::Olap).unwrap() {
            self.controller
                .handle(msg.tenant_id, &msg.id, msg.payloads.clone())
                .await
                .unwrap();
        }
        self.controller
            .reconcile_all(&CancellationToken::new())
            .await
            .unwrap();
    }

    async fn status(&self, task: &Task) -> (ReadableStatus, i32) {
        let row = self
            .olap
            .read_task_run(self.h.tenant_id, task.external_id)
            .await
            .unwrap()
            .expect("task row");
        (row.readable_status, row.latest_retry_count)
    }

    async fn complete(&self, task: &Task, retry_count: i32) {
        self.h
            .controller
            .handle_task_completed(
                self.h.tenant_id,
                &encode(&[CompletedTaskPayload {
                    task_id: task.id,
                    retry_count,
                    output: json!({"done": true}),
                }]),
            )
            .await
            .unwrap();
    }

    async fn fail(&self, task: &Task, retry_count: i32, is_app_error: bool) {
        self.h
            .controller
            .handle_task_failed(
                self.h.tenant_id,
                &encode(&[FailedTaskPayload {
                    task_id: task.id,
                    retry_count,
                    is_app_error,
                    error_msg: "boom".into(),
                }]),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn completed_task_reads_as_completed() {
    let p = Pipeline::new().await;
    p.h.register(WorkflowFactory::single_step("W"));
    let task = p.h.trigger("W", json!({})).await.remove(0);

    p.pump().await;
    assert_eq!(p.status(&task).await, (ReadableStatus::Queued, 0));

    p.complete(&task, 0).await;
    p.pump().await;
    assert_eq!(p.status(&task).await, (ReadableStatus::Completed, 0));
}

#[tokio::test]
async fn duplicate_delivery_changes_nothing() {
    let p = Pipeline::new().await;
    p.h.register(WorkflowFactory::single_step("W"));
    let task = p.h.trigger("W", json!({})).await.remove(0);
    p.complete(&task, 0).await;

    p.pump().await;
    let events = p.olap.event_count().unwrap();
    assert_eq!(p.controller.writer().cache().cached_keys().unwrap(), events);

    p.pump().await;
    assert_eq!(p.olap.event_count().unwrap(), events);
    assert_eq!(p.olap.pending_event_count().unwrap(), 0);
    assert_eq!(p.status(&task).await, (ReadableStatus::Completed, 0));
}

#[tokio::test]
async fn retry_then_completion_reads_as_completed_on_the_new_attempt() {
    let p = Pipeline::new().await;
    p.h.register(WorkflowFactory::single_step("W"));
    let task = p.h.trigger("W", json!({})).await.remove(0);

    p.fail(&task, 0, false).await;
    p.pump().await;
    // A retry's QUEUED never outranks what is already recorded.
    assert_eq!(p.status(&task).await, (ReadableStatus::Queued, 0));

    p.complete(&task, 1).await;
    p.pump().await;
    assert_eq!(p.status(&task).await, (ReadableStatus::Completed, 1));

    let events = p
        .olap
        .list_task_events(p.h.tenant_id, task.id, task.inserted_at)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.retry_count == 1 && e.readable_status == ReadableStatus::Queued));
    let last = events.last().unwrap();
    assert_eq!((last.retry_count, last.readable_status), (1, ReadableStatus::Completed));
}

#[tokio::test]
async fn dag_status_folds_from_its_tasks() {
    let p = Pipeline::new().await;
    p.h.register(WorkflowFactory::chain("W"));
    let first = p.h.trigger("W", json!({})).await.remove(0);
    let dag: DagWithData = published_payloads(&p.h.mq, &QueueType::Olap, MessageKind::CreatedDag)
        .pop()
        .unwrap();

    p.pump().await;
    let row = p
        .olap
        .read_dag(p.h.tenant_id, dag.dag.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.readable_status, ReadableStatus::Queued);

    p.fail(&first, 0, true).await;
    let events = internal_events(&p.h.mq);
    p.h.controller
        .handle_internal_events(p.h.tenant_id, &encode(&events))
        .await
        .unwrap();
    p.pump().await;

    assert_eq!(p.status(&first).await.0, ReadableStatus::Failed);
    let row = p
        .olap
        .read_dag(p.h.tenant_id, dag.dag.external_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.readable_status, ReadableStatus::Failed);
}

#[tokio::test]
async fn partition_maintenance_enforces_retention() {
    let p = Pipeline::new().await;
    let today = Utc::now().date_naive();
    for table in OlapTable::ALL {
        p.olap.attach_partition(table, today - Duration::days(10)).unwrap();
        p.olap.attach_partition(table, today - Duration::days(3)).unwrap();
    }

    let maintenance = p.controller.maintain_partitions(Utc::now()).await.unwrap();
    assert_eq!(maintenance.dropped.len(), OlapTable::ALL.len());

    let cutoff = today - Duration::days(7);
    for table in OlapTable::ALL {
        let dates = p.olap.list_partitions(table).await.unwrap();
        assert!(dates.iter().all(|d| *d >= cutoff), "{table:?} kept {dates:?}");
        assert!(dates.contains(&today));
        assert!(dates.contains(&(today + Duration::days(1))));
        assert!(dates.contains(&(today - Duration::days(3))));
    }

    p.h.controller.maintain_partitions(Utc::now()).await.unwrap();
    let task_dates = p.h.store.task_partitions().unwrap();
    assert!(task_dates.contains(&today));
    assert!(task_dates.contains(&(today + Duration::days(1))));
}
