//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired harness and factory functions with sensible defaults.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use kiln_core::{DispatcherId, TenantId, WorkerId};
use kiln_flow::config::FlowConfig;
use kiln_flow::controller::TasksController;
use kiln_flow::msgqueue::memory::InMemoryMessageQueue;
use kiln_flow::msgqueue::{MessageKind, MessageQueue, QueueType};
use kiln_flow::repository::{ConcurrencyStrategy, InMemoryRepository, Repositories, TaskRepository};
use kiln_flow::task::{Task, TaskIdRetryCount};
use kiln_flow::tasktypes::TriggerTaskPayload;
use kiln_flow::workflow::{ConcurrencyStrategyKind, StepDefinition, WorkflowDefinition};

use crate::queue::FaultyMessageQueue;

/// Scheduler partition every harness tenant is assigned to.
pub const TEST_PARTITION: &str = "test-partition";

/// Queue used by factory workflows.
pub const TEST_QUEUE: &str = "default";

/// Encodes payloads the way the bus carries them.
pub fn encode<T: Serialize>(payloads: &[T]) -> Vec<Vec<u8>> {
    payloads
        .iter()
        .map(|p| serde_json::to_vec(p).expect("payload serializes"))
        .collect()
}

/// An in-memory store, bus and tasks controller for one tenant.
pub struct FlowHarness {
    /// Shared store behind every repository.
    pub store: Arc<InMemoryRepository>,
    /// Recording message bus.
    pub mq: Arc<InMemoryMessageQueue>,
    /// Repositories over `store`.
    pub repos: Repositories,
    /// Controller under test.
    pub controller: Arc<TasksController>,
    /// Configuration used by the store and the controller.
    pub config: FlowConfig,
    /// Tenant, assigned to [`TEST_PARTITION`].
    pub tenant_id: TenantId,
}

impl FlowHarness {
    /// Creates a harness with the default configuration.
    pub async fn new() -> Self {
        Self::with_config(FlowConfig::default()).await
    }

    /// Creates a harness with a specific configuration.
    pub async fn with_config(config: FlowConfig) -> Self {
        let mq = Arc::new(InMemoryMessageQueue::new());
        Self::build(config, mq.clone(), mq).await
    }

    /// Creates a harness whose controller publishes through a
    /// [`FaultyMessageQueue`]. Accepted sends are still recorded in `mq`.
    pub async fn with_faulty_queue() -> (Self, Arc<FaultyMessageQueue>) {
        let mq = Arc::new(InMemoryMessageQueue::new());
        let faulty = Arc::new(FaultyMessageQueue::new(mq.clone()));
        let harness = Self::build(FlowConfig::default(), mq, faulty.clone()).await;
        (harness, faulty)
    }

    async fn build(
        config: FlowConfig,
        mq: Arc<InMemoryMessageQueue>,
        publisher: Arc<dyn MessageQueue>,
    ) -> Self {
        let store = Arc::new(InMemoryRepository::with_config(&config));
        let tenant_id = TenantId::generate();
        store
            .register_tenant(tenant_id, Some(TEST_PARTITION.to_string()))
            .expect("register tenant");
        store
            .update_table_partitions(Utc::now())
            .await
            .expect("create partitions");

        let repos = Repositories::in_memory(&store);
        let controller = Arc::new(TasksController::new(publisher, repos.clone(), config.clone()));
        Self {
            store,
            mq,
            repos,
            controller,
            config,
            tenant_id,
        }
    }

    /// Registers a workflow for the harness tenant.
    pub fn register(&self, definition: WorkflowDefinition) -> Vec<ConcurrencyStrategy> {
        self.store
            .register_workflow(self.tenant_id, definition)
            .expect("register workflow")
    }

    /// Registers an active worker behind a fresh dispatcher.
    pub fn register_worker(&self) -> (WorkerId, DispatcherId) {
        let worker = WorkerId::generate();
        let dispatcher = DispatcherId::generate();
        self.store
            .register_worker(self.tenant_id, worker, dispatcher)
            .expect("register worker");
        (worker, dispatcher)
    }

    /// Triggers `workflow` through the controller and returns the tasks it
    /// announced.
    pub async fn trigger(&self, workflow: &str, input: serde_json::Value) -> Vec<Task> {
        let before = self.created_tasks().len();
        self.controller
            .handle_trigger(
                self.tenant_id,
                &encode(&[TriggerTaskPayload::new(workflow, input)]),
            )
            .await
            .expect("trigger workflow");
        self.created_tasks().split_off(before)
    }

    /// Moves an attempt onto `worker`, as the scheduler would.
    pub async fn assign(&self, attempt: TaskIdRetryCount, worker: WorkerId) {
        let assigned = self
            .store
            .assign_tasks(self.tenant_id, &[(attempt, worker)], Utc::now())
            .await
            .expect("assign task");
        assert_eq!(assigned, vec![attempt], "attempt was not assignable");
    }

    /// Reads the current row of a task.
    pub async fn task(&self, task_id: i64) -> Task {
        self.store
            .read_task(self.tenant_id, task_id)
            .await
            .expect("read task")
            .expect("task exists")
    }

    /// Every task announced to the read model so far.
    pub fn created_tasks(&self) -> Vec<Task> {
        self.mq
            .published_of_kind(&QueueType::Olap, MessageKind::CreatedTask)
            .expect("published")
            .iter()
            .flat_map(kiln_flow::msgqueue::Message::decode_payloads::<Task>)
            .collect()
    }

    /// The harness tenant's scheduler queue.
    pub fn scheduler_queue() -> QueueType {
        QueueType::SchedulerPartition(TEST_PARTITION.to_string())
    }
}

/// Factory for workflow definitions.
pub struct WorkflowFactory;

impl WorkflowFactory {
    /// One step named `step` on [`TEST_QUEUE`], no retries.
    #[must_use]
    pub fn single_step(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name).with_step(StepDefinition::new("step", TEST_QUEUE))
    }

    /// One step allowing `retries` application-error retries.
    #[must_use]
    pub fn with_retries(name: &str, retries: i32) -> WorkflowDefinition {
        WorkflowDefinition::new(name)
            .with_step(StepDefinition::new("step", TEST_QUEUE).with_retries(retries))
    }

    /// One step limited by `input.group` under `kind`.
    #[must_use]
    pub fn concurrency(name: &str, kind: ConcurrencyStrategyKind, max: i32) -> WorkflowDefinition {
        WorkflowDefinition::new(name).with_step(
            StepDefinition::new("step", TEST_QUEUE).with_concurrency("input.group", max, kind),
        )
    }

    /// Two steps, `second` depending on `first`.
    #[must_use]
    pub fn chain(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name)
            .with_step(StepDefinition::new("first", TEST_QUEUE))
            .with_step(StepDefinition::new("second", TEST_QUEUE).with_parent("first"))
    }

    /// One step timing out after `step_timeout_secs` of running.
    #[must_use]
    pub fn with_step_timeout(name: &str, step_timeout_secs: i64) -> WorkflowDefinition {
        WorkflowDefinition::new(name).with_step(
            StepDefinition::new("step", TEST_QUEUE).with_timeouts(300, step_timeout_secs),
        )
    }
}
