//! In-memory persistence for tests and local development.
//!
//! Every trait operation takes the single state lock for its whole duration,
//! which gives it the all-or-nothing behavior of a transaction. The
//! per-strategy advisory lock is an async mutex acquired with a bounded wait.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process coordination
//! - **Single-process only**: advisory locks only serialize callers sharing this instance

mod concurrency;
mod tasks;
mod triggers;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::sync::OwnedMutexGuard;

use kiln_core::{DagExternalId, DispatcherId, ExternalId, TenantId, WorkerId};

use super::{ConcurrencyStrategy, Tenant, TenantRepository, WorkerRepository};
use crate::config::FlowConfig;
use crate::error::{Error, Result};
use crate::events::TaskOutcome;
use crate::task::{DagId, DagWithData, StrategyId, Task, TaskId, TaskIdRetryCount};
use crate::workflow::WorkflowDefinition;

/// Name reported when a task write has no partition.
const TASK_TABLE: &str = "v1_task";

/// An admitted attempt waiting in its queue for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// The queue.
    pub queue: String,
}

/// An attempt's membership in one concurrency strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencySlot {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The strategy.
    pub strategy_id: StrategyId,
    /// The attempt.
    pub task: TaskIdRetryCount,
    /// Evaluated concurrency key.
    pub key: String,
    /// Insertion order; lower is older.
    pub sort_id: i64,
    /// Whether the slot holds capacity.
    pub is_filled: bool,
    /// The task's queue.
    pub queue: String,
    /// Strategies the attempt still has to pass after this one.
    pub next_strategy_ids: Vec<StrategyId>,
}

#[derive(Debug, Clone)]
struct WorkerRecord {
    tenant_id: TenantId,
    dispatcher_id: DispatcherId,
    is_active: bool,
}

#[derive(Debug, Clone)]
struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    /// Strategy ids per step readable id, in evaluation order.
    strategies: HashMap<String, Vec<StrategyId>>,
}

/// A DAG child step waiting for its parents.
#[derive(Debug, Clone)]
struct MatchCondition {
    tenant_id: TenantId,
    dag_id: DagId,
    step_readable_id: String,
    parents: Vec<String>,
    outcomes: BTreeMap<String, (TaskOutcome, serde_json::Value)>,
}

impl MatchCondition {
    fn is_satisfied(&self) -> bool {
        self.parents.iter().all(|p| self.outcomes.contains_key(p))
    }
}

#[derive(Debug, Clone)]
struct DagRecord {
    dag: DagWithData,
    workflow_name: String,
}

#[derive(Debug, Default)]
struct State {
    tenants: BTreeMap<TenantId, Tenant>,
    workers: HashMap<WorkerId, WorkerRecord>,
    workflows: HashMap<TenantId, BTreeMap<String, RegisteredWorkflow>>,
    strategies: BTreeMap<StrategyId, ConcurrencyStrategy>,
    tasks: BTreeMap<TaskId, Task>,
    tasks_by_external_id: HashMap<ExternalId, TaskId>,
    dags: BTreeMap<DagId, DagRecord>,
    dags_by_external_id: HashMap<DagExternalId, DagId>,
    queue_items: BTreeMap<TaskId, QueueItem>,
    slots: BTreeMap<(StrategyId, TaskId), ConcurrencySlot>,
    matches: Vec<MatchCondition>,
    children: HashSet<(TaskId, i64, Option<String>)>,
    partitions: BTreeSet<NaiveDate>,
    next_task_id: TaskId,
    next_dag_id: DagId,
    next_strategy_id: StrategyId,
    next_sort_id: i64,
}

impl State {
    fn require_partition(&self, at: DateTime<Utc>) -> Result<()> {
        let date = at.date_naive();
        if self.partitions.contains(&date) {
            Ok(())
        } else {
            Err(Error::PartitionMissing {
                table: TASK_TABLE.to_string(),
                date,
            })
        }
    }

    fn workflow(&self, tenant_id: TenantId, name: &str) -> Option<&RegisteredWorkflow> {
        self.workflows.get(&tenant_id).and_then(|w| w.get(name))
    }

    fn tenant_task(&self, tenant_id: TenantId, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).filter(|t| t.tenant_id == tenant_id)
    }

    fn tenant_task_mut(&mut self, tenant_id: TenantId, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).filter(|t| t.tenant_id == tenant_id)
    }

    /// Puts a queued attempt into its first strategy, or straight into its
    /// queue when the step has no concurrency limits.
    fn enqueue(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        let attempt = task.attempt();
        let tenant_id = task.tenant_id;
        let queue = task.queue.clone();
        match task.concurrency_strategy_ids.first().copied() {
            Some(first) => {
                let key = task.concurrency_keys.first().cloned().unwrap_or_default();
                let next = task.concurrency_strategy_ids[1..].to_vec();
                self.insert_slot(tenant_id, first, attempt, key, queue, next);
            }
            None => {
                self.queue_items.insert(
                    task_id,
                    QueueItem {
                        tenant_id,
                        task: attempt,
                        queue,
                    },
                );
            }
        }
    }

    fn insert_slot(
        &mut self,
        tenant_id: TenantId,
        strategy_id: StrategyId,
        task: TaskIdRetryCount,
        key: String,
        queue: String,
        next_strategy_ids: Vec<StrategyId>,
    ) {
        self.next_sort_id += 1;
        if let Some(strategy) = self.strategies.get_mut(&strategy_id) {
            strategy.is_active = true;
        }
        self.slots.insert(
            (strategy_id, task.id),
            ConcurrencySlot {
                tenant_id,
                strategy_id,
                task,
                key,
                sort_id: self.next_sort_id,
                is_filled: false,
                queue,
                next_strategy_ids,
            },
        );
    }

    /// Drops every slot and queue item of a task. Returns the strategies the
    /// task held slots in.
    fn release(&mut self, task_id: TaskId) -> Vec<StrategyId> {
        let held: Vec<(StrategyId, TaskId)> = self
            .slots
            .keys()
            .filter(|(_, id)| *id == task_id)
            .copied()
            .collect();
        for key in &held {
            self.slots.remove(key);
        }
        self.queue_items.remove(&task_id);
        held.into_iter().map(|(strategy_id, _)| strategy_id).collect()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory implementation of every core repository.
#[derive(Debug)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    advisory_locks: Mutex<HashMap<StrategyId, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
    internal_retries: i32,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    /// Creates an empty store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&FlowConfig::default())
    }

    /// Creates an empty store using the lock timeout and internal retry
    /// budget from `config`.
    #[must_use]
    pub fn with_config(config: &FlowConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            advisory_locks: Mutex::new(HashMap::new()),
            lock_timeout: config.lock_timeout,
            internal_retries: config.internal_retries,
        }
    }

    /// Registers a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register_tenant(
        &self,
        tenant_id: TenantId,
        scheduler_partition_id: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.tenants.insert(
            tenant_id,
            Tenant {
                id: tenant_id,
                scheduler_partition_id,
            },
        );
        drop(state);
        Ok(())
    }

    /// Registers an active worker connected through `dispatcher_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register_worker(
        &self,
        tenant_id: TenantId,
        worker_id: WorkerId,
        dispatcher_id: DispatcherId,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.workers.insert(
            worker_id,
            WorkerRecord {
                tenant_id,
                dispatcher_id,
                is_active: true,
            },
        );
        drop(state);
        Ok(())
    }

    /// Marks a worker active or inactive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] for unknown workers.
    pub fn set_worker_active(&self, worker_id: WorkerId, is_active: bool) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            drop(state);
            return Err(Error::resource_not_found("worker", worker_id));
        };
        worker.is_active = is_active;
        drop(state);
        Ok(())
    }

    /// Registers a workflow, creating one concurrency strategy per declared
    /// step limit. Returns the created strategies.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is malformed or the lock is poisoned.
    pub fn register_workflow(
        &self,
        tenant_id: TenantId,
        definition: WorkflowDefinition,
    ) -> Result<Vec<ConcurrencyStrategy>> {
        definition.validate()?;

        let mut state = self.state.write().map_err(poison_err)?;
        let mut created = Vec::new();
        let mut strategies = HashMap::new();
        for step in &definition.steps {
            let mut ids = Vec::with_capacity(step.concurrency.len());
            for limit in &step.concurrency {
                state.next_strategy_id += 1;
                let strategy = ConcurrencyStrategy {
                    id: state.next_strategy_id,
                    tenant_id,
                    workflow_id: definition.id,
                    step_id: step.id,
                    kind: limit.strategy,
                    expression: limit.expression.clone(),
                    max_concurrency: limit.max_concurrency,
                    is_active: true,
                };
                ids.push(strategy.id);
                state.strategies.insert(strategy.id, strategy.clone());
                created.push(strategy);
            }
            strategies.insert(step.readable_id.clone(), ids);
        }
        state.workflows.entry(tenant_id).or_default().insert(
            definition.name.clone(),
            RegisteredWorkflow {
                definition,
                strategies,
            },
        );
        drop(state);
        Ok(created)
    }

    /// Returns the admitted attempts waiting in the tenant's queues.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn queue_items(&self, tenant_id: TenantId) -> Result<Vec<QueueItem>> {
        let items = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .queue_items
                .values()
                .filter(|item| item.tenant_id == tenant_id)
                .cloned()
                .collect()
        };
        Ok(items)
    }

    /// Returns the slots of one strategy, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn slots(&self, strategy_id: StrategyId) -> Result<Vec<ConcurrencySlot>> {
        let mut slots: Vec<ConcurrencySlot> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .slots
                .values()
                .filter(|slot| slot.strategy_id == strategy_id)
                .cloned()
                .collect()
        };
        slots.sort_by_key(|slot| slot.sort_id);
        Ok(slots)
    }

    /// Returns the dates covered by task partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_partitions(&self) -> Result<Vec<NaiveDate>> {
        let dates = {
            let state = self.state.read().map_err(poison_err)?;
            state.partitions.iter().copied().collect()
        };
        Ok(dates)
    }

    /// Reads a DAG by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dag(&self, dag_id: DagId) -> Result<Option<DagWithData>> {
        let dag = {
            let state = self.state.read().map_err(poison_err)?;
            state.dags.get(&dag_id).map(|record| record.dag.clone())
        };
        Ok(dag)
    }

    /// Lists every task of a DAG, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dag_tasks(&self, dag_id: DagId) -> Result<Vec<Task>> {
        let tasks = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| t.dag_id == Some(dag_id))
                .cloned()
                .collect()
        };
        Ok(tasks)
    }

    /// Acquires the advisory lock of a strategy, waiting at most the
    /// configured lock timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock is held for too long.
    pub async fn lock_strategy(&self, strategy_id: StrategyId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.advisory_locks.lock().map_err(poison_err)?;
            locks
                .entry(strategy_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| Error::LockTimeout {
                strategy_id,
                timeout: self.lock_timeout,
            })
    }

    fn create_partitions(&self, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
        let mut state = self.state.write().map_err(poison_err)?;
        state.partitions.insert(today);
        state.partitions.insert(tomorrow);
        drop(state);
        Ok(())
    }
}

#[async_trait]
impl TenantRepository for InMemoryRepository {
    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = {
            let state = self.state.read().map_err(poison_err)?;
            state.tenants.values().cloned().collect()
        };
        Ok(tenants)
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>> {
        let tenant = {
            let state = self.state.read().map_err(poison_err)?;
            state.tenants.get(&tenant_id).cloned()
        };
        Ok(tenant)
    }
}

#[async_trait]
impl WorkerRepository for InMemoryRepository {
    async fn get_dispatcher_ids_for_workers(
        &self,
        tenant_id: TenantId,
        worker_ids: &[WorkerId],
    ) -> Result<HashMap<WorkerId, DispatcherId>> {
        let routes = {
            let state = self.state.read().map_err(poison_err)?;
            worker_ids
                .iter()
                .filter_map(|id| {
                    state
                        .workers
                        .get(id)
                        .filter(|w| w.tenant_id == tenant_id)
                        .map(|w| (*id, w.dispatcher_id))
                })
                .collect()
        };
        Ok(routes)
    }
}
