//! Owns the concurrency managers of one scheduler partition.
//!
//! The supervisor keeps a map from strategy id to [`ConcurrencyManager`],
//! starting managers for newly active strategies and tearing down managers
//! whose strategy went idle. Every manager publishes into one shared result
//! channel which the supervisor drains:
//!
//! - cancelled tasks become `task-cancelled` messages for the task controller
//! - next strategy ids are notified so the deferred tasks are evaluated
//! - queued tasks become `notify-task-created` scheduler notifications
//!
//! The supervisor also consumes the partition's scheduler queue, waking the
//! managers named in `notify-task-created` and `notify-task-released`
//! payloads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use kiln_core::TenantId;

use super::manager::{ConcurrencyManager, ConcurrencyResults};
use crate::config::FlowConfig;
use crate::error::{Error, MultiError, Result};
use crate::metrics::FlowMetrics;
use crate::msgqueue::buffer::{BufferOptions, MessageHandler, SubBuffer};
use crate::msgqueue::{MessageKind, MessageQueue, QueueType, decode_payloads};
use crate::olap::OlapEventType;
use crate::repository::Repositories;
use crate::task::StrategyId;
use crate::tasktypes::{
    CancelledTaskPayload, NotifyQueuePayload, cancelled_task_message, notify_payloads,
    notify_task_created_message,
};

const RESULT_CHANNEL_CAPACITY: usize = 256;
const CANCELLED_BY_CONCURRENCY: &str = "cancelled by concurrency strategy";

/// Hosts the concurrency managers of one scheduler partition.
pub struct ConcurrencySupervisor {
    partition_id: String,
    mq: Arc<dyn MessageQueue>,
    repos: Repositories,
    config: FlowConfig,
    metrics: FlowMetrics,
    managers: Mutex<HashMap<StrategyId, Arc<ConcurrencyManager>>>,
    results_tx: mpsc::Sender<ConcurrencyResults>,
    results_rx: Mutex<Option<mpsc::Receiver<ConcurrencyResults>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConcurrencySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencySupervisor")
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

impl ConcurrencySupervisor {
    /// Creates a supervisor for the tenants assigned to `partition_id`.
    #[must_use]
    pub fn new(
        partition_id: impl Into<String>,
        mq: Arc<dyn MessageQueue>,
        repos: Repositories,
        config: FlowConfig,
    ) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        Arc::new(Self {
            partition_id: partition_id.into(),
            mq,
            repos,
            config,
            metrics: FlowMetrics::new(),
            managers: Mutex::new(HashMap::new()),
            results_tx,
            results_rx: Mutex::new(Some(results_rx)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Returns the ids of the strategies with a running manager, sorted.
    pub async fn strategy_ids(&self) -> Vec<StrategyId> {
        let mut ids: Vec<_> = self.managers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Starts managers for the tenant's active strategies and stops managers
    /// of strategies that are no longer active.
    ///
    /// # Errors
    ///
    /// Returns an error if the active strategies cannot be listed.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn sync_strategies(&self, tenant_id: TenantId) -> Result<()> {
        let active = self.repos.concurrency.list_active_strategies(tenant_id).await?;
        let active_ids: HashSet<StrategyId> = active.iter().map(|s| s.id).collect();

        let mut managers = self.managers.lock().await;
        let stale: Vec<StrategyId> = managers
            .iter()
            .filter(|(id, m)| m.tenant_id() == tenant_id && !active_ids.contains(id))
            .map(|(id, _)| *id)
            .collect();
        let mut stopped = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(manager) = managers.remove(&id) {
                stopped.push(manager);
            }
        }

        for strategy in active {
            if managers.contains_key(&strategy.id) {
                continue;
            }
            tracing::debug!(
                strategy_id = strategy.id,
                kind = strategy.kind.as_str(),
                "starting concurrency manager"
            );
            let id = strategy.id;
            let manager = ConcurrencyManager::start(
                tenant_id,
                strategy,
                self.repos.concurrency.clone(),
                self.results_tx.clone(),
                &self.config,
                &self.cancel,
            );
            managers.insert(id, manager);
        }
        drop(managers);

        for manager in stopped {
            tracing::debug!(
                strategy_id = manager.strategy().id,
                "stopping idle concurrency manager"
            );
            manager.cleanup().await;
        }
        Ok(())
    }

    /// Syncs every tenant assigned to this partition.
    ///
    /// # Errors
    ///
    /// Returns the accumulated per-tenant errors.
    pub async fn sync_all(&self) -> Result<()> {
        let tenants = self.repos.tenants.list_tenants().await?;
        let mut errors = MultiError::new();
        for tenant in tenants {
            if tenant.scheduler_partition_id.as_deref() != Some(self.partition_id.as_str()) {
                continue;
            }
            errors.absorb(self.sync_strategies(tenant.id).await);
        }
        errors.into_result()
    }

    /// Wakes the managers of `strategy_ids`, syncing the tenant first when one
    /// of them has no manager yet.
    pub async fn notify_strategies(&self, tenant_id: TenantId, strategy_ids: &[StrategyId]) {
        if strategy_ids.is_empty() {
            return;
        }
        let missing = {
            let managers = self.managers.lock().await;
            strategy_ids.iter().any(|id| !managers.contains_key(id))
        };
        if missing {
            if let Err(err) = self.sync_strategies(tenant_id).await {
                tracing::error!(
                    error = %err,
                    tenant_id = %tenant_id,
                    "could not sync concurrency strategies"
                );
            }
        }

        let managers = self.managers.lock().await;
        for id in strategy_ids {
            match managers.get(id) {
                Some(manager) => manager.notify(),
                None => tracing::debug!(strategy_id = id, "no manager for inactive strategy"),
            }
        }
    }

    /// Publishes the consequences of one evaluation.
    ///
    /// # Errors
    ///
    /// Returns the accumulated send failures; every consequence is attempted.
    pub async fn handle_results(&self, results: ConcurrencyResults) -> Result<()> {
        let ConcurrencyResults {
            tenant_id,
            strategy_id,
            result,
        } = results;
        let mut errors = MultiError::new();

        if !result.cancelled.is_empty() {
            let payloads: Vec<_> = result
                .cancelled
                .iter()
                .map(|t| {
                    CancelledTaskPayload::new(t.task.id, t.task.retry_count, true)
                        .with_event(OlapEventType::Cancelled, CANCELLED_BY_CONCURRENCY)
                })
                .collect();
            let sent = match cancelled_task_message(tenant_id, &payloads) {
                Ok(msg) => self.mq.send_message(&QueueType::TaskProcessing, msg).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                // The strategy already gave up the slots; these tasks stay queued
                // without one until they are evaluated again.
                let task_ids: Vec<_> = result.cancelled.iter().map(|t| t.task.id).collect();
                tracing::warn!(
                    tenant_id = %tenant_id,
                    strategy_id,
                    task_ids = ?task_ids,
                    error = %err,
                    "could not cancel tasks evicted by concurrency strategy"
                );
                self.metrics
                    .record_send_failures(MessageKind::TaskCancelled.as_str(), task_ids.len());
                errors.push(err);
            }
        }

        self.notify_strategies(tenant_id, &result.next_strategy_ids).await;

        if !result.queued.is_empty() {
            errors.absorb(self.notify_queued(tenant_id, &result.queued).await);
        }

        tracing::debug!(
            strategy_id,
            queued = result.queued.len(),
            cancelled = result.cancelled.len(),
            deferred_to = result.next_strategy_ids.len(),
            "handled concurrency results"
        );
        errors.into_result()
    }

    async fn notify_queued(
        &self,
        tenant_id: TenantId,
        queued: &[crate::repository::TaskWithQueue],
    ) -> Result<()> {
        let Some(tenant) = self.repos.tenants.get_tenant(tenant_id).await? else {
            return Err(Error::resource_not_found("tenant", tenant_id));
        };
        let Some(partition) = tenant.scheduler_partition_id else {
            return Ok(());
        };
        let payloads = notify_payloads(queued.iter().map(|t| (t.queue.as_str(), &[][..])));
        let msg = notify_task_created_message(tenant_id, &payloads)?;
        self.mq
            .send_message(&QueueType::SchedulerPartition(partition), msg)
            .await
    }

    /// Starts the scheduler-queue consumer, the result loop and the periodic
    /// strategy sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor was already started or the queue
    /// subscription fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut results_rx) = self.results_rx.lock().await.take() else {
            return Err(Error::configuration("concurrency supervisor already started"));
        };

        if let Err(err) = self.sync_all().await {
            tracing::error!(error = %err, "initial concurrency strategy sync failed");
        }

        let consumer = SubBuffer::new(
            QueueType::SchedulerPartition(self.partition_id.clone()),
            self.mq.clone(),
            self.clone(),
            BufferOptions {
                max_batch: self.config.buffer_max_batch,
                flush_interval: self.config.buffer_flush_interval,
            },
        )
        .start(self.cancel.clone())
        .await?;

        let this = self.clone();
        let results = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    received = results_rx.recv() => {
                        let Some(results) = received else { break };
                        if let Err(err) = this.handle_results(results).await {
                            tracing::error!(error = %err, "could not publish concurrency results");
                        }
                    }
                }
            }
        });

        let this = self.clone();
        let sync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.liveness_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately and the initial sync already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.sync_all().await {
                            tracing::error!(error = %err, "concurrency strategy sync failed");
                        }
                    }
                }
            }
        });

        self.handles.lock().await.extend([consumer, results, sync]);
        tracing::info!(partition_id = %self.partition_id, "concurrency supervisor started");
        Ok(())
    }

    /// Stops every manager and loop and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let managers: Vec<_> = self.managers.lock().await.drain().map(|(_, m)| m).collect();
        futures::future::join_all(managers.iter().map(|m| m.cleanup())).await;

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "concurrency supervisor task ended abnormally");
            }
        }
        tracing::info!(partition_id = %self.partition_id, "concurrency supervisor stopped");
    }
}

#[async_trait]
impl MessageHandler for ConcurrencySupervisor {
    async fn handle(
        &self,
        tenant_id: TenantId,
        msg_id: &str,
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        match msg_id.parse::<MessageKind>()? {
            MessageKind::NotifyTaskCreated | MessageKind::NotifyTaskReleased => {
                let mut ids: Vec<StrategyId> = decode_payloads::<NotifyQueuePayload>(&payloads)
                    .into_iter()
                    .flat_map(|p| p.strategy_ids)
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                self.notify_strategies(tenant_id, &ids).await;
                Ok(())
            }
            other => {
                tracing::debug!(kind = %other, "ignoring message on scheduler queue");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::msgqueue::memory::InMemoryMessageQueue;
    use crate::repository::{
        InMemoryRepository, RunConcurrencyResult, TaskRepository, TaskWithQueue, TriggerRepository,
        WorkflowNameTriggerOpts,
    };
    use crate::task::TaskIdRetryCount;
    use crate::workflow::{ConcurrencyStrategyKind, StepDefinition, WorkflowDefinition};

    const PARTITION: &str = "p1";

    struct Fixture {
        store: Arc<InMemoryRepository>,
        mq: Arc<InMemoryMessageQueue>,
        supervisor: Arc<ConcurrencySupervisor>,
        tenant: TenantId,
    }

    async fn fixture(kind: ConcurrencyStrategyKind) -> Fixture {
        let store = Arc::new(InMemoryRepository::new());
        let tenant = TenantId::generate();
        store.register_tenant(tenant, Some(PARTITION.into())).unwrap();
        store
            .register_workflow(
                tenant,
                WorkflowDefinition::new("limited")
                    .with_step(StepDefinition::new("s", "q").with_concurrency("input.k", 1, kind)),
            )
            .unwrap();
        store.update_table_partitions(Utc::now()).await.unwrap();

        let mq = Arc::new(InMemoryMessageQueue::new());
        let config = FlowConfig {
            concurrency_tick: Duration::from_millis(20),
            liveness_tick: Duration::from_millis(50),
            ..FlowConfig::default()
        };
        let supervisor =
            ConcurrencySupervisor::new(
                PARTITION,
                mq.clone(),
                Repositories::in_memory(&store),
                config,
            );
        Fixture {
            store,
            mq,
            supervisor,
            tenant,
        }
    }

    async fn trigger(f: &Fixture, count: usize) {
        let opts: Vec<_> = (0..count)
            .map(|_| WorkflowNameTriggerOpts {
                external_id: kiln_core::ExternalId::generate(),
                workflow_name: "limited".into(),
                data: json!({"k": "same"}),
                additional_metadata: Default::default(),
                parent_task_id: None,
                child_index: None,
                child_key: None,
            })
            .collect();
        f.store.trigger_from_workflow_names(f.tenant, &opts).await.unwrap();
    }

    #[tokio::test]
    async fn sync_starts_one_manager_per_active_strategy() {
        let f = fixture(ConcurrencyStrategyKind::GroupRoundRobin).await;
        f.supervisor.sync_all().await.unwrap();
        assert_eq!(f.supervisor.strategy_ids().await, vec![1]);

        // Syncing again does not duplicate managers.
        f.supervisor.sync_strategies(f.tenant).await.unwrap();
        assert_eq!(f.supervisor.strategy_ids().await.len(), 1);
        f.supervisor.shutdown().await;
        assert!(f.supervisor.strategy_ids().await.is_empty());
    }

    #[tokio::test]
    async fn cancelled_results_go_to_the_controller() {
        let f = fixture(ConcurrencyStrategyKind::CancelInProgress).await;
        let results = ConcurrencyResults {
            tenant_id: f.tenant,
            strategy_id: 1,
            result: RunConcurrencyResult {
                queued: vec![TaskWithQueue {
                    task: TaskIdRetryCount::new(2, 0),
                    queue: "q".into(),
                }],
                cancelled: vec![TaskWithQueue {
                    task: TaskIdRetryCount::new(1, 0),
                    queue: "q".into(),
                }],
                next_strategy_ids: Vec::new(),
            },
        };
        f.supervisor.handle_results(results).await.unwrap();

        let cancelled = f
            .mq
            .published_of_kind(&QueueType::TaskProcessing, MessageKind::TaskCancelled)
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        let payloads: Vec<CancelledTaskPayload> = cancelled[0].decode_payloads();
        assert_eq!(payloads[0].task_id, 1);
        assert!(payloads[0].should_notify);
        assert_eq!(payloads[0].event_message.as_deref(), Some(CANCELLED_BY_CONCURRENCY));

        let notified = f
            .mq
            .published_of_kind(
                &QueueType::SchedulerPartition(PARTITION.into()),
                MessageKind::NotifyTaskCreated,
            )
            .unwrap();
        assert_eq!(notified.len(), 1);
        let payloads: Vec<NotifyQueuePayload> = notified[0].decode_payloads();
        assert_eq!(payloads[0].queue, "q");
    }

    #[tokio::test]
    async fn running_supervisor_admits_triggered_tasks() {
        let f = fixture(ConcurrencyStrategyKind::CancelNewest).await;
        trigger(&f, 3).await;
        f.supervisor.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let cancelled = f
                    .mq
                    .published_of_kind(&QueueType::TaskProcessing, MessageKind::TaskCancelled)
                    .unwrap();
                if !cancelled.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.store.queue_items(f.tenant).unwrap().len(), 1);
        assert!(f.supervisor.start().await.is_err());
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_scheduler_message_kind_is_rejected() {
        let f = fixture(ConcurrencyStrategyKind::GroupRoundRobin).await;
        let err = f
            .supervisor
            .handle(f.tenant, "mystery", Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_classification());
    }
}
