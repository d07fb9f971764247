//! Consumer of the analytics queue and driver of status reconciliation.
//!
//! The controller ingests `created-task`, `created-dag` and
//! `create-monitoring-event` messages into the read model, then folds the
//! pending events on every tick. Each tenant's task statuses are folded
//! before its DAG statuses, one concurrent fold per hash partition, and the
//! tick repeats immediately while any partition came back saturated.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use kiln_core::observability::reconcile_span;
use kiln_core::TenantId;

use super::dedup::DedupingEventWriter;
use super::{OlapEventType, OlapRepository, OlapTable, PartitionMaintenance, TaskEvent};
use crate::config::FlowConfig;
use crate::error::{Error, MultiError, Result};
use crate::metrics::FlowMetrics;
use crate::msgqueue::buffer::{BufferOptions, MessageHandler, SubBuffer};
use crate::msgqueue::{MessageKind, MessageQueue, QueueType, decode_payloads};
use crate::recovery::{Alerter, TracingAlerter, recover_with_alert};
use crate::repository::{Repositories, TaskRepository, TenantRepository};
use crate::service::ServiceHandle;
use crate::task::{DagWithData, Task};
use crate::tasktypes::CreateMonitoringEventPayload;

/// Maintains the analytical read model.
pub struct OlapController {
    mq: Arc<dyn MessageQueue>,
    olap: Arc<dyn OlapRepository>,
    tasks: Arc<dyn TaskRepository>,
    tenants: Arc<dyn TenantRepository>,
    writer: DedupingEventWriter,
    alerter: Arc<dyn Alerter>,
    config: FlowConfig,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for OlapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlapController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OlapController {
    /// Creates a controller writing into `olap`.
    #[must_use]
    pub fn new(
        mq: Arc<dyn MessageQueue>,
        olap: Arc<dyn OlapRepository>,
        repos: &Repositories,
        config: FlowConfig,
    ) -> Self {
        Self {
            writer: DedupingEventWriter::new(olap.clone(), config.dedup_cache_capacity),
            mq,
            olap,
            tasks: repos.tasks.clone(),
            tenants: repos.tenants.clone(),
            alerter: Arc::new(TracingAlerter),
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Replaces the alerter notified about recovered panics.
    #[must_use]
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Returns the deduplicating event writer.
    #[must_use]
    pub const fn writer(&self) -> &DedupingEventWriter {
        &self.writer
    }

    /// Inserts the read-model rows of freshly created tasks.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the insert.
    pub async fn handle_created_tasks(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let tasks: Vec<Task> = decode_payloads(payloads);
        if tasks.is_empty() {
            return Ok(());
        }
        self.olap.create_tasks(tenant_id, &tasks).await
    }

    /// Inserts the read-model rows of freshly created DAGs.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the insert.
    pub async fn handle_created_dags(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let dags: Vec<DagWithData> = decode_payloads(payloads);
        if dags.is_empty() {
            return Ok(());
        }
        self.olap.create_dags(tenant_id, &dags).await
    }

    /// Converts monitoring events into task events and writes the new ones.
    ///
    /// Events of unknown type are reported after the valid ones were written;
    /// events of tasks that no longer exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns the write error, or the accumulated classification errors.
    pub async fn handle_monitoring_events(
        &self,
        tenant_id: TenantId,
        payloads: &[Vec<u8>],
    ) -> Result<()> {
        let monitoring: Vec<CreateMonitoringEventPayload> = decode_payloads(payloads);
        if monitoring.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<_> = monitoring.iter().map(|m| m.task_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let metas: HashMap<_, _> = self
            .tasks
            .list_task_metas(tenant_id, &ids)
            .await?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

        let mut errors = MultiError::new();
        let mut events = Vec::with_capacity(monitoring.len());
        for m in monitoring {
            let Some(event_type) = errors.absorb(m.event_type.parse::<OlapEventType>()) else {
                continue;
            };
            let Some(meta) = metas.get(&m.task_id) else {
                tracing::warn!(
                    task_id = m.task_id,
                    event_type = %event_type,
                    "monitoring event for unknown task"
                );
                continue;
            };
            let mut event = TaskEvent::new(
                tenant_id,
                m.task_id,
                meta.inserted_at,
                m.retry_count,
                event_type,
                m.event_timestamp,
            );
            event.worker_id = m.worker_id;
            event.payload = m.event_payload;
            event.message = m.event_message;
            events.push(event);
        }

        let written = self.writer.write(tenant_id, &events).await?;
        tracing::debug!(
            tenant_id = %tenant_id,
            received = events.len(),
            written,
            "wrote task events"
        );
        errors.into_result()
    }

    /// Folds one table across all hash partitions concurrently. Returns true
    /// if any partition hit the batch limit.
    async fn fold_partitions(
        &self,
        tenant_id: TenantId,
        table: OlapTable,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let limit = self.config.reconcile_batch_limit;
        let tenant = tenant_id.to_string();
        let folds = (0..self.olap.partition_count()).map(|partition| {
            let olap = self.olap.clone();
            async move {
                if table == OlapTable::Dags {
                    olap.update_dag_statuses(tenant_id, partition, limit, now).await
                } else {
                    olap.update_task_statuses(tenant_id, partition, limit, now).await
                }
            }
            .instrument(reconcile_span(&tenant, partition))
        });

        let mut errors = MultiError::new();
        let mut saturated = false;
        for result in futures::future::join_all(folds).await {
            if let Some(count) = errors.absorb(result) {
                let full = count >= limit;
                self.metrics.observe_reconcile_batch(table.name(), count, full);
                saturated |= full;
            }
        }
        errors.into_result()?;
        Ok(saturated)
    }

    /// Runs one reconciliation pass for a tenant: task statuses, then DAG
    /// statuses. Returns true if any partition was saturated.
    ///
    /// # Errors
    ///
    /// Returns the first failing fold; task statuses that were already
    /// folded stay committed.
    pub async fn reconcile_tenant(&self, tenant_id: TenantId) -> Result<bool> {
        let now = Utc::now();
        let tasks_saturated = self.fold_partitions(tenant_id, OlapTable::Tasks, now).await?;
        let dags_saturated = self.fold_partitions(tenant_id, OlapTable::Dags, now).await?;
        Ok(tasks_saturated || dags_saturated)
    }

    /// Reconciles every tenant, repeating a tenant's pass while it reports
    /// saturation and `cancel` has not fired.
    ///
    /// # Errors
    ///
    /// Returns the accumulated per-tenant errors.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> Result<()> {
        let tenants = self.tenants.list_tenants().await?;
        let mut errors = MultiError::new();
        for tenant in tenants {
            loop {
                match self.reconcile_tenant(tenant.id).await {
                    Ok(true) if !cancel.is_cancelled() => {
                        tracing::debug!(
                            tenant_id = %tenant.id,
                            "reconciliation saturated, running again"
                        );
                    }
                    Ok(_) => break,
                    Err(err) => {
                        errors.push(err);
                        break;
                    }
                }
            }
        }
        errors.into_result()
    }

    /// Creates upcoming partitions and drops expired ones.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the partition DDL.
    pub async fn maintain_partitions(&self, now: DateTime<Utc>) -> Result<PartitionMaintenance> {
        let maintenance = self.olap.update_table_partitions(now).await?;
        let changes = [(&maintenance.created, "created"), (&maintenance.dropped, "dropped")];
        for (names, action) in changes {
            for name in names {
                let table = OlapTable::ALL
                    .iter()
                    .find(|t| name.starts_with(t.name()))
                    .map_or("unknown", |t| t.name());
                self.metrics.record_partition(table, action);
                tracing::info!(partition = %name, action, "olap partition maintenance");
            }
        }
        Ok(maintenance)
    }

    /// Creates the current partitions, then starts the queue consumer, the
    /// reconciliation loop and the partition maintenance loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial partition maintenance or the queue
    /// subscription fails.
    pub async fn start(self: &Arc<Self>) -> Result<ServiceHandle> {
        self.maintain_partitions(Utc::now()).await?;

        let cancel = CancellationToken::new();
        let consumer = SubBuffer::new(
            QueueType::Olap,
            self.mq.clone(),
            self.clone(),
            BufferOptions {
                max_batch: self.config.buffer_max_batch,
                flush_interval: self.config.buffer_flush_interval,
            },
        )
        .start(cancel.clone())
        .await?;

        let this = self.clone();
        let token = cancel.clone();
        let reconcile = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.reconcile_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.reconcile_all(&token).await {
                            tracing::error!(error = %err, "status reconciliation failed");
                        }
                    }
                }
            }
        });

        let this = self.clone();
        let token = cancel.clone();
        let partitions = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.partition_maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.maintain_partitions(Utc::now()).await {
                            tracing::error!(error = %err, "olap partition maintenance failed");
                        }
                    }
                }
            }
        });

        tracing::info!("olap controller started");
        Ok(ServiceHandle::new(
            "olap-controller",
            cancel,
            vec![consumer, reconcile, partitions],
        ))
    }
}

#[async_trait]
impl MessageHandler for OlapController {
    #[tracing::instrument(
        skip(self, payloads),
        fields(tenant_id = %tenant_id, batch = payloads.len()),
    )]
    async fn handle(
        &self,
        tenant_id: TenantId,
        msg_id: &str,
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        let kind = msg_id.parse::<MessageKind>()?;
        let result = recover_with_alert(&self.alerter, msg_id, async {
            match kind {
                MessageKind::CreatedTask => self.handle_created_tasks(tenant_id, &payloads).await,
                MessageKind::CreatedDag => self.handle_created_dags(tenant_id, &payloads).await,
                MessageKind::CreateMonitoringEvent => {
                    self.handle_monitoring_events(tenant_id, &payloads).await
                }
                other => Err(Error::UnknownMessageKind {
                    kind: other.as_str().to_string(),
                }),
            }
        })
        .await;
        self.metrics.record_message(kind.as_str(), result.is_ok());
        result
    }
}
