//! Batching consumer for a queue subscription.
//!
//! [`SubBuffer`] groups received messages by `(tenant, kind)` and hands each
//! group to a [`MessageHandler`] as one batch of payloads, either when the
//! group reaches the configured size or when the flush interval elapses.
//!
//! A failed batch is negatively acknowledged by republishing each of its
//! messages with one retry less; messages with an exhausted budget are
//! dropped and logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use kiln_core::TenantId;

use super::{Message, MessageQueue, QueueType};
use crate::error::Result;

/// Handles one batch of same-kind payloads for one tenant.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a batch.
    ///
    /// # Errors
    ///
    /// Returning an error causes every message of the batch to be redelivered
    /// while its retry budget lasts.
    async fn handle(&self, tenant_id: TenantId, msg_id: &str, payloads: Vec<Vec<u8>>)
    -> Result<()>;
}

/// Batching options for a [`SubBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Largest batch handed to the handler.
    pub max_batch: usize,
    /// How long a partial batch may wait.
    pub flush_interval: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_batch: 100,
            flush_interval: Duration::from_millis(10),
        }
    }
}

type BatchKey = (TenantId, String);

/// A batching consumer bound to one queue.
pub struct SubBuffer {
    queue: QueueType,
    mq: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    options: BufferOptions,
}

impl std::fmt::Debug for SubBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubBuffer")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SubBuffer {
    /// Creates a consumer for `queue`.
    #[must_use]
    pub fn new(
        queue: QueueType,
        mq: Arc<dyn MessageQueue>,
        handler: Arc<dyn MessageHandler>,
        options: BufferOptions,
    ) -> Self {
        Self {
            queue,
            mq,
            handler,
            options,
        }
    }

    /// Subscribes and starts consuming until `cancel` fires.
    ///
    /// Batches still buffered at cancellation are flushed before the task exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be created.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut rx = self.mq.subscribe(&self.queue).await?;

        Ok(tokio::spawn(async move {
            let mut buffers: HashMap<BatchKey, Vec<Message>> = HashMap::new();
            let mut ticker = tokio::time::interval(self.options.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => {
                        let Some(msg) = received else { break };
                        let key = (msg.tenant_id, msg.id.clone());
                        let batch = buffers.entry(key.clone()).or_default();
                        batch.push(msg);

                        if batch.len() >= self.options.max_batch {
                            if let Some(full) = buffers.remove(&key) {
                                self.flush(key, full).await;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush_all(&mut buffers).await;
                    }
                }
            }

            self.flush_all(&mut buffers).await;
            tracing::debug!(queue = %self.queue, "message buffer stopped");
        }))
    }

    async fn flush_all(&self, buffers: &mut HashMap<BatchKey, Vec<Message>>) {
        if buffers.is_empty() {
            return;
        }
        let batches: Vec<_> = buffers.drain().collect();
        join_all(batches.into_iter().map(|(key, msgs)| self.flush(key, msgs))).await;
    }

    async fn flush(&self, (tenant_id, msg_id): BatchKey, msgs: Vec<Message>) {
        let payloads: Vec<Vec<u8>> = msgs
            .iter()
            .flat_map(|m| m.payloads.iter().cloned())
            .collect();

        let Err(err) = self.handler.handle(tenant_id, &msg_id, payloads).await else {
            return;
        };

        tracing::error!(
            queue = %self.queue,
            tenant_id = %tenant_id,
            kind = %msg_id,
            error = %err,
            "could not handle message batch"
        );

        for msg in msgs {
            self.nack(msg).await;
        }
    }

    async fn nack(&self, msg: Message) {
        if msg.retries == 0 {
            tracing::error!(
                queue = %self.queue,
                tenant_id = %msg.tenant_id,
                kind = %msg.id,
                "message exhausted its retries, dropping"
            );
            return;
        }

        let retries = msg.retries - 1;
        if let Err(err) = self.mq.send_message(&self.queue, msg.with_retries(retries)).await {
            tracing::error!(queue = %self.queue, error = %err, "could not requeue message");
        }
    }
}
