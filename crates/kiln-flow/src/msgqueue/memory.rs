//! In-memory message queue for testing and single-process deployments.
//!
//! ## Limitations
//!
//! - **NOT durable**: messages are lost when the process exits
//! - **Single-process only**: subscribers must live in the same process
//!
//! Every published message is recorded per queue so tests can assert on
//! exactly what the core emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Message, MessageKind, MessageQueue, MessageReceiver, QueueType};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    published: Vec<Message>,
    pending: VecDeque<Message>,
    subscribers: Vec<mpsc::UnboundedSender<Message>>,
    next_subscriber: usize,
    expired: usize,
}

impl QueueState {
    /// Hands a message to the next live subscriber, round robin.
    fn deliver(&mut self, msg: Message) -> Option<Message> {
        self.subscribers.retain(|tx| !tx.is_closed());

        let mut msg = msg;
        for _ in 0..self.subscribers.len() {
            let idx = self.next_subscriber % self.subscribers.len();
            self.next_subscriber = self.next_subscriber.wrapping_add(1);

            match self.subscribers[idx].send(msg) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(returned)) => msg = returned,
            }
        }
        Some(msg)
    }
}

/// In-memory message queue.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    queues: RwLock<HashMap<String, QueueState>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("message queue lock poisoned")
}

impl InMemoryMessageQueue {
    /// Creates an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message published to `queue`, in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self, queue: &QueueType) -> Result<Vec<Message>> {
        let published = {
            let queues = self.queues.read().map_err(poison_err)?;
            queues
                .get(&queue.name())
                .map(|q| q.published.clone())
                .unwrap_or_default()
        };
        Ok(published)
    }

    /// Returns the messages of one kind published to `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published_of_kind(&self, queue: &QueueType, kind: MessageKind) -> Result<Vec<Message>> {
        Ok(self
            .published(queue)?
            .into_iter()
            .filter(|m| m.id == kind.as_str())
            .collect())
    }

    /// Returns the names of all queues that received at least one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn queue_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = {
            let queues = self.queues.read().map_err(poison_err)?;
            queues
                .iter()
                .filter(|(_, q)| !q.published.is_empty())
                .map(|(name, _)| name.clone())
                .collect()
        };
        names.sort();
        Ok(names)
    }

    /// Returns how many messages were dropped because they expired without a consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn expired_count(&self, queue: &QueueType) -> Result<usize> {
        let count = {
            let queues = self.queues.read().map_err(poison_err)?;
            queues.get(&queue.name()).map_or(0, |q| q.expired)
        };
        Ok(count)
    }

    /// Forgets every recorded message without touching subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn clear_published(&self) -> Result<()> {
        let mut queues = self.queues.write().map_err(poison_err)?;
        for state in queues.values_mut() {
            state.published.clear();
        }
        drop(queues);
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn send_message(&self, queue: &QueueType, msg: Message) -> Result<()> {
        let mut queues = self.queues.write().map_err(poison_err)?;
        let state = queues.entry(queue.name()).or_default();

        state.published.push(msg.clone());

        if let Some(undelivered) = state.deliver(msg) {
            if undelivered.immediately_expire {
                state.expired += 1;
                tracing::debug!(
                    queue = %queue,
                    kind = %undelivered.id,
                    "message expired without consumer"
                );
            } else {
                state.pending.push_back(undelivered);
            }
        }
        drop(queues);

        Ok(())
    }

    async fn subscribe(&self, queue: &QueueType) -> Result<MessageReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut queues = self.queues.write().map_err(poison_err)?;
        let state = queues.entry(queue.name()).or_default();

        while let Some(msg) = state.pending.pop_front() {
            if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                state.pending.push_front(msg);
                break;
            }
        }
        state.subscribers.push(tx);
        drop(queues);

        Ok(rx)
    }
}
