//! Message bus wrapper with failure injection.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kiln_flow::error::{Error, Result};
use kiln_flow::msgqueue::memory::InMemoryMessageQueue;
use kiln_flow::msgqueue::{Message, MessageQueue, MessageReceiver, QueueType};

/// Forwards to an [`InMemoryMessageQueue`] unless the target queue name
/// starts with an injected prefix, in which case the send fails with a
/// transport error and nothing is recorded.
#[derive(Debug)]
pub struct FaultyMessageQueue {
    inner: Arc<InMemoryMessageQueue>,
    fail_prefixes: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
}

impl FaultyMessageQueue {
    /// Wraps `inner`.
    pub fn new(inner: Arc<InMemoryMessageQueue>) -> Self {
        Self {
            inner,
            fail_prefixes: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
        }
    }

    /// Fails every send to a queue whose name starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().expect("lock").push(prefix.into());
    }

    /// Fails every send to `queue`.
    pub fn fail_queue(&self, queue: &QueueType) {
        self.inject_failure(queue.name());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().expect("lock").clear();
    }

    /// Names of the queues whose sends were rejected, in order.
    pub fn rejected(&self) -> Vec<String> {
        self.rejected.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MessageQueue for FaultyMessageQueue {
    async fn send_message(&self, queue: &QueueType, msg: Message) -> Result<()> {
        let name = queue.name();
        let fail = self
            .fail_prefixes
            .lock()
            .expect("lock")
            .iter()
            .any(|p| name.starts_with(p.as_str()));
        if fail {
            self.rejected.lock().expect("lock").push(name.clone());
            return Err(Error::transport(format!("injected failure for queue: {name}")));
        }
        self.inner.send_message(queue, msg).await
    }

    async fn subscribe(&self, queue: &QueueType) -> Result<MessageReceiver> {
        self.inner.subscribe(queue).await
    }
}
