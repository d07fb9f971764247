//! Handle to a set of background loops sharing one cancellation token.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the loops spawned by a `start()` call.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Wraps `handles`, all of which stop when `cancel` fires.
    #[must_use]
    pub const fn new(
        name: &'static str,
        cancel: CancellationToken,
        handles: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            name,
            cancel,
            handles,
        }
    }

    /// Returns a token that is cancelled when the service shuts down.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of running loops.
    #[must_use]
    pub fn loop_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancels every loop and waits for all of them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in futures::future::join_all(self.handles).await {
            if let Err(err) = result {
                tracing::error!(
                    service = self.name,
                    error = %err,
                    "background loop ended abnormally"
                );
            }
        }
        tracing::info!(service = self.name, "service stopped");
    }
}
