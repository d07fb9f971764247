//! Per-tenant coordination of periodic sweeps.
//!
//! An [`OperationPool`] runs one operation for any number of tenants, but
//! never two runs for the same tenant at once. A trigger that arrives while
//! a run is in flight is remembered and causes exactly one follow-up run.
//! An operation returning `Ok(true)` hit its batch limit and is re-run
//! immediately.
//!
//! Runs stop at their next await point once the pool's token is cancelled,
//! and [`OperationPool::shutdown`] waits for them to exit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use kiln_core::TenantId;

use crate::error::Result;

/// A tenant-scoped operation. Resolves to `true` when more work is pending.
pub type Operation = Arc<dyn Fn(TenantId) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Runs an [`Operation`] at most once concurrently per tenant.
#[derive(Clone)]
pub struct OperationPool {
    name: &'static str,
    timeout: Duration,
    operation: Operation,
    // Tenant -> whether another run was requested while one is in flight.
    in_flight: Arc<Mutex<HashMap<TenantId, bool>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for OperationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPool")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OperationPool {
    /// Creates a pool whose runs are abandoned after `timeout` or when
    /// `cancel` fires.
    #[must_use]
    pub fn new(
        name: &'static str,
        timeout: Duration,
        operation: Operation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            timeout,
            operation,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Returns true while a run for `tenant_id` is in flight.
    #[must_use]
    pub fn is_running(&self, tenant_id: TenantId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&tenant_id)
    }

    /// Starts a run for `tenant_id`, or asks the in-flight run to go again.
    /// Returns true if a new run was spawned. Nothing starts once the pool
    /// is cancelled.
    pub fn run_or_continue(&self, tenant_id: TenantId) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(again) = in_flight.get_mut(&tenant_id) {
                *again = true;
                return false;
            }
            in_flight.insert(tenant_id, false);
        }

        let pool = self.clone();
        self.tracker.spawn(async move { pool.run(tenant_id).await });
        true
    }

    /// Stops accepting runs and waits for the in-flight ones to exit.
    ///
    /// Runs only exit early if the pool's token was cancelled.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn run(self, tenant_id: TenantId) {
        loop {
            let attempt = tokio::time::timeout(self.timeout, (self.operation)(tenant_id));
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!(
                        operation = self.name,
                        tenant_id = %tenant_id,
                        "operation cancelled"
                    );
                    self.release(tenant_id);
                    return;
                }
                outcome = attempt => outcome,
            };
            let more = match outcome {
                Ok(Ok(more)) => more,
                Ok(Err(err)) => {
                    tracing::error!(
                        operation = self.name,
                        tenant_id = %tenant_id,
                        error = %err,
                        "operation failed"
                    );
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        operation = self.name,
                        tenant_id = %tenant_id,
                        timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        "operation timed out"
                    );
                    false
                }
            };
            if self.cancel.is_cancelled() {
                self.release(tenant_id);
                return;
            }
            if more {
                continue;
            }

            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get_mut(&tenant_id) {
                Some(again) if *again => *again = false,
                _ => {
                    in_flight.remove(&tenant_id);
                    return;
                }
            }
        }
    }

    fn release(&self, tenant_id: TenantId) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);
    }
}
