//! One manager per (tenant, concurrency strategy).
//!
//! Each manager runs two loops. The evaluation loop applies the strategy on
//! every tick, or immediately after a notification, and publishes the
//! committed decisions. The liveness loop refreshes the strategy's
//! `is_active` flag. Both loops share one cancellation token; [`cleanup`]
//! cancels it exactly once and waits for the loops to exit.
//!
//! [`cleanup`]: ConcurrencyManager::cleanup

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use kiln_core::observability::concurrency_span;
use kiln_core::TenantId;

use crate::config::FlowConfig;
use crate::metrics::{FlowMetrics, Stopwatch};
use crate::repository::{ConcurrencyRepository, ConcurrencyStrategy, RunConcurrencyResult};
use crate::task::StrategyId;

/// Decisions committed by one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyResults {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// The evaluated strategy.
    pub strategy_id: StrategyId,
    /// What changed.
    pub result: RunConcurrencyResult,
}

/// Everything an evaluation needs; cloned into each loop.
#[derive(Clone)]
struct Evaluator {
    tenant_id: TenantId,
    strategy: ConcurrencyStrategy,
    repo: Arc<dyn ConcurrencyRepository>,
    results: mpsc::Sender<ConcurrencyResults>,
    slow_threshold: Duration,
    metrics: FlowMetrics,
}

impl Evaluator {
    async fn evaluate(&self) {
        let watch = Stopwatch::start();
        let result = match self
            .repo
            .run_concurrency_strategy(self.tenant_id, &self.strategy)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(error = %err, "could not run concurrency strategy");
                return;
            }
        };
        let elapsed = watch.stop();

        let kind = self.strategy.kind.as_str();
        self.metrics.observe_concurrency_evaluation(kind, elapsed);
        self.metrics
            .record_concurrency_decisions(kind, "queued", result.queued.len());
        self.metrics
            .record_concurrency_decisions(kind, "cancelled", result.cancelled.len());
        if elapsed > self.slow_threshold {
            tracing::warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                queued = result.queued.len(),
                cancelled = result.cancelled.len(),
                "concurrency evaluation is slow"
            );
        }

        if result.is_empty() {
            return;
        }
        let results = ConcurrencyResults {
            tenant_id: self.tenant_id,
            strategy_id: self.strategy.id,
            result,
        };
        if self.results.send(results).await.is_err() {
            tracing::debug!("concurrency results channel closed");
        }
    }

    async fn refresh_liveness(&self) {
        let watch = Stopwatch::start();
        match self
            .repo
            .update_concurrency_strategy_is_active(self.tenant_id, &self.strategy)
            .await
        {
            Ok(is_active) => tracing::trace!(is_active, "refreshed strategy liveness"),
            Err(err) => tracing::error!(error = %err, "could not refresh strategy liveness"),
        }
        let elapsed = watch.stop();
        if elapsed > self.slow_threshold {
            tracing::warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "strategy liveness refresh is slow"
            );
        }
    }
}

/// Runs one concurrency strategy for one tenant.
pub struct ConcurrencyManager {
    strategy: ConcurrencyStrategy,
    notify_tx: mpsc::Sender<()>,
    notify_mu: Arc<Mutex<()>>,
    cancel: CancellationToken,
    handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("strategy_id", &self.strategy.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyManager {
    /// Spawns the evaluation and liveness loops.
    ///
    /// The loops stop when `parent` is cancelled or on [`cleanup`].
    ///
    /// [`cleanup`]: ConcurrencyManager::cleanup
    #[must_use]
    pub fn start(
        tenant_id: TenantId,
        strategy: ConcurrencyStrategy,
        repo: Arc<dyn ConcurrencyRepository>,
        results: mpsc::Sender<ConcurrencyResults>,
        config: &FlowConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let evaluator = Evaluator {
            tenant_id,
            strategy: strategy.clone(),
            repo,
            results,
            slow_threshold: config.slow_evaluation_threshold,
            metrics: FlowMetrics::new(),
        };
        let span = concurrency_span(strategy.id, &tenant_id.to_string());

        let evaluation = tokio::spawn(
            evaluation_loop(
                evaluator.clone(),
                notify_rx,
                config.concurrency_tick,
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        let liveness = tokio::spawn(
            liveness_loop(evaluator, config.liveness_tick, cancel.clone()).instrument(span),
        );

        Arc::new(Self {
            strategy,
            notify_tx,
            notify_mu: Arc::new(Mutex::new(())),
            cancel,
            handles: Mutex::new(Some(vec![evaluation, liveness])),
        })
    }

    /// Returns the managed strategy.
    #[must_use]
    pub const fn strategy(&self) -> &ConcurrencyStrategy {
        &self.strategy
    }

    /// Returns the tenant the strategy belongs to.
    #[must_use]
    pub const fn tenant_id(&self) -> TenantId {
        self.strategy.tenant_id
    }

    /// Returns true once the manager has been cleaned up or its parent
    /// token was cancelled.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests an evaluation without waiting for the next tick.
    ///
    /// Bursts coalesce: while one notification is in flight, further calls
    /// return immediately.
    pub fn notify(&self) {
        let Ok(guard) = self.notify_mu.clone().try_lock_owned() else {
            return;
        };
        let tx = self.notify_tx.clone();
        tokio::spawn(async move {
            let _guard = guard;
            // The receiver is gone once the manager stops.
            let _ = tx.send(()).await;
        });
    }

    /// Stops both loops and waits for them to exit. Safe to call more than
    /// once.
    pub async fn cleanup(&self) {
        let mut handles = self.handles.lock().await;
        let Some(running) = handles.take() else {
            return;
        };
        self.cancel.cancel();
        for result in futures::future::join_all(running).await {
            if let Err(err) = result {
                tracing::error!(
                    error = %err,
                    strategy_id = self.strategy.id,
                    "concurrency loop ended abnormally"
                );
            }
        }
    }
}

async fn evaluation_loop(
    evaluator: Evaluator,
    mut notify_rx: mpsc::Receiver<()>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            Some(()) = notify_rx.recv() => {}
        }
        evaluator.evaluate().await;
    }
    tracing::debug!("concurrency evaluation loop stopped");
}

async fn liveness_loop(evaluator: Evaluator, tick: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => evaluator.refresh_liveness().await,
        }
    }
    tracing::debug!("concurrency liveness loop stopped");
}
