//! Observability infrastructure for kiln.
//!
//! Initialization helpers and span constructors so that every controller,
//! concurrency manager and reconciliation worker logs with the same fields.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Parses a format name (`json` or `pretty`), falling back to pretty output.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `kiln_flow=debug`)
///
/// # Example
///
/// ```rust
/// use kiln_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A test harness may already own the global subscriber.
        let registry = tracing_subscriber::registry().with(env_filter);
        let _ = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
    });
}

/// Creates a span for task lifecycle controller operations.
///
/// # Example
///
/// ```rust
/// use kiln_core::observability::controller_span;
///
/// let span = controller_span("task-completed", "8d1c0f6e-6c5f-4d57-9d6b-4d1a2b3c4d5e");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn controller_span(operation: &str, tenant: &str) -> Span {
    tracing::info_span!("tasks_controller", op = operation, tenant = tenant)
}

/// Creates a span for a single concurrency strategy evaluation.
#[must_use]
pub fn concurrency_span(strategy_id: i64, tenant: &str) -> Span {
    tracing::info_span!(
        "concurrency_manager",
        strategy_id = strategy_id,
        tenant = tenant,
    )
}

/// Creates a span for status reconciliation of one hash partition.
#[must_use]
pub fn reconcile_span(tenant: &str, partition: usize) -> Span {
    tracing::debug_span!("olap_reconcile", tenant = tenant, partition = partition)
}
