//! Runtime configuration for the controller, concurrency managers and the
//! status reconciliation pipeline.
//!
//! Every interval and limit has a default and can be overridden from the
//! process environment with a `KILN_` prefixed variable. Values must be
//! positive integers.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_TIMEOUT_SWEEP_MS: &str = "KILN_TIMEOUT_SWEEP_INTERVAL_MS";
const ENV_REASSIGN_SWEEP_MS: &str = "KILN_REASSIGN_SWEEP_INTERVAL_MS";
const ENV_PARTITION_MAINTENANCE_SECS: &str = "KILN_PARTITION_MAINTENANCE_INTERVAL_SECS";
const ENV_CONCURRENCY_TICK_MS: &str = "KILN_CONCURRENCY_TICK_MS";
const ENV_LIVENESS_TICK_MS: &str = "KILN_CONCURRENCY_LIVENESS_TICK_MS";
const ENV_SLOW_EVALUATION_MS: &str = "KILN_CONCURRENCY_SLOW_EVALUATION_MS";
const ENV_RECONCILE_TICK_MS: &str = "KILN_RECONCILE_TICK_MS";
const ENV_RECONCILE_PARTITIONS: &str = "KILN_RECONCILE_PARTITIONS";
const ENV_RECONCILE_BATCH_LIMIT: &str = "KILN_RECONCILE_BATCH_LIMIT";
const ENV_DEDUP_CACHE_CAPACITY: &str = "KILN_EVENT_DEDUP_CACHE_CAPACITY";
const ENV_RETENTION_DAYS: &str = "KILN_RETENTION_DAYS";
const ENV_LOCK_TIMEOUT_MS: &str = "KILN_LOCK_TIMEOUT_MS";
const ENV_MESSAGE_RETRIES: &str = "KILN_MESSAGE_RETRIES";
const ENV_INTERNAL_RETRIES: &str = "KILN_INTERNAL_RETRIES";
const ENV_BUFFER_MAX_BATCH: &str = "KILN_BUFFER_MAX_BATCH";
const ENV_BUFFER_FLUSH_MS: &str = "KILN_BUFFER_FLUSH_INTERVAL_MS";
const ENV_SWEEP_BATCH_LIMIT: &str = "KILN_SWEEP_BATCH_LIMIT";
const ENV_OPERATION_TIMEOUT_MS: &str = "KILN_OPERATION_TIMEOUT_MS";

/// Configuration shared by all long-running kiln services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// How often the per-tenant timeout sweep runs.
    pub timeout_sweep_interval: Duration,
    /// How often the per-tenant reassignment sweep runs.
    pub reassign_sweep_interval: Duration,
    /// How often table partitions are created and expired.
    pub partition_maintenance_interval: Duration,
    /// Evaluation tick of each concurrency manager.
    pub concurrency_tick: Duration,
    /// Liveness refresh tick of each concurrency manager.
    pub liveness_tick: Duration,
    /// Evaluations slower than this are logged as a performance warning.
    pub slow_evaluation_threshold: Duration,
    /// Tick of the status reconciliation loop.
    pub reconcile_tick: Duration,
    /// Number of hash partitions reconciliation is sharded across.
    pub reconcile_partitions: usize,
    /// Maximum number of pending events folded per partition and pass.
    pub reconcile_batch_limit: usize,
    /// Capacity of the event dedup cache.
    pub dedup_cache_capacity: usize,
    /// Number of days a dated partition is retained.
    pub retention_days: u32,
    /// Bound on advisory-lock and statement waits.
    pub lock_timeout: Duration,
    /// Retry budget stamped on every published message.
    pub message_retries: u32,
    /// Retries granted for infrastructure failures (timeouts, lost workers).
    pub internal_retries: i32,
    /// Largest batch a consumer hands to its handler.
    pub buffer_max_batch: usize,
    /// How long a consumer waits before flushing a partial batch.
    pub buffer_flush_interval: Duration,
    /// Maximum rows a timeout or reassignment sweep handles per pass.
    pub sweep_batch_limit: usize,
    /// Upper bound on one per-tenant maintenance operation.
    pub operation_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            timeout_sweep_interval: Duration::from_secs(1),
            reassign_sweep_interval: Duration::from_secs(1),
            partition_maintenance_interval: Duration::from_secs(15 * 60),
            concurrency_tick: Duration::from_secs(1),
            liveness_tick: Duration::from_secs(5),
            slow_evaluation_threshold: Duration::from_millis(100),
            reconcile_tick: Duration::from_secs(1),
            reconcile_partitions: 4,
            reconcile_batch_limit: 10_000,
            dedup_cache_capacity: 100_000,
            retention_days: 7,
            lock_timeout: Duration::from_secs(5),
            message_retries: 5,
            internal_retries: 3,
            buffer_max_batch: 100,
            buffer_flush_interval: Duration::from_millis(10),
            sweep_batch_limit: 1_000,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl FlowConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is set but is not a
    /// positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is set but is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();

        Ok(Self {
            timeout_sweep_interval: millis(
                &get_env,
                ENV_TIMEOUT_SWEEP_MS,
                d.timeout_sweep_interval,
            )?,
            reassign_sweep_interval: millis(
                &get_env,
                ENV_REASSIGN_SWEEP_MS,
                d.reassign_sweep_interval,
            )?,
            partition_maintenance_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_PARTITION_MAINTENANCE_SECS,
                d.partition_maintenance_interval.as_secs(),
            )?),
            concurrency_tick: millis(&get_env, ENV_CONCURRENCY_TICK_MS, d.concurrency_tick)?,
            liveness_tick: millis(&get_env, ENV_LIVENESS_TICK_MS, d.liveness_tick)?,
            slow_evaluation_threshold: millis(
                &get_env,
                ENV_SLOW_EVALUATION_MS,
                d.slow_evaluation_threshold,
            )?,
            reconcile_tick: millis(&get_env, ENV_RECONCILE_TICK_MS, d.reconcile_tick)?,
            reconcile_partitions: count(
                &get_env,
                ENV_RECONCILE_PARTITIONS,
                d.reconcile_partitions,
            )?,
            reconcile_batch_limit: count(
                &get_env,
                ENV_RECONCILE_BATCH_LIMIT,
                d.reconcile_batch_limit,
            )?,
            dedup_cache_capacity: count(
                &get_env,
                ENV_DEDUP_CACHE_CAPACITY,
                d.dedup_cache_capacity,
            )?,
            retention_days: narrow(&get_env, ENV_RETENTION_DAYS, d.retention_days)?,
            lock_timeout: millis(&get_env, ENV_LOCK_TIMEOUT_MS, d.lock_timeout)?,
            message_retries: narrow(&get_env, ENV_MESSAGE_RETRIES, d.message_retries)?,
            internal_retries: narrow(&get_env, ENV_INTERNAL_RETRIES, d.internal_retries)?,
            buffer_max_batch: count(&get_env, ENV_BUFFER_MAX_BATCH, d.buffer_max_batch)?,
            buffer_flush_interval: millis(&get_env, ENV_BUFFER_FLUSH_MS, d.buffer_flush_interval)?,
            sweep_batch_limit: count(&get_env, ENV_SWEEP_BATCH_LIMIT, d.sweep_batch_limit)?,
            operation_timeout: millis(&get_env, ENV_OPERATION_TIMEOUT_MS, d.operation_timeout)?,
        })
    }
}

fn millis<F>(get_env: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_positive_u64_env(get_env, key, default_ms).map(Duration::from_millis)
}

fn count<F>(get_env: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_positive_u64_env(get_env, key, u64::try_from(default).unwrap_or(u64::MAX))?;
    usize::try_from(value).map_err(|_| out_of_range(key, value))
}

fn narrow<F, T>(get_env: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: TryFrom<u64> + Into<i128> + Copy,
{
    let default_u64 = u64::try_from(default.into()).unwrap_or(u64::MAX);
    let value = parse_positive_u64_env(get_env, key, default_u64)?;
    T::try_from(value).map_err(|_| out_of_range(key, value))
}

fn out_of_range(key: &str, value: u64) -> Error {
    Error::configuration(format!("{key} value {value} exceeds supported range"))
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}
