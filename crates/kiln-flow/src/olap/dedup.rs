//! Bounded deduplication of event writes.
//!
//! The cache only bounds work: a miss lets a duplicate reach storage, where
//! it is harmless because the fold is idempotent. Keys are remembered only
//! after the write committed, so a failed write is retried in full.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;

use kiln_core::TenantId;

use super::{OlapRepository, TaskEvent};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("event dedup cache lock poisoned")
}

/// Least-recently-used set of event keys `(task, event type, attempt)`.
pub struct EventDedupCache {
    seen: Mutex<LruCache<String, ()>>,
}

impl std::fmt::Debug for EventDedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDedupCache").finish_non_exhaustive()
    }
}

impl EventDedupCache {
    /// Creates a cache holding up to `capacity` keys (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Splits off the events that were not written before, also collapsing
    /// duplicates within `events`. Returns the new events and the number of
    /// skipped ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn unseen(&self, events: &[TaskEvent]) -> Result<(Vec<TaskEvent>, usize)> {
        let mut seen = self.seen.lock().map_err(poison_err)?;
        let mut batch = HashSet::new();
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            let key = event.dedup_key();
            // `get` refreshes recency for hot keys.
            if seen.get(&key).is_some() || !batch.insert(key) {
                continue;
            }
            fresh.push(event.clone());
        }
        drop(seen);
        let skipped = events.len() - fresh.len();
        Ok((fresh, skipped))
    }

    /// Records `events` as written.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn remember(&self, events: &[TaskEvent]) -> Result<()> {
        let mut seen = self.seen.lock().map_err(poison_err)?;
        for event in events {
            seen.put(event.dedup_key(), ());
        }
        drop(seen);
        Ok(())
    }

    /// Number of cached keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn cached_keys(&self) -> Result<usize> {
        Ok(self.seen.lock().map_err(poison_err)?.len())
    }
}

/// Writes events through an [`EventDedupCache`].
pub struct DedupingEventWriter {
    repo: Arc<dyn OlapRepository>,
    cache: EventDedupCache,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for DedupingEventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupingEventWriter").finish_non_exhaustive()
    }
}

impl DedupingEventWriter {
    /// Creates a writer with a cache of `capacity` keys.
    #[must_use]
    pub fn new(repo: Arc<dyn OlapRepository>, capacity: usize) -> Self {
        Self {
            repo,
            cache: EventDedupCache::new(capacity),
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the underlying cache.
    #[must_use]
    pub const fn cache(&self) -> &EventDedupCache {
        &self.cache
    }

    /// Writes the events not seen before. Returns how many were written.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the write; nothing is cached then.
    pub async fn write(&self, tenant_id: TenantId, events: &[TaskEvent]) -> Result<usize> {
        let (fresh, skipped) = self.cache.unseen(events)?;
        self.metrics.record_dedup_hits(skipped);
        if fresh.is_empty() {
            return Ok(0);
        }
        self.repo.insert_task_events(tenant_id, &fresh).await?;
        self.cache.remember(&fresh)?;
        Ok(fresh.len())
    }
}
