//! Daily partition rotation of the read model.
//!
//! Today's and tomorrow's partitions must exist before rows for them are
//! written; partitions older than the retention window are detached and
//! dropped.

use std::collections::BTreeSet;

use chrono::{DateTime, Days, NaiveDate, Utc};

use super::OlapTable;

/// Partition DDL for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Dates to create.
    pub create: Vec<NaiveDate>,
    /// Dates to detach and drop.
    pub drop: Vec<NaiveDate>,
}

impl PartitionPlan {
    /// Returns true if nothing has to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.drop.is_empty()
    }
}

/// Returns the partition name of `table` for `date`, e.g.
/// `v2_tasks_olap_20250301`.
#[must_use]
pub fn partition_name(table: OlapTable, date: NaiveDate) -> String {
    format!("{}_{}", table.name(), date.format("%Y%m%d"))
}

/// Returns the partitions that must exist at `now`.
#[must_use]
pub fn required_dates(now: DateTime<Utc>) -> [NaiveDate; 2] {
    let today = now.date_naive();
    [today, today.checked_add_days(Days::new(1)).unwrap_or(today)]
}

/// Returns the oldest date that is kept.
#[must_use]
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> NaiveDate {
    let today = now.date_naive();
    today
        .checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Plans the DDL that brings `existing` in line with `now`.
#[must_use]
pub fn plan_partitions(
    existing: &BTreeSet<NaiveDate>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> PartitionPlan {
    let create = required_dates(now)
        .into_iter()
        .filter(|d| !existing.contains(d))
        .collect();
    let cutoff = retention_cutoff(now, retention_days);
    let drop = existing.range(..cutoff).copied().collect();
    PartitionPlan { create, drop }
}
