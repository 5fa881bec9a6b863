// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence of statistics windows.
//!
//! [`Storage`] is the driver boundary. The crate ships an in-process
//! [`MemoryStorage`], a SQLite-backed [`SqliteStorage`], and the
//! [`TieredStorage`] wrapper that maintains day/week/month rollups on top of
//! any four drivers.

mod factory;
mod memory;
mod persistence;
mod sqlite;
mod tiered;

pub use factory::{create_storage, create_tiered, safe_create, tier_prefix};
pub use memory::MemoryStorage;
pub use persistence::{StatsPersistence, FAILURE_COOLDOWN_MINUTES};
pub use sqlite::SqliteStorage;
pub use tiered::{Granularity, TieredStorage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Stat, Stats};
use crate::error::StorageError;

/// Result type for storage drivers.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Query restriction shared by all read operations.
///
/// Every field is optional. Time matching uses overlap: a snapshot matches
/// when it ends at or after `from` and starts at or before `to`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub instance: Option<String>,
    pub app_type: Option<String>,
}

impl StatsFilter {
    /// Filter on a time range only.
    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = Some(app_type.into());
        self
    }

    /// Same filter with the instance restriction removed.
    pub fn without_instance(&self) -> Self {
        Self {
            instance: None,
            ..self.clone()
        }
    }

    /// Whether a snapshot spanning `[start, end]` overlaps the range.
    pub fn matches_time(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        if let (Some(from), Some(end)) = (self.from, end) {
            if end < from {
                return false;
            }
        }
        if let (Some(to), Some(start)) = (self.to, start) {
            if start > to {
                return false;
            }
        }
        true
    }

    /// Whether a snapshot with these partition keys passes the filter.
    pub fn matches_keys(&self, instance: Option<&str>, app_type: Option<&str>) -> bool {
        let instance_ok = self
            .instance
            .as_deref()
            .map_or(true, |wanted| instance == Some(wanted));
        let type_ok = self
            .app_type
            .as_deref()
            .map_or(true, |wanted| app_type == Some(wanted));
        instance_ok && type_ok
    }
}

/// Distinct partition keys present in a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub instances: Vec<String>,
    pub types: Vec<String>,
}

/// One operation id merged across every matching snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatDetails {
    pub id: String,
    pub merged: Stat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl StatDetails {
    /// Details with nothing merged yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            merged: Stat::new(),
            info: None,
        }
    }

    /// Merge one snapshot's stat, children included.
    pub fn add(&mut self, stat: &Stat) {
        self.merged.merge(stat, true);
    }

    /// Replace an untouched result with [`Stat::empty_stat`].
    pub fn finish(mut self) -> Self {
        if !self.merged.is_set() && self.merged.hits == 0 {
            self.merged = Stat::empty_stat();
        }
        self
    }
}

/// One point of an operation's history: its stat in a single snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatHistory {
    pub hits: u64,
    pub err: u64,
    pub max: i64,
    pub min: i64,
    pub avg: i64,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl StatHistory {
    pub fn new(stat: &Stat, start_date: Option<DateTime<Utc>>, end_date: Option<DateTime<Utc>>) -> Self {
        Self {
            hits: stat.hits,
            err: stat.err,
            max: stat.max,
            min: stat.min,
            avg: stat.avg_rounded(),
            start_date,
            end_date,
        }
    }
}

/// History of one operation id across snapshots.
///
/// When `last_group_id` is set only part of the history was returned and the
/// caller should ask again starting after that snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Histogram {
    pub id: String,
    pub points: Vec<StatHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_group_id: Option<String>,
}

impl Histogram {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, stat: &Stat, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) {
        self.points.push(StatHistory::new(stat, start, end));
    }
}

/// A storage driver.
///
/// Implementations are called from background workers and from read paths
/// concurrently, so they must be thread-safe.
pub trait Storage: Send + Sync {
    /// Persist a snapshot and return its new id.
    fn save(&self, stats: &Stats, instance: Option<&str>, app_type: Option<&str>)
        -> StorageResult<String>;

    /// Replace the snapshot `id` (if any) with `stats`, returning the new id.
    fn replace(
        &self,
        id: Option<&str>,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String>;

    /// Load one snapshot with its full tree.
    fn load(&self, id: &str) -> StorageResult<Option<Stats>>;

    /// Ids of snapshots matching the filter.
    fn find(&self, filter: &StatsFilter) -> StorageResult<Vec<String>>;

    /// Distinct instances and types in the filter's range.
    ///
    /// Instances honor the type restriction; types ignore both key
    /// restrictions.
    fn find_filters(&self, filter: &StatsFilter) -> StorageResult<Filters>;

    /// Merge one operation id across matching snapshots.
    fn load_details(&self, id: &str, filter: &StatsFilter) -> StorageResult<StatDetails>;

    /// Merge one operation id across the given snapshots.
    fn load_details_by_ids(&self, id: &str, snapshot_ids: &[String]) -> StorageResult<StatDetails>;

    /// Merge every matching snapshot into one.
    fn load_aggregated(&self, top_level_only: bool, filter: &StatsFilter) -> StorageResult<Stats>;

    /// Per-snapshot history of one operation id.
    fn load_histogram(
        &self,
        id: &str,
        filter: &StatsFilter,
        last_group_id: Option<&str>,
    ) -> StorageResult<Histogram>;

    /// Remove snapshots older than `days_to_keep` days. Returns how many went.
    fn cleanup(&self, days_to_keep: u32, app_type: Option<&str>) -> StorageResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_filter_overlap() {
        let filter = StatsFilter::range(at(10), at(12));

        assert!(filter.matches_time(Some(at(9)), Some(at(10))));
        assert!(filter.matches_time(Some(at(12)), Some(at(13))));
        assert!(filter.matches_time(Some(at(8)), Some(at(14))));
        assert!(!filter.matches_time(Some(at(7)), Some(at(9))));
        assert!(!filter.matches_time(Some(at(12) + Duration::seconds(1)), Some(at(14))));
    }

    #[test]
    fn test_open_filter_matches_everything() {
        let filter = StatsFilter::default();
        assert!(filter.matches_time(None, None));
        assert!(filter.matches_keys(None, None));
        assert!(filter.matches_keys(Some("i"), Some("t")));
    }

    #[test]
    fn test_filter_keys() {
        let filter = StatsFilter::default().with_instance("node-1").with_type("web");
        assert!(filter.matches_keys(Some("node-1"), Some("web")));
        assert!(!filter.matches_keys(None, Some("web")));
        assert!(!filter.matches_keys(Some("node-2"), Some("web")));
        assert!(filter.without_instance().matches_keys(None, Some("web")));
    }

    #[test]
    fn test_details_finish_empty() {
        let details = StatDetails::new("op").finish();
        assert_eq!(details.merged, Stat::empty_stat());
    }

    #[test]
    fn test_history_rounds_avg() {
        let mut stat = Stat::new();
        stat.update(10);
        stat.update(11);
        let point = StatHistory::new(&stat, Some(at(1)), None);
        assert_eq!(point.avg, 11);
        assert_eq!(point.hits, 2);
    }
}
