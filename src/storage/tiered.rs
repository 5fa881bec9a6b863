// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Raw snapshots plus daily, weekly and monthly rollups.
//!
//! Every save is written to the raw tier and merged into the bucket of each
//! rollup tier that contains the snapshot's start date. Reads are routed to
//! the coarsest tier whose granularity still fits the requested span.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use tracing::{debug, warn};

use super::{Filters, Histogram, StatDetails, Storage, StorageResult, StatsFilter};
use crate::core::Stats;
use crate::error::StorageError;

/// Storage tier, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Raw,
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Raw => write!(f, "raw"),
            Granularity::Daily => write!(f, "daily"),
            Granularity::Weekly => write!(f, "weekly"),
            Granularity::Monthly => write!(f, "monthly"),
        }
    }
}

impl Granularity {
    /// Tier serving a query over `[from, to]`.
    ///
    /// The span is padded by one minute before comparing.
    pub fn for_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let span = to - from + Duration::minutes(1);
        if span < Duration::days(1) {
            Granularity::Raw
        } else if span < Duration::days(7) {
            Granularity::Daily
        } else if span < Duration::days(30) {
            Granularity::Weekly
        } else {
            Granularity::Monthly
        }
    }

    /// UTC bucket `[start, end)` containing `at`. Raw has no buckets.
    pub fn bucket(self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let date = at.date_naive();
        let (first, next) = match self {
            Granularity::Raw => return None,
            Granularity::Daily => (date, date.succ_opt()?),
            Granularity::Weekly => {
                let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
                (monday, monday + Duration::days(7))
            }
            Granularity::Monthly => {
                let first = date.with_day(1)?;
                (first, first.checked_add_months(Months::new(1))?)
            }
        };
        let start = Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?);
        let end = Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?);
        Some((start, end))
    }
}

const ROLLUPS: [Granularity; 3] = [Granularity::Daily, Granularity::Weekly, Granularity::Monthly];

/// Tiered storage over four drivers.
pub struct TieredStorage {
    raw: Arc<dyn Storage>,
    daily: Arc<dyn Storage>,
    weekly: Arc<dyn Storage>,
    monthly: Arc<dyn Storage>,
    aggregate_only: bool,
}

impl TieredStorage {
    pub fn new(
        raw: Arc<dyn Storage>,
        daily: Arc<dyn Storage>,
        weekly: Arc<dyn Storage>,
        monthly: Arc<dyn Storage>,
    ) -> Self {
        Self {
            raw,
            daily,
            weekly,
            monthly,
            aggregate_only: false,
        }
    }

    /// Only update rollups, skipping the raw tier. Used to rebuild rollups
    /// from snapshots that are already stored.
    pub fn with_aggregate_only(mut self, aggregate_only: bool) -> Self {
        self.aggregate_only = aggregate_only;
        self
    }

    pub fn is_aggregate_only(&self) -> bool {
        self.aggregate_only
    }

    /// Driver for a tier.
    pub fn tier(&self, granularity: Granularity) -> &Arc<dyn Storage> {
        match granularity {
            Granularity::Raw => &self.raw,
            Granularity::Daily => &self.daily,
            Granularity::Weekly => &self.weekly,
            Granularity::Monthly => &self.monthly,
        }
    }

    /// Tier a filtered query is routed to.
    pub fn route(&self, filter: &StatsFilter) -> StorageResult<Granularity> {
        match (filter.from, filter.to) {
            (Some(from), Some(to)) => Ok(Granularity::for_range(from, to)),
            _ => Err(StorageError::InvalidArgument(
                "tiered queries need both a from and a to date".to_string(),
            )),
        }
    }

    /// Routed driver plus the filter adjusted for it. Rollups carry no
    /// instance, so the instance restriction is dropped for them.
    fn routed(&self, filter: &StatsFilter) -> StorageResult<(&Arc<dyn Storage>, StatsFilter)> {
        let granularity = self.route(filter)?;
        let filter = match granularity {
            Granularity::Raw => filter.clone(),
            _ => filter.without_instance(),
        };
        Ok((self.tier(granularity), filter))
    }

    /// Merge `stats` into the rollup bucket of one tier.
    ///
    /// The bucket is stored as `[start, end - 1s]` so a range starting on
    /// the next boundary does not overlap it.
    ///
    /// Not atomic: two writers updating the same bucket at once can lose one
    /// of the updates.
    fn update_rollup(
        &self,
        granularity: Granularity,
        stats: &Stats,
        start_date: DateTime<Utc>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let storage = self.tier(granularity);
        let (start, end) = granularity.bucket(start_date).ok_or_else(|| {
            StorageError::InvalidArgument(format!("no {} bucket for {}", granularity, start_date))
        })?;

        let search = StatsFilter {
            from: Some(start + Duration::seconds(1)),
            to: Some(end - Duration::seconds(1)),
            instance: None,
            app_type: app_type.map(str::to_string),
        };
        let ids = storage.find(&search)?;
        if ids.len() > 1 {
            warn!(
                tier = %granularity,
                count = ids.len(),
                "Found more than one rollup bucket to update"
            );
        }

        let replace_id = ids.into_iter().next();
        let mut aggregated = match &replace_id {
            Some(id) => storage.load(id)?.unwrap_or_default(),
            None => Stats::empty(),
        };
        aggregated.merge(stats, true);
        aggregated.start_date = Some(start);
        aggregated.end_date = Some(end - Duration::seconds(1));
        aggregated.info = None;

        let id = storage.replace(replace_id.as_deref(), &aggregated, None, app_type)?;
        debug!(tier = %granularity, bucket_start = %start, "Updated rollup bucket");
        Ok(id)
    }
}

impl Storage for TieredStorage {
    /// Returns the raw snapshot id, or the daily bucket id in aggregate-only
    /// mode.
    fn save(
        &self,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let start_date = stats.start_date.ok_or_else(|| {
            StorageError::InvalidArgument("stats start date is required".to_string())
        })?;

        let mut result = None;
        if !self.aggregate_only {
            result = Some(self.raw.save(stats, instance, app_type)?);
        }

        // rollups are partitioned by type only
        for granularity in ROLLUPS {
            let id = self.update_rollup(granularity, stats, start_date, app_type)?;
            result.get_or_insert(id);
        }
        result.ok_or_else(|| StorageError::Database("no tier accepted the save".to_string()))
    }

    fn replace(
        &self,
        _id: Option<&str>,
        _stats: &Stats,
        _instance: Option<&str>,
        _app_type: Option<&str>,
    ) -> StorageResult<String> {
        Err(StorageError::Unsupported(
            "rolled-up stats cannot be un-merged, so replace is not available".to_string(),
        ))
    }

    fn load(&self, id: &str) -> StorageResult<Option<Stats>> {
        self.raw.load(id)
    }

    fn find(&self, filter: &StatsFilter) -> StorageResult<Vec<String>> {
        let (storage, filter) = self.routed(filter)?;
        storage.find(&filter)
    }

    fn find_filters(&self, filter: &StatsFilter) -> StorageResult<Filters> {
        let granularity = self.route(filter)?;
        self.tier(granularity).find_filters(filter)
    }

    fn load_details(&self, id: &str, filter: &StatsFilter) -> StorageResult<StatDetails> {
        let (storage, filter) = self.routed(filter)?;
        storage.load_details(id, &filter)
    }

    fn load_details_by_ids(&self, _id: &str, _snapshot_ids: &[String]) -> StorageResult<StatDetails> {
        Err(StorageError::Unsupported(
            "snapshot ids do not identify a tier without a time range".to_string(),
        ))
    }

    fn load_aggregated(&self, top_level_only: bool, filter: &StatsFilter) -> StorageResult<Stats> {
        let (storage, filter) = self.routed(filter)?;
        storage.load_aggregated(top_level_only, &filter)
    }

    fn load_histogram(
        &self,
        id: &str,
        filter: &StatsFilter,
        last_group_id: Option<&str>,
    ) -> StorageResult<Histogram> {
        let (storage, filter) = self.routed(filter)?;
        storage.load_histogram(id, &filter, last_group_id)
    }

    fn cleanup(&self, days_to_keep: u32, app_type: Option<&str>) -> StorageResult<usize> {
        self.raw.cleanup(days_to_keep, app_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Context;
    use crate::storage::MemoryStorage;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    struct Tiers {
        raw: Arc<MemoryStorage>,
        daily: Arc<MemoryStorage>,
        weekly: Arc<MemoryStorage>,
        monthly: Arc<MemoryStorage>,
        storage: TieredStorage,
    }

    fn tiers() -> Tiers {
        let raw = Arc::new(MemoryStorage::new());
        let daily = Arc::new(MemoryStorage::new());
        let weekly = Arc::new(MemoryStorage::new());
        let monthly = Arc::new(MemoryStorage::new());
        let storage = TieredStorage::new(
            raw.clone(),
            daily.clone(),
            weekly.clone(),
            monthly.clone(),
        );
        Tiers {
            raw,
            daily,
            weekly,
            monthly,
            storage,
        }
    }

    fn snapshot(start: DateTime<Utc>, id: &str, elapsed: u64) -> Stats {
        let mut stats = Stats::new(1000, true, start);
        stats.end_date = Some(start + Duration::minutes(5));
        stats.store(&Context::new(id, elapsed));
        stats
    }

    fn only(storage: &MemoryStorage) -> Stats {
        let ids = storage.find(&StatsFilter::default()).unwrap();
        assert_eq!(ids.len(), 1, "expected exactly one bucket");
        storage.load(&ids[0]).unwrap().unwrap()
    }

    #[test]
    fn test_bucket_boundaries() {
        let at = utc(2016, 10, 12, 13, 15, 12);
        assert_eq!(
            Granularity::Daily.bucket(at),
            Some((utc(2016, 10, 12, 0, 0, 0), utc(2016, 10, 13, 0, 0, 0)))
        );
        assert_eq!(
            Granularity::Weekly.bucket(at),
            Some((utc(2016, 10, 10, 0, 0, 0), utc(2016, 10, 17, 0, 0, 0)))
        );
        assert_eq!(
            Granularity::Monthly.bucket(at),
            Some((utc(2016, 10, 1, 0, 0, 0), utc(2016, 11, 1, 0, 0, 0)))
        );
        assert_eq!(
            Granularity::Monthly.bucket(utc(2016, 12, 31, 23, 59, 59)),
            Some((utc(2016, 12, 1, 0, 0, 0), utc(2017, 1, 1, 0, 0, 0)))
        );
        assert_eq!(Granularity::Raw.bucket(at), None);
    }

    #[test]
    fn test_weekly_bucket_on_sunday_belongs_to_previous_monday() {
        let sunday = utc(2016, 10, 16, 23, 0, 0);
        assert_eq!(
            Granularity::Weekly.bucket(sunday).map(|b| b.0),
            Some(utc(2016, 10, 10, 0, 0, 0))
        );
    }

    #[test]
    fn test_two_saves_same_day_share_daily_bucket() {
        let t = tiers();
        t.storage
            .save(&snapshot(utc(2000, 3, 3, 13, 15, 0), "x", 10), Some("i1"), Some("web"))
            .unwrap();
        t.storage
            .save(&snapshot(utc(2000, 3, 3, 13, 20, 0), "x", 30), Some("i1"), Some("web"))
            .unwrap();

        assert_eq!(t.raw.len(), 2);
        let daily = only(&t.daily);
        assert_eq!(daily.start_date, Some(utc(2000, 3, 3, 0, 0, 0)));
        assert_eq!(daily.end_date, Some(utc(2000, 3, 3, 23, 59, 59)));
        assert_eq!(daily.map["x"].hits, 2);
        assert_eq!(daily.map["x"].avg, 20.0);

        assert_eq!(only(&t.weekly).map["x"].hits, 2);
        assert_eq!(only(&t.monthly).map["x"].hits, 2);
    }

    #[test]
    fn test_adjacent_days_get_separate_buckets() {
        let t = tiers();
        t.storage
            .save(&snapshot(utc(2000, 3, 3, 23, 58, 0), "x", 1), None, Some("web"))
            .unwrap();
        t.storage
            .save(&snapshot(utc(2000, 3, 4, 0, 0, 0), "x", 1), None, Some("web"))
            .unwrap();
        assert_eq!(t.daily.len(), 2);
        assert_eq!(t.weekly.len(), 1);
    }

    #[test]
    fn test_range_starting_on_next_boundary_skips_previous_bucket() {
        let t = tiers();
        // 2000-03-03 is a Friday
        t.storage
            .save(&snapshot(utc(2000, 3, 3, 13, 0, 0), "x", 1), None, Some("web"))
            .unwrap();

        let next_day = StatsFilter::range(utc(2000, 3, 4, 0, 0, 0), utc(2000, 3, 6, 0, 0, 0))
            .with_type("web");
        assert_eq!(t.storage.route(&next_day).unwrap(), Granularity::Daily);
        assert!(t.storage.load_aggregated(false, &next_day).unwrap().map.is_empty());
        assert!(t.storage.find(&next_day).unwrap().is_empty());

        let next_week = StatsFilter::range(utc(2000, 3, 6, 0, 0, 0), utc(2000, 3, 14, 0, 0, 0));
        assert_eq!(t.storage.route(&next_week).unwrap(), Granularity::Weekly);
        assert!(t.storage.find(&next_week).unwrap().is_empty());

        let next_month = StatsFilter::range(utc(2000, 4, 1, 0, 0, 0), utc(2000, 5, 11, 0, 0, 0));
        assert_eq!(t.storage.route(&next_month).unwrap(), Granularity::Monthly);
        assert!(t.storage.find(&next_month).unwrap().is_empty());

        let same_day = StatsFilter::range(utc(2000, 3, 3, 0, 0, 0), utc(2000, 3, 5, 0, 0, 0));
        assert_eq!(t.storage.load_aggregated(false, &same_day).unwrap().map["x"].hits, 1);
    }

    #[test]
    fn test_rollups_partitioned_by_type_without_instance() {
        let t = tiers();
        let start = utc(2000, 3, 3, 13, 0, 0);
        t.storage.save(&snapshot(start, "x", 1), Some("i1"), Some("web")).unwrap();
        t.storage.save(&snapshot(start, "x", 1), Some("i2"), Some("web")).unwrap();
        t.storage.save(&snapshot(start, "x", 1), Some("i1"), Some("batch")).unwrap();

        assert_eq!(t.daily.len(), 2);
        let filters = t.daily.find_filters(&StatsFilter::default()).unwrap();
        assert!(filters.instances.is_empty());
        assert_eq!(filters.types, vec!["batch", "web"]);
    }

    #[test]
    fn test_update_merges_existing_bucket_and_lost() {
        let t = tiers();
        let mut first = snapshot(utc(2000, 3, 3, 1, 0, 0), "x", 1);
        first.lost = 5;
        let mut second = snapshot(utc(2000, 3, 3, 2, 0, 0), "y", 1);
        second.lost = 3;
        t.storage.save(&first, None, Some("web")).unwrap();
        t.storage.save(&second, None, Some("web")).unwrap();

        let daily = only(&t.daily);
        assert_eq!(daily.lost, 8);
        assert!(daily.map.contains_key("x"));
        assert!(daily.map.contains_key("y"));
    }

    #[test]
    fn test_aggregate_only_skips_raw() {
        let t = tiers();
        let storage = t.storage.with_aggregate_only(true);
        let id = storage
            .save(&snapshot(utc(2000, 3, 3, 13, 0, 0), "x", 1), None, None)
            .unwrap();

        assert!(t.raw.is_empty());
        assert_eq!(t.daily.find(&StatsFilter::default()).unwrap(), vec![id]);
    }

    #[test]
    fn test_save_requires_start_date() {
        let t = tiers();
        let err = t.storage.save(&Stats::empty(), None, None).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_routing_by_span() {
        let from = utc(2000, 3, 3, 0, 0, 0);
        assert_eq!(Granularity::for_range(from, from + Duration::hours(23)), Granularity::Raw);
        assert_eq!(
            Granularity::for_range(from, from + Duration::hours(23) + Duration::minutes(59)),
            Granularity::Daily
        );
        assert_eq!(Granularity::for_range(from, from + Duration::days(6)), Granularity::Daily);
        assert_eq!(Granularity::for_range(from, from + Duration::days(7)), Granularity::Weekly);
        assert_eq!(Granularity::for_range(from, from + Duration::days(29)), Granularity::Weekly);
        assert_eq!(Granularity::for_range(from, from + Duration::days(30)), Granularity::Monthly);
    }

    #[test]
    fn test_queries_routed_to_tiers() {
        let t = tiers();
        let start = utc(2000, 3, 3, 13, 0, 0);
        t.storage.save(&snapshot(start, "x", 10), Some("i1"), Some("web")).unwrap();

        let hour = StatsFilter::range(start, start + Duration::hours(1)).with_instance("i1");
        let ids = t.storage.find(&hour).unwrap();
        assert_eq!(ids, t.raw.find(&StatsFilter::default()).unwrap());

        // rollups ignore the instance
        let days = StatsFilter::range(start - Duration::days(1), start + Duration::days(1))
            .with_instance("i1");
        let ids = t.storage.find(&days).unwrap();
        assert_eq!(ids, t.daily.find(&StatsFilter::default()).unwrap());

        let weeks = StatsFilter::range(start - Duration::days(7), start + Duration::days(7));
        let aggregated = t.storage.load_aggregated(false, &weeks).unwrap();
        assert_eq!(aggregated.map["x"].hits, 1);
        assert_eq!(t.storage.route(&weeks).unwrap(), Granularity::Weekly);

        let months = StatsFilter::range(start - Duration::days(40), start + Duration::days(40));
        let details = t.storage.load_details("x", &months).unwrap();
        assert_eq!(details.merged.max, 10);
        let histogram = t.storage.load_histogram("x", &months, None).unwrap();
        assert_eq!(histogram.points.len(), 1);
        assert_eq!(histogram.points[0].start_date, Some(utc(2000, 3, 1, 0, 0, 0)));
    }

    #[test]
    fn test_open_range_is_invalid() {
        let t = tiers();
        let err = t.storage.find(&StatsFilter::default()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_unsupported_operations() {
        let t = tiers();
        let stats = snapshot(utc(2000, 3, 3, 13, 0, 0), "x", 1);
        assert!(matches!(
            t.storage.replace(None, &stats, None, None),
            Err(StorageError::Unsupported(_))
        ));
        assert!(matches!(
            t.storage.load_details_by_ids("x", &[]),
            Err(StorageError::Unsupported(_))
        ));
    }

    #[test]
    fn test_load_and_cleanup_use_raw_tier() {
        let t = tiers();
        let old = Utc::now() - Duration::days(60);
        let id = t.storage.save(&snapshot(old, "x", 1), None, None).unwrap();
        assert!(t.storage.load(&id).unwrap().is_some());

        assert_eq!(t.storage.cleanup(35, None).unwrap(), 1);
        assert!(t.raw.is_empty());
        assert_eq!(t.daily.len(), 1);
    }
}
