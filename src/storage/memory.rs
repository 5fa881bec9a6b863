// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-local storage driver.

use std::collections::{BTreeSet, HashMap};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Filters, Histogram, StatDetails, Storage, StorageResult, StatsFilter};
use crate::core::Stats;

#[derive(Debug, Clone)]
struct Snapshot {
    stats: Stats,
    instance: Option<String>,
    app_type: Option<String>,
}

/// Keeps snapshots in a map keyed by generated id.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    /// Matching snapshots ordered by start date.
    fn matching(&self, filter: &StatsFilter) -> Vec<(String, Snapshot)> {
        let snapshots = self.snapshots.read();
        let mut found: Vec<(String, Snapshot)> = snapshots
            .iter()
            .filter(|(_, s)| {
                filter.matches_time(s.stats.start_date, s.stats.end_date)
                    && filter.matches_keys(s.instance.as_deref(), s.app_type.as_deref())
            })
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        found.sort_by(|a, b| a.1.stats.start_date.cmp(&b.1.stats.start_date).then(a.0.cmp(&b.0)));
        found
    }
}

impl Storage for MemoryStorage {
    fn save(
        &self,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        let snapshot = Snapshot {
            stats: stats.deep_copy(true),
            instance: instance.map(str::to_string),
            app_type: app_type.map(str::to_string),
        };
        self.snapshots.write().insert(id.clone(), snapshot);
        Ok(id)
    }

    fn replace(
        &self,
        id: Option<&str>,
        stats: &Stats,
        instance: Option<&str>,
        app_type: Option<&str>,
    ) -> StorageResult<String> {
        let new_id = Uuid::new_v4().to_string();
        let snapshot = Snapshot {
            stats: stats.deep_copy(true),
            instance: instance.map(str::to_string),
            app_type: app_type.map(str::to_string),
        };
        let mut snapshots = self.snapshots.write();
        if let Some(old) = id {
            snapshots.remove(old);
        }
        snapshots.insert(new_id.clone(), snapshot);
        Ok(new_id)
    }

    fn load(&self, id: &str) -> StorageResult<Option<Stats>> {
        Ok(self.snapshots.read().get(id).map(|s| {
            let mut stats = s.stats.deep_copy(true);
            stats.info = Some(format!("memory snapshot {}", id));
            stats
        }))
    }

    fn find(&self, filter: &StatsFilter) -> StorageResult<Vec<String>> {
        Ok(self.matching(filter).into_iter().map(|(id, _)| id).collect())
    }

    fn find_filters(&self, filter: &StatsFilter) -> StorageResult<Filters> {
        let mut instances = BTreeSet::new();
        for (_, snapshot) in self.matching(&filter.without_instance()) {
            instances.extend(snapshot.instance);
        }
        let any_type = StatsFilter {
            instance: None,
            app_type: None,
            ..filter.clone()
        };
        let mut types = BTreeSet::new();
        for (_, snapshot) in self.matching(&any_type) {
            types.extend(snapshot.app_type);
        }
        Ok(Filters {
            instances: instances.into_iter().collect(),
            types: types.into_iter().collect(),
        })
    }

    fn load_details(&self, id: &str, filter: &StatsFilter) -> StorageResult<StatDetails> {
        let mut details = StatDetails::new(id);
        let matching = self.matching(filter);
        for (_, snapshot) in &matching {
            if let Some(stat) = snapshot.stats.map.get(id) {
                details.add(stat);
            }
        }
        details.info = Some(format!("memory: {} snapshots searched", matching.len()));
        Ok(details.finish())
    }

    fn load_details_by_ids(&self, id: &str, snapshot_ids: &[String]) -> StorageResult<StatDetails> {
        let mut details = StatDetails::new(id);
        let snapshots = self.snapshots.read();
        for snapshot_id in snapshot_ids {
            if let Some(stat) = snapshots.get(snapshot_id).and_then(|s| s.stats.map.get(id)) {
                details.add(stat);
            }
        }
        Ok(details.finish())
    }

    fn load_aggregated(&self, top_level_only: bool, filter: &StatsFilter) -> StorageResult<Stats> {
        let mut aggregated = Stats::empty();
        let matching = self.matching(filter);
        for (_, snapshot) in &matching {
            aggregated.merge(&snapshot.stats, !top_level_only);
        }
        aggregated.info = Some(format!("memory: {} snapshots merged", matching.len()));
        Ok(aggregated)
    }

    fn load_histogram(
        &self,
        id: &str,
        filter: &StatsFilter,
        _last_group_id: Option<&str>,
    ) -> StorageResult<Histogram> {
        let mut histogram = Histogram::new(id);
        for (_, snapshot) in self.matching(filter) {
            if let Some(stat) = snapshot.stats.map.get(id) {
                histogram.add(stat, snapshot.stats.start_date, snapshot.stats.end_date);
            }
        }
        Ok(histogram)
    }

    fn cleanup(&self, days_to_keep: u32, app_type: Option<&str>) -> StorageResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_to_keep));
        let mut snapshots = self.snapshots.write();
        let before = snapshots.len();
        snapshots.retain(|_, s| {
            let expired = s.stats.end_date.is_some_and(|end| end < cutoff);
            let type_matches = app_type.map_or(true, |t| s.app_type.as_deref() == Some(t));
            !(expired && type_matches)
        });
        Ok(before - snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Context;
    use chrono::{DateTime, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap()
    }

    fn snapshot(start: DateTime<Utc>, end: DateTime<Utc>, calls: &[(&str, u64)]) -> Stats {
        let mut stats = Stats::new(1000, true, start);
        stats.end_date = Some(end);
        for (id, elapsed) in calls {
            stats.store(&Context::new(*id, *elapsed).with_child(Context::new("db", 1)));
        }
        stats
    }

    #[test]
    fn test_save_and_load() {
        let storage = MemoryStorage::new();
        let stats = snapshot(at(4, 10), at(4, 11), &[("a", 10)]);
        let id = storage.save(&stats, Some("i1"), Some("web")).unwrap();

        let loaded = storage.load(&id).unwrap().unwrap();
        assert_eq!(loaded, stats);
        assert!(loaded.info.is_some());
        assert!(storage.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_replace_removes_old() {
        let storage = MemoryStorage::new();
        let stats = snapshot(at(4, 10), at(4, 11), &[("a", 10)]);
        let id = storage.save(&stats, None, None).unwrap();
        let new_id = storage.replace(Some(&id), &stats, None, None).unwrap();

        assert_ne!(id, new_id);
        assert_eq!(storage.len(), 1);
        assert!(storage.load(&id).unwrap().is_none());
    }

    #[test]
    fn test_find_and_filters() {
        let storage = MemoryStorage::new();
        storage
            .save(&snapshot(at(4, 10), at(4, 11), &[("a", 1)]), Some("i1"), Some("web"))
            .unwrap();
        storage
            .save(&snapshot(at(4, 12), at(4, 13), &[("a", 1)]), Some("i2"), Some("batch"))
            .unwrap();
        storage
            .save(&snapshot(at(6, 12), at(6, 13), &[("a", 1)]), Some("i3"), Some("web"))
            .unwrap();

        let day = StatsFilter::range(at(4, 0), at(5, 0));
        assert_eq!(storage.find(&day).unwrap().len(), 2);
        assert_eq!(storage.find(&day.clone().with_type("web")).unwrap().len(), 1);

        let filters = storage.find_filters(&day.with_instance("ignored")).unwrap();
        assert_eq!(filters.instances, vec!["i1", "i2"]);
        assert_eq!(filters.types, vec!["batch", "web"]);
    }

    #[test]
    fn test_load_details_and_aggregated() {
        let storage = MemoryStorage::new();
        storage
            .save(&snapshot(at(4, 10), at(4, 11), &[("a", 10), ("b", 5)]), None, None)
            .unwrap();
        storage
            .save(&snapshot(at(4, 11), at(4, 12), &[("a", 30)]), None, None)
            .unwrap();

        let filter = StatsFilter::range(at(4, 0), at(5, 0));
        let details = storage.load_details("a", &filter).unwrap();
        assert_eq!(details.merged.hits, 2);
        assert_eq!(details.merged.avg, 20.0);
        assert_eq!(details.merged.child("db").unwrap().hits, 2);

        let missing = storage.load_details("zzz", &filter).unwrap();
        assert_eq!(missing.merged.max, 0);

        let all = storage.load_aggregated(false, &filter).unwrap();
        assert_eq!(all.map["a"].hits, 2);
        assert_eq!(all.start_date, Some(at(4, 10)));
        assert_eq!(all.end_date, Some(at(4, 12)));

        let top = storage.load_aggregated(true, &filter).unwrap();
        assert_eq!(top.map["a"].children.as_ref().map(|c| c.len()), Some(0));
    }

    #[test]
    fn test_load_details_by_ids() {
        let storage = MemoryStorage::new();
        let id1 = storage
            .save(&snapshot(at(4, 10), at(4, 11), &[("a", 10)]), None, None)
            .unwrap();
        storage
            .save(&snapshot(at(4, 11), at(4, 12), &[("a", 30)]), None, None)
            .unwrap();

        let details = storage.load_details_by_ids("a", &[id1]).unwrap();
        assert_eq!(details.merged.hits, 1);
        assert_eq!(details.merged.max, 10);
    }

    #[test]
    fn test_histogram_ordered_by_start() {
        let storage = MemoryStorage::new();
        storage
            .save(&snapshot(at(4, 12), at(4, 13), &[("a", 30)]), None, None)
            .unwrap();
        storage
            .save(&snapshot(at(4, 10), at(4, 11), &[("a", 10)]), None, None)
            .unwrap();
        storage
            .save(&snapshot(at(4, 11), at(4, 12), &[("b", 10)]), None, None)
            .unwrap();

        let histogram = storage
            .load_histogram("a", &StatsFilter::default(), None)
            .unwrap();
        assert_eq!(histogram.points.len(), 2);
        assert_eq!(histogram.points[0].max, 10);
        assert_eq!(histogram.points[1].max, 30);
        assert!(histogram.last_group_id.is_none());
    }

    #[test]
    fn test_cleanup() {
        let storage = MemoryStorage::new();
        let old = Utc::now() - Duration::days(40);
        let recent = Utc::now() - Duration::days(1);
        storage
            .save(&snapshot(old, old, &[("a", 1)]), None, Some("web"))
            .unwrap();
        storage
            .save(&snapshot(old, old, &[("a", 1)]), None, Some("batch"))
            .unwrap();
        storage
            .save(&snapshot(recent, recent, &[("a", 1)]), None, Some("web"))
            .unwrap();

        assert_eq!(storage.cleanup(35, Some("web")).unwrap(), 1);
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.cleanup(35, None).unwrap(), 1);
        assert_eq!(storage.len(), 1);
    }
}
