// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Aggregation root for one observation window.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Context;
use super::stat::Stat;

/// Default budget of distinct stats per window.
pub const DEFAULT_MAX_STAT_COUNT: u64 = 300_000;

fn default_aggregate_sub_calls() -> bool {
    true
}

/// Statistics collected during one window, keyed by operation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Remaining budget of distinct stats (top-level and nested).
    pub stats_left: u64,

    /// Trees dropped because the pipeline queue was full.
    pub lost: u64,

    /// Set when the background collector crashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,

    /// Window start.
    pub start_date: Option<DateTime<Utc>>,

    /// Window end.
    pub end_date: Option<DateTime<Utc>>,

    /// Top-level stats.
    #[serde(default)]
    pub map: HashMap<String, Stat>,

    /// Driver-specific description of where this data came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    /// When true every sub-call is also folded in as a top-level entry.
    #[serde(skip, default = "default_aggregate_sub_calls")]
    aggregate_sub_calls: bool,
}

impl Default for Stats {
    fn default() -> Self {
        Self::empty()
    }
}

impl Stats {
    /// Create a fresh window starting at `start`.
    pub fn new(stats_left: u64, aggregate_sub_calls: bool, start: DateTime<Utc>) -> Self {
        Self {
            stats_left,
            lost: 0,
            fatal_error: None,
            start_date: Some(start),
            end_date: None,
            map: HashMap::new(),
            info: None,
            aggregate_sub_calls,
        }
    }

    /// An undated, empty value to merge into.
    pub fn empty() -> Self {
        Self {
            stats_left: DEFAULT_MAX_STAT_COUNT,
            lost: 0,
            fatal_error: None,
            start_date: None,
            end_date: None,
            map: HashMap::new(),
            info: None,
            aggregate_sub_calls: true,
        }
    }

    /// Whether sub-calls are also aggregated as top-level entries.
    pub fn aggregates_sub_calls(&self) -> bool {
        self.aggregate_sub_calls
    }

    /// Whether no stat has been recorded.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Count one tree that could not be queued.
    pub fn increment_lost(&mut self) {
        self.lost += 1;
    }

    /// Merge one completed call tree.
    ///
    /// The whole nested tree is recorded before any top-level sub-call
    /// entries, so when the budget runs out nested stats win.
    pub fn store(&mut self, context: &Context) {
        let mut sub_calls: Vec<&Context> = Vec::new();
        let collect = self.aggregate_sub_calls.then_some(&mut sub_calls);

        if let Some(root) = get_or_add(&mut self.map, &mut self.stats_left, &context.id) {
            record(root, context);
            store_children(root, context, &mut self.stats_left, collect);
        }

        // a -> b -> c also yields top-level b (with nested c) and c
        for sub_call in sub_calls {
            if let Some(stat) = get_or_add(&mut self.map, &mut self.stats_left, &sub_call.id) {
                record(stat, sub_call);
                store_children(stat, sub_call, &mut self.stats_left, None);
            }
        }
    }

    /// Merge another window into this one.
    pub fn merge(&mut self, other: &Stats, with_children: bool) {
        self.lost += other.lost;
        if self.fatal_error.is_none() {
            self.fatal_error = other.fatal_error.clone();
        }
        self.start_date = match (self.start_date, other.start_date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.end_date = match (self.end_date, other.end_date) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        for (id, stat) in &other.map {
            match self.map.get_mut(id) {
                Some(existing) => existing.merge(stat, with_children),
                None => {
                    self.map.insert(id.clone(), stat.deep_copy(with_children));
                }
            }
        }
    }

    /// Copy this window; without children only the has-children markers remain.
    pub fn deep_copy(&self, with_children: bool) -> Stats {
        Stats {
            stats_left: self.stats_left,
            lost: self.lost,
            fatal_error: self.fatal_error.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            map: self
                .map
                .iter()
                .map(|(id, stat)| (id.clone(), stat.deep_copy(with_children)))
                .collect(),
            info: self.info.clone(),
            aggregate_sub_calls: self.aggregate_sub_calls,
        }
    }
}

impl PartialEq for Stats {
    fn eq(&self, other: &Self) -> bool {
        self.stats_left == other.stats_left
            && self.lost == other.lost
            && self.fatal_error == other.fatal_error
            && self.start_date == other.start_date
            && self.end_date == other.end_date
            && self.map == other.map
    }
}

/// Existing stat for `id`, or a new one if the budget allows.
fn get_or_add<'a>(
    map: &'a mut HashMap<String, Stat>,
    budget: &mut u64,
    id: &str,
) -> Option<&'a mut Stat> {
    if map.contains_key(id) {
        return map.get_mut(id);
    }
    if *budget == 0 {
        return None;
    }
    *budget -= 1;
    Some(map.entry(id.to_string()).or_default())
}

fn record(stat: &mut Stat, context: &Context) {
    stat.update(context.elapsed);
    stat.update_err(context.failed);
}

fn store_children<'c>(
    parent: &mut Stat,
    context: &'c Context,
    budget: &mut u64,
    mut sub_calls: Option<&mut Vec<&'c Context>>,
) {
    if context.children.is_empty() {
        return;
    }
    let children = parent.ensure_children();
    for child in &context.children {
        let Some(child_stat) = get_or_add(children, budget, &child.id) else {
            continue;
        };
        record(child_stat, child);
        store_children(child_stat, child, budget, sub_calls.as_deref_mut());
        if let Some(collected) = sub_calls.as_deref_mut() {
            collected.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stats(budget: u64) -> Stats {
        Stats::new(budget, true, Utc::now())
    }

    fn chain() -> Context {
        Context::new("a", 30).with_child(Context::new("b", 20).with_child(Context::new("c", 10)))
    }

    #[test]
    fn test_store_chain_aggregates_sub_calls() {
        let mut s = stats(100);
        s.store(&chain());

        assert_eq!(s.map.len(), 3);
        let a = &s.map["a"];
        let b_in_a = a.child("b").unwrap();
        assert_eq!(b_in_a.hits, 1);
        assert_eq!(b_in_a.child("c").unwrap().hits, 1);

        let b = &s.map["b"];
        assert_eq!(b.max, 20);
        assert_eq!(b.child("c").unwrap().max, 10);

        let c = &s.map["c"];
        assert_eq!(c.hits, 1);
        assert!(c.children.is_none());
    }

    #[test]
    fn test_store_without_sub_call_aggregation() {
        let mut s = Stats::new(100, false, Utc::now());
        s.store(&chain());

        assert_eq!(s.map.len(), 1);
        assert!(s.map["a"].child("b").unwrap().child("c").is_some());
    }

    #[test]
    fn test_store_records_errors() {
        let mut s = stats(100);
        s.store(&Context::new("a", 5).failed(true));
        s.store(&Context::new("a", 7));
        let a = &s.map["a"];
        assert_eq!(a.hits, 2);
        assert_eq!(a.err, 1);
        assert_eq!(a.avg, 6.0);
    }

    #[test]
    fn test_budget_limits_created_stats() {
        // chain creates a, a.b, a.b.c, b, b.c, c = 6 stats
        let mut s = stats(4);
        s.store(&chain());

        fn count(map: &HashMap<String, Stat>) -> usize {
            map.values()
                .map(|s| 1 + s.children.as_ref().map(count).unwrap_or(0))
                .sum()
        }
        assert_eq!(count(&s.map), 4);
        assert_eq!(s.stats_left, 0);
    }

    #[test]
    fn test_tight_budget_prefers_nested_stats() {
        let mut s = stats(3);
        s.store(
            &Context::new("a", 30)
                .with_child(Context::new("b", 10))
                .with_child(Context::new("d", 10)),
        );

        assert_eq!(s.map.len(), 1);
        let a = &s.map["a"];
        assert!(a.child("b").is_some());
        assert!(a.child("d").is_some());
        assert_eq!(s.stats_left, 0);
    }

    #[test]
    fn test_existing_stats_update_after_budget_exhausted() {
        let mut s = stats(1);
        s.store(&Context::new("a", 10));
        s.store(&Context::new("b", 10));
        s.store(&Context::new("a", 20));

        assert_eq!(s.map.len(), 1);
        assert_eq!(s.map["a"].hits, 2);
        assert_eq!(s.map["a"].max, 20);
    }

    #[test]
    fn test_children_marker_set_even_when_budget_blocks_child() {
        let mut s = stats(1);
        s.store(&Context::new("a", 10).with_child(Context::new("b", 1)));
        assert_eq!(s.map["a"].children, Some(HashMap::new()));
    }

    #[test]
    fn test_recursive_same_id() {
        let mut s = stats(100);
        s.store(&Context::new("a", 10).with_child(Context::new("a", 4)));

        let a = &s.map["a"];
        assert_eq!(a.hits, 2);
        assert_eq!(a.child("a").unwrap().hits, 1);
    }

    #[test]
    fn test_merge_widens_dates_and_sums_lost() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

        let mut a = Stats::new(10, true, t1);
        a.end_date = Some(t1);
        a.lost = 2;
        a.store(&Context::new("x", 10));

        let mut b = Stats::new(10, true, t0);
        b.end_date = Some(t2);
        b.lost = 3;
        b.fatal_error = Some("boom".to_string());
        b.store(&Context::new("x", 30));
        b.store(&Context::new("y", 1));

        a.merge(&b, true);
        assert_eq!(a.start_date, Some(t0));
        assert_eq!(a.end_date, Some(t2));
        assert_eq!(a.lost, 5);
        assert_eq!(a.fatal_error.as_deref(), Some("boom"));
        assert_eq!(a.map["x"].hits, 2);
        assert_eq!(a.map["x"].avg, 20.0);
        assert_eq!(a.map["y"].hits, 1);
    }

    #[test]
    fn test_merge_keeps_first_fatal_error() {
        let mut a = Stats::empty();
        a.fatal_error = Some("first".to_string());
        let mut b = Stats::empty();
        b.fatal_error = Some("second".to_string());
        a.merge(&b, true);
        assert_eq!(a.fatal_error.as_deref(), Some("first"));
    }

    #[test]
    fn test_merge_into_empty_copies_dates() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let mut src = Stats::new(10, true, t0);
        src.end_date = Some(t0);
        let mut target = Stats::empty();
        target.merge(&src, true);
        assert_eq!(target.start_date, Some(t0));
        assert_eq!(target.end_date, Some(t0));
    }

    #[test]
    fn test_deep_copy_round_trip() {
        let mut s = stats(100);
        s.store(&chain());
        s.store(&Context::new("a", 12).failed(true));
        s.lost = 3;

        let copy = s.deep_copy(true);
        assert_eq!(copy, s);
    }

    #[test]
    fn test_deep_copy_top_level_view() {
        let mut s = stats(100);
        s.store(&chain());

        let view = s.deep_copy(false);
        assert_eq!(view.map["a"].children, Some(HashMap::new()));
        assert!(view.map["c"].children.is_none());
        assert_eq!(view.map["a"].hits, 1);
    }

    #[test]
    fn test_merge_top_level_only_keeps_marker() {
        let mut s = stats(100);
        s.store(&chain());

        let mut target = Stats::empty();
        target.merge(&s, false);
        target.merge(&s, false);
        assert_eq!(target.map["a"].children, Some(HashMap::new()));
        assert_eq!(target.map["a"].hits, 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut s = Stats::new(
            100,
            true,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        );
        s.store(&chain());
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("statsLeft"));
        let parsed: Stats = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, s);
        assert!(parsed.aggregates_sub_calls());
    }
}
