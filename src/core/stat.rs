// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Running statistics for one operation id at one tree position.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Aggregated statistics for one operation.
///
/// `children` distinguishes three states:
/// - `None`: no children were ever observed (or none were loaded at all),
/// - `Some(empty)`: children exist but were not loaded (top-level views),
/// - `Some(map)`: loaded children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    /// Completed invocations merged in.
    pub hits: u64,

    /// Invocations that failed.
    #[serde(default)]
    pub err: u64,

    /// Longest elapsed time; `-1` means unset.
    pub max: i64,

    /// Shortest elapsed time; meaningful only once `max` is set.
    pub min: i64,

    /// Running mean of elapsed times.
    pub avg: f64,

    /// Nested stats keyed by child id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<HashMap<String, Stat>>,
}

impl Default for Stat {
    fn default() -> Self {
        Self::new()
    }
}

impl Stat {
    /// Create an unset stat.
    pub fn new() -> Self {
        Self {
            hits: 0,
            err: 0,
            max: -1,
            min: 0,
            avg: 0.0,
            children: None,
        }
    }

    /// A zeroed stat with `max` set, used when a query matched nothing.
    pub fn empty_stat() -> Self {
        Self {
            max: 0,
            ..Self::new()
        }
    }

    /// Whether any timing was recorded.
    pub fn is_set(&self) -> bool {
        self.max >= 0
    }

    /// Rounded mean, as exposed to storage and reports.
    pub fn avg_rounded(&self) -> i64 {
        self.avg.round() as i64
    }

    /// Record one completed invocation.
    pub fn update(&mut self, time: u64) {
        let time = i64::try_from(time).unwrap_or(i64::MAX);
        if !self.is_set() {
            self.max = time;
            self.min = time;
            self.avg = time as f64;
        } else {
            self.max = self.max.max(time);
            self.min = self.min.min(time);
            self.avg = (self.avg * self.hits as f64 + time as f64) / (self.hits + 1) as f64;
        }
        self.hits += 1;
    }

    /// Record the failure flag of one completed invocation.
    pub fn update_err(&mut self, failed: bool) {
        if failed {
            self.err += 1;
        }
    }

    /// Mark that children exist without loading any.
    pub fn ensure_children(&mut self) -> &mut HashMap<String, Stat> {
        self.children.get_or_insert_with(HashMap::new)
    }

    /// Nested stat for `id`, if present.
    pub fn child(&self, id: &str) -> Option<&Stat> {
        self.children.as_ref().and_then(|c| c.get(id))
    }

    /// Nested stat for `id`, mutable.
    pub fn child_mut(&mut self, id: &str) -> Option<&mut Stat> {
        self.children.as_mut().and_then(|c| c.get_mut(id))
    }

    /// Combine `other` into `self`.
    ///
    /// Extrema and error counts are combined, the mean is recombined weighted
    /// by hits. With `with_children` the child maps are merged recursively;
    /// otherwise only the has-children marker is carried over.
    pub fn merge(&mut self, other: &Stat, with_children: bool) {
        if other.is_set() {
            if self.is_set() {
                self.min = self.min.min(other.min);
            } else {
                self.min = other.min;
            }
        }
        self.max = self.max.max(other.max);
        self.err += other.err;

        let total = self.hits + other.hits;
        if total > 0 {
            self.avg =
                (self.avg * self.hits as f64 + other.avg * other.hits as f64) / total as f64;
            self.hits = total;
        }

        if with_children {
            self.merge_children(other);
        } else if other.children.is_some() {
            self.ensure_children();
        }
    }

    fn merge_children(&mut self, other: &Stat) {
        let Some(other_children) = &other.children else {
            return;
        };
        let children = self.ensure_children();
        for (id, stat) in other_children {
            match children.get_mut(id) {
                Some(existing) => existing.merge(stat, true),
                None => {
                    children.insert(id.clone(), stat.deep_copy(true));
                }
            }
        }
    }

    /// Copy this stat, optionally dropping loaded children but keeping the marker.
    pub fn deep_copy(&self, with_children: bool) -> Stat {
        let mut copy = Stat::new();
        copy.merge(self, with_children);
        copy.min = self.min;
        copy
    }
}

/// Compare means at millisecond-thousandths precision.
fn same_avg(a: f64, b: f64) -> bool {
    (a * 1000.0).round() as i64 == (b * 1000.0).round() as i64
}

impl PartialEq for Stat {
    fn eq(&self, other: &Self) -> bool {
        self.hits == other.hits
            && self.err == other.err
            && self.max == other.max
            && self.min == other.min
            && same_avg(self.avg, other.avg)
            && self.children == other.children
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(hits: u64, avg: f64, min: i64, max: i64) -> Stat {
        Stat {
            hits,
            err: 0,
            max,
            min,
            avg,
            children: None,
        }
    }

    #[test]
    fn test_update() {
        let mut s = Stat::new();
        s.update(10);
        assert_eq!((s.hits, s.min, s.max), (1, 10, 10));
        assert_eq!(s.avg, 10.0);

        s.update(30);
        s.update(20);
        assert_eq!((s.hits, s.min, s.max), (3, 10, 30));
        assert_eq!(s.avg, 20.0);
    }

    #[test]
    fn test_update_err() {
        let mut s = Stat::new();
        s.update_err(true);
        s.update_err(false);
        s.update_err(true);
        assert_eq!(s.err, 2);
    }

    #[test]
    fn test_merge_weighted_avg() {
        let mut a = stat(2, 10.0, 5, 15);
        let b = stat(2, 30.0, 20, 40);
        a.merge(&b, true);

        assert_eq!(a.hits, 4);
        assert_eq!(a.avg, 20.0);
        assert_eq!(a.min, 5);
        assert_eq!(a.max, 40);
    }

    #[test]
    fn test_merge_commutative() {
        let mut left = stat(3, 12.0, 2, 30);
        left.err = 1;
        let mut right = stat(5, 40.0, 7, 90);
        right.err = 4;

        let mut ab = left.clone();
        ab.merge(&right, true);
        let mut ba = right.clone();
        ba.merge(&left, true);

        assert_eq!(ab, ba);
        assert_eq!(ab.err, 5);
        assert_eq!(ab.hits, 8);
    }

    #[test]
    fn test_merge_into_unset_keeps_min() {
        let mut empty = Stat::new();
        empty.merge(&stat(1, 7.0, 7, 7), true);
        assert_eq!(empty.min, 7);
        assert_eq!(empty.max, 7);
    }

    #[test]
    fn test_merge_without_children_keeps_marker() {
        let mut child_owner = stat(1, 1.0, 1, 1);
        child_owner
            .ensure_children()
            .insert("child".to_string(), stat(1, 1.0, 1, 1));

        let mut target = stat(1, 1.0, 1, 1);
        target.merge(&child_owner, false);

        let children = target.children.as_ref().expect("marker");
        assert!(children.is_empty());
    }

    #[test]
    fn test_merge_with_children_recurses() {
        let mut a = stat(1, 10.0, 10, 10);
        a.ensure_children()
            .insert("x".to_string(), stat(1, 4.0, 4, 4));
        let mut b = stat(1, 20.0, 20, 20);
        b.ensure_children()
            .insert("x".to_string(), stat(1, 8.0, 8, 8));
        b.ensure_children()
            .insert("y".to_string(), stat(2, 3.0, 1, 5));

        a.merge(&b, true);

        let x = a.child("x").unwrap();
        assert_eq!(x.hits, 2);
        assert_eq!(x.avg, 6.0);
        assert_eq!(a.child("y").unwrap().hits, 2);
    }

    #[test]
    fn test_merge_children_does_not_alias_source() {
        let mut a = stat(1, 1.0, 1, 1);
        let mut b = stat(1, 1.0, 1, 1);
        b.ensure_children()
            .insert("x".to_string(), stat(1, 4.0, 4, 4));

        a.merge(&b, true);
        a.child_mut("x").unwrap().update(100);

        assert_eq!(b.child("x").unwrap().hits, 1);
    }

    #[test]
    fn test_deep_copy_round_trip() {
        let mut s = stat(4, 12.5, 3, 40);
        s.err = 2;
        let mut nested = stat(2, 6.0, 2, 10);
        nested.ensure_children();
        s.ensure_children().insert("inner".to_string(), nested);

        assert_eq!(s.deep_copy(true), s);
    }

    #[test]
    fn test_deep_copy_preserves_none_vs_empty() {
        let leaf = stat(1, 5.0, 5, 5);
        assert!(leaf.deep_copy(true).children.is_none());

        let mut marked = stat(1, 5.0, 5, 5);
        marked.ensure_children();
        let copy = marked.deep_copy(true);
        assert_eq!(copy.children, Some(HashMap::new()));
        assert_eq!(copy, marked);
    }

    #[test]
    fn test_deep_copy_top_level_only() {
        let mut s = stat(1, 5.0, 5, 5);
        s.ensure_children()
            .insert("x".to_string(), stat(1, 1.0, 1, 1));

        let copy = s.deep_copy(false);
        assert_eq!(copy.children, Some(HashMap::new()));
        assert_eq!(copy.hits, 1);
    }

    #[test]
    fn test_empty_stat() {
        let s = Stat::empty_stat();
        assert_eq!(s.max, 0);
        assert_eq!(s.hits, 0);
        assert!(s.is_set());
    }

    #[test]
    fn test_serde_keeps_children_marker() {
        let mut s = stat(1, 5.0, 5, 5);
        s.ensure_children();
        let json = serde_json::to_string(&s).unwrap();
        let parsed: Stat = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.children, Some(HashMap::new()));

        let leaf = stat(1, 5.0, 5, 5);
        let json = serde_json::to_string(&leaf).unwrap();
        assert!(!json.contains("children"));
    }
}
