// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Down-sampling of time series for compact charts.
//!
//! A long range can hold thousands of snapshots. [`reduce`] keeps a fixed
//! number of them, spread as evenly as the data allows.

use chrono::{DateTime, Utc};

use crate::core::Stats;
use crate::error::HistogramError;
use crate::storage::StatHistory;

/// Anything with a start and end date.
pub trait Timestamped {
    fn start_date(&self) -> Option<DateTime<Utc>>;
    fn end_date(&self) -> Option<DateTime<Utc>>;

    /// Midpoint of start and end in milliseconds. A missing bound falls back
    /// to the other one.
    fn point(&self) -> Option<i64> {
        let start = self.start_date().or_else(|| self.end_date())?.timestamp_millis();
        let end = self.end_date().or_else(|| self.start_date())?.timestamp_millis();
        Some(start + (end - start) / 2)
    }
}

impl Timestamped for Stats {
    fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }
}

impl Timestamped for StatHistory {
    fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }
}

/// Pick at most `points` elements of `series` that best cover its time range.
///
/// The first and last elements are always kept. Each interior target takes
/// the nearest element, and an element is never taken twice, so sparse input
/// yields fewer than `points` results. Elements without any date are skipped
/// and `points` is capped at the number of dated elements. The result is in
/// timestamp order.
pub fn reduce<T: Timestamped + Clone>(points: usize, series: &[T]) -> Result<Vec<T>, HistogramError> {
    if points < 2 {
        return Err(HistogramError::TooFewPoints(points));
    }

    let mut ticks: Vec<(i64, usize)> = series
        .iter()
        .enumerate()
        .filter_map(|(index, item)| item.point().map(|point| (point, index)))
        .collect();
    ticks.sort_by_key(|&(point, _)| point);

    let (Some(&(min, first)), Some(&(max, last))) = (ticks.first(), ticks.last()) else {
        return Ok(Vec::new());
    };

    if ticks.len() == 1 {
        return Ok(vec![series[first].clone()]);
    }
    // at most one pick per element
    let points = points.min(ticks.len());

    let step = (max - min) / (points as i64 - 1);
    let mut selected = vec![first];
    for i in 1..points - 1 {
        let target = min + i as i64 * step;
        let mut best: Option<(usize, i64)> = None;
        for &(point, index) in &ticks {
            let distance = (target - point).abs();
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }
        if let Some((index, _)) = best {
            if !selected.contains(&index) {
                selected.push(index);
            }
        }
    }
    if !selected.contains(&last) {
        selected.push(last);
    }

    Ok(selected.into_iter().map(|index| series[index].clone()).collect())
}
