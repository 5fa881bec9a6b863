// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plain-text rendering of query results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use colored::Colorize;

use crate::core::{Stat, Stats};
use crate::storage::{Filters, Histogram};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

fn date(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Entries ordered by hits, busiest first.
fn by_hits(map: &HashMap<String, Stat>) -> Vec<(&String, &Stat)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| b.1.hits.cmp(&a.1.hits).then_with(|| a.0.cmp(b.0)));
    entries
}

fn stat_row(indent: usize, id: &str, stat: &Stat) -> String {
    let name = format!("{}{}", "  ".repeat(indent), id);
    let err = if stat.err > 0 {
        stat.err.to_string().red().to_string()
    } else {
        stat.err.to_string()
    };
    format!(
        "{:<48} {:>10} {:>8} {:>8} {:>8} {:>8}",
        name,
        stat.hits,
        err,
        stat.min,
        stat.max,
        stat.avg_rounded()
    )
}

fn push_tree(lines: &mut Vec<String>, indent: usize, map: &HashMap<String, Stat>) {
    for (id, stat) in by_hits(map) {
        lines.push(stat_row(indent, id, stat));
        if let Some(children) = &stat.children {
            push_tree(lines, indent + 1, children);
        }
    }
}

/// Table of aggregated stats, nested calls indented under their parent.
pub fn render_report(stats: &Stats, top_level_only: bool) -> String {
    let mut lines = vec![format!(
        "{} {} .. {}",
        "Window".bold(),
        date(stats.start_date),
        date(stats.end_date)
    )];
    if let Some(info) = &stats.info {
        lines.push(format!("{} {}", "Source".bold(), info.dimmed()));
    }
    if stats.lost > 0 {
        lines.push(format!("{} {}", "Lost".bold(), stats.lost.to_string().yellow()));
    }
    if let Some(fatal) = &stats.fatal_error {
        lines.push(format!("{} {}", "Fatal".bold(), fatal.red()));
    }

    if stats.is_empty() {
        lines.push("No stats in range".dimmed().to_string());
        return lines.join("\n");
    }

    lines.push(String::new());
    lines.push(
        format!(
            "{:<48} {:>10} {:>8} {:>8} {:>8} {:>8}",
            "ID", "HITS", "ERR", "MIN", "MAX", "AVG"
        )
        .bright_cyan()
        .to_string(),
    );
    for (id, stat) in by_hits(&stats.map) {
        lines.push(stat_row(0, id, stat));
        if !top_level_only {
            if let Some(children) = &stat.children {
                push_tree(&mut lines, 1, children);
            }
        }
    }
    lines.join("\n")
}

pub fn render_filters(filters: &Filters) -> String {
    let list = |values: &[String]| {
        if values.is_empty() {
            "  (none)".dimmed().to_string()
        } else {
            values
                .iter()
                .map(|v| format!("  {}", v))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };
    format!(
        "{}\n{}\n{}\n{}",
        "Instances".bold(),
        list(&filters.instances),
        "Types".bold(),
        list(&filters.types)
    )
}

/// One line per point.
pub fn render_histogram(histogram: &Histogram) -> String {
    let mut lines = vec![format!("{} {}", "History of".bold(), histogram.id.bright_white())];
    if histogram.points.is_empty() {
        lines.push("No points in range".dimmed().to_string());
    } else {
        lines.push(
            format!(
                "{:<17} {:<17} {:>10} {:>8} {:>8} {:>8} {:>8}",
                "START", "END", "HITS", "ERR", "MIN", "MAX", "AVG"
            )
            .bright_cyan()
            .to_string(),
        );
        for point in &histogram.points {
            lines.push(format!(
                "{:<17} {:<17} {:>10} {:>8} {:>8} {:>8} {:>8}",
                date(point.start_date),
                date(point.end_date),
                point.hits,
                point.err,
                point.min,
                point.max,
                point.avg
            ));
        }
    }
    if let Some(last) = &histogram.last_group_id {
        lines.push(format!("{} {}", "More points after".dimmed(), last));
    }
    lines.join("\n")
}
