// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rebuilding rollups from raw snapshots.

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::storage::{Storage, StatsFilter, StorageResult, TieredStorage};

/// Outcome of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub types: Vec<String>,
    pub replayed: usize,
    pub failed: usize,
}

/// Replay every raw snapshot of `source` in `[from, to]` into the rollups of
/// `target`.
///
/// `target` must be in aggregate-only mode so the raw snapshots are not
/// stored twice. Snapshots are grouped by application type, and untyped
/// snapshots are skipped. A snapshot that fails to load or save is counted
/// and logged, and the run continues.
pub fn backfill(
    source: &dyn Storage,
    target: &TieredStorage,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    app_type: Option<&str>,
    progress: &ProgressBar,
) -> StorageResult<BackfillSummary> {
    if !target.is_aggregate_only() {
        return Err(StorageError::InvalidArgument(
            "backfill target must be aggregate-only".to_string(),
        ));
    }

    let range = StatsFilter::range(from, to);
    let types = match app_type {
        Some(app_type) => vec![app_type.to_string()],
        None => source.find_filters(&range)?.types,
    };
    info!(types = ?types, %from, %to, "Backfilling rollups");

    let mut summary = BackfillSummary {
        types: types.clone(),
        ..BackfillSummary::default()
    };
    for app_type in &types {
        let ids = source.find(&range.clone().with_type(app_type.as_str()))?;
        progress.inc_length(ids.len() as u64);
        progress.set_message(app_type.clone());

        for id in ids {
            let outcome = source
                .load(&id)
                .and_then(|stats| stats.ok_or_else(|| StorageError::NotFound(id.clone())))
                .and_then(|stats| target.save(&stats, None, Some(app_type)));
            match outcome {
                Ok(_) => summary.replayed += 1,
                Err(e) => {
                    warn!(id = %id, app_type = %app_type, error = %e, "Failed to replay snapshot");
                    summary.failed += 1;
                }
            }
            progress.inc(1);
        }
    }

    info!(replayed = summary.replayed, failed = summary.failed, "Backfill finished");
    Ok(summary)
}
