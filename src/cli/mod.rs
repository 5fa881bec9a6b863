// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Offline commands over persisted statistics.
//!
//! The `stackstat` binary parses arguments and calls into these modules.

mod backfill;
mod render;

pub use backfill::{backfill, BackfillSummary};
pub use render::{render_filters, render_histogram, render_report};

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::StorageConfig;
use crate::storage::{create_tiered, SqliteStorage, StorageResult, TieredStorage};

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Parse an RFC 3339 timestamp or a plain `YYYY-MM-DD` date (midnight UTC).
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date '{}', expected YYYY-MM-DD or RFC 3339", value))
}

/// Open the raw tables of a database.
pub fn open_raw(db: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::open(db, "")
}

/// Open every tier of a database.
pub fn open_tiered(db: &Path) -> StorageResult<TieredStorage> {
    create_tiered(&StorageConfig::tiered(db))
}
