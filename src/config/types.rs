// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Defines the monitor and storage settings, supporting JSON and YAML formats.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::DEFAULT_MAX_STAT_COUNT;
use crate::error::ConfigError;

/// Default bound of the hand-off queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100_000;

/// Default maximum operation id length in characters.
pub const DEFAULT_MAX_ID_LENGTH: usize = 100;

/// Default minutes between saves.
pub const DEFAULT_SAVE_FREQ_MINUTES: i64 = 15;

/// Default retention of raw snapshots in days.
pub const DEFAULT_DAYS_TO_KEEP: i64 = 35;

/// Default collector batching delay in milliseconds.
pub const DEFAULT_COLLECT_DELAY_MS: u64 = 100;

/// Instance name used when no host name can be found.
pub const UNKNOWN_HOST: &str = "unknown_host";

/// Host name from the environment, or [`UNKNOWN_HOST`].
pub fn default_app_instance() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string())
}

/// Monitor configuration.
/// Can be defined in stackstat.json or stackstat.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Whether instrumentation records anything
    pub enabled: bool,

    /// Distinct stats kept per window, across all tree depths
    pub max_stat_count: u64,

    /// Finished call trees waiting to be merged
    pub max_queue_size: usize,

    /// Operation ids are truncated to this many characters
    pub max_id_length: usize,

    /// Minutes between saves; 0 or less disables saving
    pub save_freq_minutes: i64,

    /// Days of raw snapshots to keep; 0 or less disables cleanup
    pub days_to_keep: i64,

    /// Also record every sub-call as a top-level stat
    pub aggregate_sub_calls: bool,

    /// Application type used to partition saved data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,

    /// Application instance used to partition raw snapshots
    pub app_instance: String,

    /// Collector waits this long before draining, to batch work
    pub collect_delay_ms: u64,

    /// Where windows are persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_stat_count: DEFAULT_MAX_STAT_COUNT,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_id_length: DEFAULT_MAX_ID_LENGTH,
            save_freq_minutes: DEFAULT_SAVE_FREQ_MINUTES,
            days_to_keep: DEFAULT_DAYS_TO_KEEP,
            aggregate_sub_calls: true,
            app_type: None,
            app_instance: default_app_instance(),
            collect_delay_ms: DEFAULT_COLLECT_DELAY_MS,
            storage: None,
        }
    }
}

impl MonitorConfig {
    /// Default configuration with monitoring switched on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::invalid("maxQueueSize", "must be greater than 0"));
        }
        if self.max_id_length == 0 {
            return Err(ConfigError::invalid("maxIdLength", "must be greater than 0"));
        }
        if let Some(storage) = &self.storage {
            storage.validate()?;
        }
        Ok(())
    }
}

/// Storage driver selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process only, lost on exit
    #[default]
    Memory,
    /// One SQLite table set
    Sqlite,
    /// SQLite raw tier plus daily, weekly and monthly rollup tables
    Tiered,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Driver to use
    #[serde(default)]
    pub kind: StorageKind,

    /// Database file; in-memory SQLite when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Prefix for every table name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub table_prefix: String,

    /// Snapshots returned per SQLite histogram page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram_page_size: Option<usize>,
}

impl StorageConfig {
    /// Tiered SQLite storage in `path`.
    pub fn tiered(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Tiered,
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::invalid(
                "storage.tablePrefix",
                "may only contain letters, digits and '_'",
            ));
        }
        if self.histogram_page_size == Some(0) {
            return Err(ConfigError::invalid(
                "storage.histogramPageSize",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}
