// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! stackstat - in-process call-tree statistics.
//!
//! Instrumented code opens and closes named scopes on a per-caller
//! [`CallStack`]. Each finished call tree is queued without blocking, merged
//! in the background into a bounded statistics window, and periodically
//! persisted. A tiered storage keeps raw snapshots next to daily, weekly and
//! monthly rollups so long ranges stay cheap to query.
//!
//! # Architecture
//!
//! - [`core`] - call stacks, the statistics window and its background workers
//! - [`storage`] - the storage boundary, drivers and the tiered rollup storage
//! - [`histogram`] - down-sampling of snapshot series
//! - [`config`] - configuration files and environment overrides
//! - [`telemetry`] - log output for the binary
//! - [`cli`] - offline commands used by the `stackstat` binary
//! - [`error`] - error types and result aliases
//!
//! # Example
//!
//! ```rust,ignore
//! use stackstat::{Monitor, MonitorConfig};
//!
//! let monitor = Monitor::from_config(MonitorConfig::enabled())?;
//! let mut stack = monitor.call_stack();
//! stack.enter("OrderService.place")?;
//! // ...
//! stack.exit(false)?;
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod histogram;
pub mod storage;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use crate::core::{CallStack, Context, Monitor, Stat, Stats};
pub use config::{MonitorConfig, StorageConfig, StorageKind};
pub use error::{ConfigError, HistogramError, MonitorError, Result, StorageError};
pub use storage::{Storage, StatsFilter, TieredStorage};

/// stackstat version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
