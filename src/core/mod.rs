// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Call tree capture and in-memory aggregation.
//!
//! - [`CallStack`] builds a [`Context`] tree for one caller
//! - [`CurrentStats`] queues finished trees and merges them into [`Stats`]
//! - [`CurrentStatsAsyncTasks`] runs the collector and saver in the background
//! - [`Monitor`] ties them together with configuration and storage

mod call_stack;
mod clock;
mod context;
mod current;
mod monitor;
mod stat;
mod stats;
mod tasks;

pub use call_stack::CallStack;
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{normalize_id, Context, EMPTY_ID, NULL_ID};
pub use current::CurrentStats;
pub use monitor::Monitor;
pub use stat::Stat;
pub use stats::{Stats, DEFAULT_MAX_STAT_COUNT};
pub use tasks::CurrentStatsAsyncTasks;
