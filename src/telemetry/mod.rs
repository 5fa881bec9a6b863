// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging setup for the agent and its CLI.
//!
//! The library only emits `tracing` events. Embedding applications install
//! their own subscriber; the `stackstat` binary uses [`init_telemetry`].
//!
//! ```rust,ignore
//! use stackstat::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::from_verbosity(1))?;
//! ```
//!
//! Events worth knowing about:
//!
//! - `info`: monitor start/stop, successful saves, storage creation
//! - `warn`: failed saves and cleanups, rollup conflicts
//! - `error`: a crashed background worker
//! - `debug`/`trace`: worker scheduling and per-pass counts

mod init;

pub use init::{init_telemetry, TelemetryConfig};
