// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber initialization.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How the binary's log output looks.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level used when neither `RUST_LOG` nor `filter_directive` is set.
    pub default_level: Level,

    /// Explicit filter, takes precedence over `RUST_LOG`.
    pub filter_directive: Option<String>,

    pub ansi_colors: bool,

    /// Multi-line events with file, line and span close timings.
    pub detailed: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            filter_directive: None,
            ansi_colors: true,
            detailed: false,
        }
    }
}

impl TelemetryConfig {
    /// Map a `-v` count to a level: 0 warn, 1 info, 2 debug, 3+ trace.
    /// Trace output is also detailed.
    pub fn from_verbosity(verbose: u8) -> Self {
        let default_level = match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self {
            default_level,
            detailed: verbose >= 3,
            ..Self::default()
        }
    }

    /// Use `filter` instead of `RUST_LOG`, if given.
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter_directive = filter.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Install the global subscriber. Logs go to stderr so reports on stdout
/// stay machine-readable.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<()> {
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_file(config.detailed)
        .with_line_number(config.detailed);

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let result = if config.detailed {
        registry
            .with(fmt_layer.with_span_events(FmtSpan::CLOSE))
            .try_init()
    } else {
        registry.with(fmt_layer.compact()).try_init()
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
