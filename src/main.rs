// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! stackstat entry point: offline commands over persisted statistics.

use std::path::PathBuf;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use stackstat::cli::{self, parse_date, OutputFormat};
use stackstat::config;
use stackstat::histogram;
use stackstat::storage::{Storage, StatsFilter};
use stackstat::telemetry::{init_telemetry, TelemetryConfig};

/// stackstat version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of histogram points.
const DEFAULT_POINTS: usize = 100;

/// stackstat - call-tree statistics, offline.
#[derive(Parser)]
#[command(name = "stackstat")]
#[command(author, version, about = "Inspect and maintain persisted call statistics", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log filter directive, overrides RUST_LOG (e.g. "stackstat=debug")
    #[arg(long, env = "STACKSTAT_LOG", global = true)]
    log_filter: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Query range shared by most commands.
#[derive(clap::Args)]
struct Range {
    /// Range start (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_date)]
    from: DateTime<Utc>,

    /// Range end (YYYY-MM-DD or RFC 3339)
    #[arg(long, value_parser = parse_date)]
    to: DateTime<Utc>,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild day/week/month rollups from raw snapshots
    Backfill {
        /// Database holding the raw snapshots
        #[arg(long)]
        source: PathBuf,

        /// Database receiving the rollups (may equal the source)
        #[arg(long)]
        target: PathBuf,

        #[command(flatten)]
        range: Range,

        /// Only this application type
        #[arg(long = "type")]
        app_type: Option<String>,

        /// Suppress the progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print stats aggregated over a range
    Report {
        /// Tiered database
        #[arg(long, env = "STACKSTAT_DB")]
        db: PathBuf,

        #[command(flatten)]
        range: Range,

        /// Only this instance (ignored by rollup tiers)
        #[arg(long)]
        instance: Option<String>,

        /// Only this application type
        #[arg(long = "type")]
        app_type: Option<String>,

        /// Skip nested calls
        #[arg(long)]
        top_level_only: bool,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List instances and application types seen in a range
    Filters {
        /// Tiered database
        #[arg(long, env = "STACKSTAT_DB")]
        db: PathBuf,

        #[command(flatten)]
        range: Range,

        /// Restrict the instance list to this type
        #[arg(long = "type")]
        app_type: Option<String>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the down-sampled history of one operation
    Histogram {
        /// Tiered database
        #[arg(long, env = "STACKSTAT_DB")]
        db: PathBuf,

        /// Operation id
        #[arg(long)]
        id: String,

        #[command(flatten)]
        range: Range,

        /// Only this application type
        #[arg(long = "type")]
        app_type: Option<String>,

        /// Number of points to keep
        #[arg(long, default_value_t = DEFAULT_POINTS)]
        points: usize,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the resolved agent configuration for a directory
    Config {
        /// Application directory (defaults to the current one)
        dir: Option<PathBuf>,

        /// Read this file instead of searching the directory
        #[arg(long, conflicts_with = "dir")]
        file: Option<PathBuf>,
    },

    /// Write a default stackstat.json
    Init {
        /// Application directory (defaults to the current one)
        dir: Option<PathBuf>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_telemetry(
        &TelemetryConfig::from_verbosity(cli.verbose)
            .with_filter(cli.log_filter)
            .with_ansi(!cli.no_color),
    )?;

    match cli.command {
        Commands::Backfill {
            source,
            target,
            range,
            app_type,
            quiet,
        } => {
            // SQLite work is blocking
            tokio::task::spawn_blocking(move || {
                run_backfill(source, target, range, app_type, quiet)
            })
            .await??;
        }
        Commands::Report {
            db,
            range,
            instance,
            app_type,
            top_level_only,
            format,
        } => {
            let storage = cli::open_tiered(&db)?;
            let mut filter = StatsFilter::range(range.from, range.to);
            filter.instance = instance;
            filter.app_type = app_type;
            let stats = storage.load_aggregated(top_level_only, &filter)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => println!("{}", cli::render_report(&stats, top_level_only)),
            }
        }
        Commands::Filters {
            db,
            range,
            app_type,
            format,
        } => {
            let storage = cli::open_tiered(&db)?;
            let mut filter = StatsFilter::range(range.from, range.to);
            filter.app_type = app_type;
            let filters = storage.find_filters(&filter)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&filters)?),
                OutputFormat::Text => println!("{}", cli::render_filters(&filters)),
            }
        }
        Commands::Histogram {
            db,
            id,
            range,
            app_type,
            points,
            format,
        } => {
            let storage = cli::open_tiered(&db)?;
            let mut filter = StatsFilter::range(range.from, range.to);
            filter.app_type = app_type;

            let mut histogram = storage.load_histogram(&id, &filter, None)?;
            while let Some(last) = histogram.last_group_id.take() {
                let page = storage.load_histogram(&id, &filter, Some(&last))?;
                histogram.points.extend(page.points);
                histogram.last_group_id = page.last_group_id;
            }
            histogram.points = histogram::reduce(points, &histogram.points)?;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&histogram)?),
                OutputFormat::Text => println!("{}", cli::render_histogram(&histogram)),
            }
        }
        Commands::Config { dir, file } => {
            let config = match (file, dir) {
                (Some(file), _) => config::load_config_from(&file)?,
                (None, Some(dir)) => config::load_config(&dir)?,
                (None, None) => config::load_config(&std::env::current_dir()?)?,
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Init { dir, force } => {
            let dir = match dir {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let path = config::init_config(&dir, force)?;
            println!("{} {}", "Created".green().bold(), path.display());
        }
        Commands::Version => {
            println!("stackstat {}", VERSION);
        }
    }
    Ok(())
}

fn run_backfill(
    source: PathBuf,
    target: PathBuf,
    range: Range,
    app_type: Option<String>,
    quiet: bool,
) -> anyhow::Result<()> {
    let raw = cli::open_raw(&source)
        .with_context(|| format!("opening source database {}", source.display()))?;
    let tiered = cli::open_tiered(&target)
        .with_context(|| format!("opening target database {}", target.display()))?
        .with_aggregate_only(true);

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=> "),
        );
        bar
    };

    let summary = cli::backfill(
        &raw,
        &tiered,
        range.from,
        range.to,
        app_type.as_deref(),
        &progress,
    )?;
    progress.finish_and_clear();

    println!(
        "{} {} snapshots across {} types",
        "Replayed".green().bold(),
        summary.replayed,
        summary.types.len()
    );
    if summary.failed > 0 {
        println!("{} {} snapshots failed, see log", "Warning:".yellow().bold(), summary.failed);
    }
    Ok(())
}
