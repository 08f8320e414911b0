//! orglink: link a segmentation snapshot into persistent objects.
//!
//! Reads a JSON snapshot of segmentation records, links organoids across
//! imaging rounds or cells across z-stack planes, and prints per-partition
//! diagnostics. Useful for:
//!
//! - Checking how many objects a well resolves to
//! - Tuning similarity thresholds and distance cutoffs
//! - Spotting rounds whose drift could not be estimated
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin orglink -- [OPTIONS] <SNAPSHOT_PATH>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{error, info};
use orglink_pipeline::{
    Clock, Execution, LinkingConfig, LinkingMode, MemorySink, ObjectIdAllocator,
    PartitionOutcome, RoundLinkingConfig, RunSummary, Snapshot, StackLinkingConfig, link_all,
};
use serde::Serialize;

/// Largest log file before rotation.
const MAX_LOG_FILE_SIZE_BYTES: u64 = 1024 * 1024;

/// Rotated log files kept on disk.
const MAX_LOG_FILES: usize = 5;

/// Link segmentations across imaging rounds or z-stack planes.
///
/// Reads a snapshot of segmentation records, runs the linking pipeline per
/// partition and prints per-stage diagnostics.
#[derive(Parser)]
#[command(name = "orglink", version)]
struct Cli {
    /// Path to the JSON snapshot.
    snapshot_path: PathBuf,

    /// What to link.
    #[arg(long, value_enum, default_value_t = Mode::Rounds)]
    mode: Mode,

    /// Similarity threshold for accepting a link (defaults per mode).
    #[arg(long)]
    min_similarity: Option<f64>,

    /// Bounding-box margin for candidate pairs.
    #[arg(long, default_value_t = RoundLinkingConfig::DEFAULT_BBOX_MARGIN)]
    bbox_margin: f64,

    /// Shift-corrected distance cutoff for round linking.
    #[arg(long, default_value_t = RoundLinkingConfig::DEFAULT_MAX_DISTANCE)]
    max_distance: f64,

    /// Largest z-index gap for stack linking.
    #[arg(long, default_value_t = StackLinkingConfig::DEFAULT_MAX_Z_GAP)]
    max_z_gap: i64,

    /// Full linking config as a JSON string.
    ///
    /// When provided, all other parameter flags are ignored.
    /// The JSON must be a valid `LinkingConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,

    /// Process partitions one at a time so object ids are reproducible.
    #[arg(long)]
    sequential: bool,

    /// Output decisions and diagnostics as JSON instead of a report.
    #[arg(long)]
    json: bool,

    /// Log specification, e.g. `info` or `warn,orglink_pipeline=debug`.
    ///
    /// `RUST_LOG` takes precedence when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write rotated log files into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Linking mode selection.
#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Organoids across imaging rounds.
    Rounds,
    /// Cells across z-stack planes.
    Stack,
}

impl From<Mode> for LinkingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Rounds => Self::Rounds,
            Mode::Stack => Self::Stack,
        }
    }
}

/// JSON output of a run.
#[derive(Serialize)]
struct RunOutput {
    summary: RunSummary,
    partitions: Vec<PartitionOutcome>,
}

/// Build a [`LinkingConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<LinkingConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    let mut config = LinkingConfig::default();
    config.rounds.bbox_margin = cli.bbox_margin;
    config.rounds.max_distance = cli.max_distance;
    config.stack.bbox_margin = cli.bbox_margin;
    config.stack.max_z_gap = cli.max_z_gap;
    if let Some(min) = cli.min_similarity {
        match cli.mode {
            Mode::Rounds => config.rounds.min_similarity = min,
            Mode::Stack => config.stack.min_similarity = min,
        }
    }
    Ok(config)
}

fn start_logger(cli: &Cli) -> Result<LoggerHandle, String> {
    let logger = Logger::try_with_env_or_str(&cli.log_level)
        .map_err(|e| format!("invalid log specification `{}`: {e}", cli.log_level))?
        .format(flexi_logger::detailed_format);
    let logger = match cli.log_dir {
        Some(ref dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("orglink"))
            .rotate(
                Criterion::Size(MAX_LOG_FILE_SIZE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(MAX_LOG_FILES),
            )
            .duplicate_to_stderr(Duplicate::Warn),
        None => logger.log_to_stderr(),
    };
    logger
        .start()
        .map_err(|e| format!("failed to start logger: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logger = match start_logger(&cli) {
        Ok(handle) => handle,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let text = match std::fs::read_to_string(&cli.snapshot_path) {
        Ok(text) => text,
        Err(e) => {
            error!("Error reading {}: {e}", cli.snapshot_path.display());
            return ExitCode::FAILURE;
        }
    };

    let records = match serde_json::from_str::<Snapshot>(&text)
        .map_err(|e| e.to_string())
        .and_then(|snapshot| snapshot.decode().map_err(|e| e.to_string()))
    {
        Ok(records) => records,
        Err(e) => {
            error!("Error decoding snapshot {}: {e}", cli.snapshot_path.display());
            return ExitCode::FAILURE;
        }
    };

    let mode = LinkingMode::from(cli.mode);
    info!(
        "snapshot {}: {} records, {mode} linking",
        cli.snapshot_path.display(),
        records.len()
    );

    let allocator = ObjectIdAllocator::after(records.iter().filter_map(|r| r.object_id));
    let execution = if cli.sequential {
        Execution::Sequential
    } else {
        Execution::Parallel
    };
    let sink = MemorySink::new();

    let result = link_all(
        records,
        mode,
        &config,
        &allocator,
        &sink,
        &StdClock,
        execution,
    );
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!("Linking failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        let output = RunOutput {
            summary,
            partitions: sink.into_outcomes(),
        };
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("Error serializing output: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", summary.report());
    }

    ExitCode::SUCCESS
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}
