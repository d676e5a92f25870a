mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use pqextract_engine::config::{self, ConfigError};
use pqextract_engine::{
    Orchestrator, ParquetBatchWriter, PipelineConfig, PostgresConnector, RunSummary,
};

#[derive(Parser)]
#[command(
    name = "pqextract",
    version,
    about = "Extract a SQL query's result set into batched Parquet files"
)]
struct Cli {
    /// Path to the YAML config file (created with defaults if missing)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory for run logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(&cli) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: &Cli) -> Result<RunSummary> {
    // 1. Resolve config; problems are recovered and reported once logging is up
    let resolved = config::resolve(&cli.config);
    let config = resolved.config;

    // 2. Logging
    let log_path = match logging::init(&cli.log_dir, &config.output.extract_name, &cli.log_level)
    {
        Ok(path) => path,
        Err(err) => {
            logging::write_fallback(&cli.log_dir, "logging", &format!("{err:#}"));
            return Err(err);
        }
    };
    tracing::info!("Logging initialized. Log file: {}", log_path.display());
    report_resolution(&cli.config, resolved.created_default, &resolved.warnings);

    // 3. Run
    run(config)
}

/// Emit the deferred config-resolution notices through the run log.
fn report_resolution(path: &Path, created_default: bool, warnings: &[ConfigError]) {
    if created_default {
        tracing::info!(
            "Created default config file {}; review it before the next run",
            path.display()
        );
    }
    for warning in warnings {
        tracing::warn!("{warning}");
    }
}

fn run(config: PipelineConfig) -> Result<RunSummary> {
    let orchestrator = Orchestrator::new(config, PostgresConnector, ParquetBatchWriter::new());
    orchestrator
        .run()
        .with_context(|| format!("Extract '{}' failed", orchestrator.config().output.extract_name))
}

fn print_summary(summary: &RunSummary) {
    println!("Extract completed successfully.");
    println!("  Records written: {}", summary.total_records);
    println!("  Files written:   {}", summary.batches_written);
    println!("  Bytes written:   {}", format_bytes(summary.bytes_written()));
    println!("  Duration:        {:.2}s", summary.duration_secs);
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
