//! Tabflow CLI: run, validate and inspect tabular pipelines.

mod commands;
mod presets;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Tabflow: extract, transform and load tabular data
#[derive(Parser, Debug)]
#[command(name = "tabflow", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a pipeline definition (TOML or JSON)
    Run {
        /// Definition file
        definition: PathBuf,

        /// Write the run report as JSON to this path
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Bypass the transformer cache for this run
        #[arg(long)]
        no_cache: bool,
    },
    /// Check a definition without running it
    Validate {
        /// Definition file
        definition: PathBuf,
    },
    /// Run a built-in soccer statistics pipeline
    Preset {
        /// Which preset to run
        #[arg(value_enum)]
        kind: PresetKind,

        /// Input CSV file
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV file
        #[arg(short, long)]
        output: PathBuf,

        /// Bypass the transformer cache for this run
        #[arg(long)]
        no_cache: bool,
    },
    /// Inspect or clean the transformer cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum PresetKind {
    Players,
    Teams,
    Matches,
}

#[derive(clap::Subcommand, Debug)]
enum CacheAction {
    /// Show entry counts and size
    Stats {
        /// Cache directory
        #[arg(short, long, default_value = tabflow_core::pipeline::DEFAULT_CACHE_DIR)]
        dir: PathBuf,
    },
    /// Delete expired and unreadable entries
    Prune {
        /// Cache directory
        #[arg(short, long, default_value = tabflow_core::pipeline::DEFAULT_CACHE_DIR)]
        dir: PathBuf,
    },
    /// Delete every entry
    Clear {
        /// Cache directory
        #[arg(short, long, default_value = tabflow_core::pipeline::DEFAULT_CACHE_DIR)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "tabflow", "tabflow")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "tabflow.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command).await
}
