//! deepscan CLI: dataset splitting, training and evaluation for REAL vs FAKE
//! face classification.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// deepscan: partition, train and evaluate a real-vs-synthetic face classifier
#[derive(Parser, Debug)]
#[command(name = "deepscan", version, about, long_about = None)]
struct Cli {
    /// Workspace directory; relative paths in the configuration resolve against it
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (layered over deepscan.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Split the raw image tree into SEED, VALIDATION and POOL
    Split {
        /// Raw directory with real/ and fake/ (defaults to data.raw_dir)
        #[arg(long)]
        raw: Option<PathBuf>,
        /// Output layout root (defaults to data.dataset_dir)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Random seed (defaults to partition.random_seed)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Check the partitioned layout for integrity violations
    Check,
    /// Report per-partition class balance
    Balance,
    /// Print per-partition counts and the label index mapping
    Inspect,
    /// Train the baseline classifier on SEED, validating on VALIDATION
    Train {
        /// Override the configured epoch budget
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Evaluate a checkpoint against a partition
    Evaluate {
        /// Partition to evaluate: seed, validation or pool
        #[arg(short, long, default_value = "validation")]
        partition: String,
        /// Checkpoint file (defaults to the latest published checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Classify one or more images
    Predict {
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Checkpoint file (defaults to the latest published checkpoint)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Write a default deepscan.toml into the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = deepscan_ml::config::user_dirs()
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deepscan.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
