//! Binary entry point for hashwatch.
//!
//! This binary provides the CLI interface to the hashwatch store.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::{Parser, Subcommand};
use commands::MinerAction;
use hashwatch::config::{CONFIG_PATH_ENV, MonitorConfig};
use hashwatch::observability::{self, InitOptions};
use std::path::PathBuf;
use std::process::ExitCode;

/// Hashwatch - monitoring storage for home cryptocurrency miners.
#[derive(Parser)]
#[command(name = "hashwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Database file, overriding the configuration.
    #[arg(long, global = true, env = "HASHWATCH_DATABASE_PATH")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database and register configured miners.
    Init,

    /// Store a recorded miner reading (JSON snapshot file).
    Ingest {
        /// Miner id the reading belongs to.
        miner_id: String,

        /// Snapshot file with `metrics`, `status` and optional `timestamp`.
        file: PathBuf,

        /// Override the snapshot timestamp (ISO-8601).
        #[arg(short, long)]
        timestamp: Option<String>,
    },

    /// Show the newest value of every metric for a miner.
    Latest {
        /// Miner id.
        miner_id: String,

        /// Also show the newest status snapshot.
        #[arg(short, long)]
        status: bool,
    },

    /// List raw samples in a time range.
    Raw {
        /// Miner id.
        miner_id: String,

        /// Range start (ISO-8601); defaults to 24 hours before the end.
        #[arg(short, long)]
        start: Option<String>,

        /// Range end (ISO-8601); defaults to now.
        #[arg(short, long)]
        end: Option<String>,

        /// Restrict to these metric types (repeatable).
        #[arg(short, long = "metric")]
        metrics: Vec<String>,
    },

    /// Show bucketed min/avg/max over a time range.
    Aggregate {
        /// Miner id.
        miner_id: String,

        /// Range start (ISO-8601); defaults to 24 hours before the end.
        #[arg(short, long)]
        start: Option<String>,

        /// Range end (ISO-8601); defaults to now.
        #[arg(short, long)]
        end: Option<String>,

        /// Bucket width, e.g. `5m`, `1h`, `1d`.
        #[arg(short, long, default_value = "1h")]
        interval: String,

        /// Restrict to these metric types (repeatable).
        #[arg(short, long = "metric")]
        metrics: Vec<String>,
    },

    /// Delete samples older than the retention window.
    Cleanup {
        /// Retention window in days; defaults to the configured value.
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Manage registered miners.
    Miners {
        #[command(subcommand)]
        action: MinerAction,
    },

    /// Show the effective configuration.
    Config,

    /// Run pool health checks, cache sweeps and retention until Ctrl-C.
    ///
    /// Serves Prometheus metrics when metrics are enabled.
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };
    let config = match &cli.database {
        Some(path) => config.with_database_path(path),
        None => config,
    };

    let expose_metrics = matches!(cli.command, Commands::Watch);
    let _observability = match observability::init_from_config(
        &config.observability,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: expose_metrics,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Loads configuration from an explicit path, `HASHWATCH_CONFIG_PATH`, or
/// the default locations, then applies environment overrides.
fn load_config(path: Option<&str>) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => MonitorConfig::load_from_file(std::path::Path::new(path))?,
        None => match std::env::var(CONFIG_PATH_ENV) {
            Ok(env_path) => MonitorConfig::load_from_file(std::path::Path::new(&env_path))?,
            Err(_) => MonitorConfig::load_default(),
        },
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run_command(cli: Cli, config: MonitorConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Init => commands::cmd_init(&config).await,

        Commands::Ingest {
            miner_id,
            file,
            timestamp,
        } => commands::cmd_ingest(&config, miner_id, file, timestamp).await,

        Commands::Latest { miner_id, status } => {
            commands::cmd_latest(&config, miner_id, status).await
        },

        Commands::Raw {
            miner_id,
            start,
            end,
            metrics,
        } => commands::cmd_raw(&config, miner_id, start, end, metrics).await,

        Commands::Aggregate {
            miner_id,
            start,
            end,
            interval,
            metrics,
        } => commands::cmd_aggregate(&config, miner_id, start, end, interval, metrics).await,

        Commands::Cleanup { days } => commands::cmd_cleanup(&config, days).await,

        Commands::Miners { action } => commands::cmd_miners(&config, action).await,

        Commands::Config => commands::cmd_config(&config),

        Commands::Watch => commands::cmd_watch(&config).await,
    }
}
