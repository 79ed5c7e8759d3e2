//! Chaintracks CLI Application
//!
//! A command-line interface for the block header tracker.

use chaintracks::cli::{self, AppState};
use chaintracks::config::{Network, TrackerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "chaintracks")]
#[command(version)]
#[command(about = "Block header chain tracker", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network to track (main, test, or another archive name)
    #[arg(short, long)]
    network: Option<Network>,

    /// Data directory for header storage
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Base URL of the bulk header archive
    #[arg(long)]
    cdn_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load archived headers into the local chain
    Bootstrap {
        /// Read the archive from a local folder instead of the CDN
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },

    /// Display chain information
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a header (the tip by default)
    Header {
        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        hash: Option<String>,
    },

    /// List active headers
    Range {
        #[arg(short, long)]
        start: u32,

        #[arg(short, long, default_value = "10")]
        count: u32,

        /// Print the concatenated 80-byte records as hex
        #[arg(long)]
        raw: bool,
    },

    /// Submit hex-encoded headers, one per line
    Observe {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Move deep headers into the bulk archive tables
    Compact,
}

fn load_config(cli: &Cli) -> Result<TrackerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(network) = &cli.network {
        config.network = network.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(url) = &cli.cdn_url {
        config.cdn_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let state = AppState::open(config).await?;

    match cli.command {
        Commands::Bootstrap { archive_dir } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Interrupt received, stopping bootstrap");
                    on_signal.cancel();
                }
            });
            cli::cmd_bootstrap(&state, archive_dir, cancel).await?;
        }

        Commands::Info { json } => {
            cli::cmd_info(&state, json).await?;
        }

        Commands::Header { height, hash } => {
            cli::cmd_header(&state, height, hash.as_deref()).await?;
        }

        Commands::Range { start, count, raw } => {
            cli::cmd_range(&state, start, count, raw).await?;
        }

        Commands::Observe { input } => {
            cli::cmd_observe(&state, input.as_deref()).await?;
        }

        Commands::Compact => {
            cli::cmd_compact(&state).await?;
        }
    }

    Ok(())
}
