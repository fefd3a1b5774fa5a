//! CLI parser and command dispatch.

mod commands;
mod helpers;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use lotacquire::config::Config;
use lotacquire::models::{RunParams, DEFAULT_MAX_PAGES};

#[derive(Parser)]
#[command(name = "lot")]
#[command(about = "Vehicle auction listing acquisition and archival")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check for the verbose flag before the parser runs, so logging can be
/// initialized first.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a source: search its targets, then optionally fetch details
    Run {
        /// Source key from the config file
        source: String,

        /// Only targets for this model (name or slug)
        #[arg(long)]
        model: Option<String>,

        /// Only targets with this trim
        #[arg(long)]
        trim: Option<String>,

        /// Load-more pages per target (capped at 50)
        #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
        max_pages: u32,

        /// Keep only sold listings
        #[arg(long)]
        only_sold: bool,

        /// Fetch each new listing's detail page
        #[arg(long)]
        details: bool,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List configured sources
    Sources,
    /// List the scrape targets of a source
    Targets {
        source: String,
    },
    /// Delete expired archive entries and their blobs
    Cleanup,
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from_path(&path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(Config::load().await),
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config).await?;

    match cli.command {
        Commands::Run {
            source,
            model,
            trim,
            max_pages,
            only_sold,
            details,
            json,
        } => {
            let params = RunParams {
                model,
                trim,
                max_pages,
                only_sold,
                fetch_details: details,
            };
            commands::cmd_run(&config, &source, &params, json).await
        }
        Commands::Sources => commands::cmd_sources(&config),
        Commands::Targets { source } => commands::cmd_targets(&config, &source),
        Commands::Cleanup => commands::cmd_cleanup(&config).await,
    }
}
