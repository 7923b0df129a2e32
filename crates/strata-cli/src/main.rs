mod maintenance;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::maintenance::Maintenance;

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Strata - recorder database maintenance"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding config.yml or config.toml
    #[arg(long, global = true, env = "STRATA_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show schema version, migration state and the active recorder run
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Bring the schema to the current version, then validate and repair it
    Migrate {
        /// Clear a marker left by an interrupted migration and continue
        #[arg(long)]
        resume: bool,
        /// Move a corrupt database aside and create a new one
        #[arg(long)]
        quarantine_corrupt: bool,
    },

    /// Probe the schema for known defects
    Validate {
        /// Repair the defects found
        #[arg(long)]
        repair: bool,
    },

    /// Delete rows older than the retention period
    Purge {
        /// Retention in days, overriding purge.keep_days
        #[arg(long)]
        keep_days: Option<u32>,

        /// Compact the database after purging
        #[arg(long)]
        repack: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = match cli.config_dir {
        Some(dir) => strata_config::ConfigLoader::with_dir(dir),
        None => strata_config::ConfigLoader::new()?,
    };
    config_loader.ensure_dirs()?;
    let config = config_loader.load()?;

    let log_level = cli
        .log_level
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let maintenance = Maintenance::new(&config_loader, config);
    let command = cli.command;

    // The storage layer is synchronous; keep it off the runtime threads.
    tokio::task::spawn_blocking(move || run(&maintenance, command))
        .await
        .context("maintenance task panicked")?
}

fn run(maintenance: &Maintenance, command: Commands) -> Result<()> {
    match command {
        Commands::Status { json } => {
            let report = maintenance.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print_summary();
            }
        }
        Commands::Migrate {
            resume,
            quarantine_corrupt,
        } => {
            maintenance.migrate(resume, quarantine_corrupt)?.print_summary();
        }
        Commands::Validate { repair } => {
            maintenance.validate(repair)?.print_summary();
        }
        Commands::Purge { keep_days, repack } => {
            maintenance.purge(keep_days, repack)?.print_summary();
        }
    }
    Ok(())
}
