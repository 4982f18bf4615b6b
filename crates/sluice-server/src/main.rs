//! Sluice - database-backed background job runtime
//!
//! # Usage
//!
//! ```bash
//! # Run every configured worker plus the dead-letter sweeper
//! sluice --config sluice.toml run
//!
//! # Enqueue a job
//! sluice enqueue metrics '{"post_id": 42}'
//!
//! # Inspect and repair queues
//! sluice stats
//! sluice stuck metrics --older-than 600
//! sluice restart <job-id>
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod handler;
mod settings;
mod telemetry;

use commands::{admin, run};
use settings::Settings;

/// Sluice - background jobs on a plain SQL table
#[derive(Parser)]
#[command(
    name = "sluice",
    version,
    about = "Sluice - database-backed job queue runtime",
    long_about = "Sluice runs background workers that claim jobs from a SQLite table,\n\
                  with per-queue circuit breaking, adaptive pacing and\n\
                  dead-letter recovery of failed and orphaned jobs."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (TOML); `sluice.toml` is used when present
    #[arg(short, long, global = true, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers and the dead-letter sweeper until interrupted
    #[command(name = "run")]
    Run(run::RunArgs),

    #[command(flatten)]
    Admin(admin::AdminCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    telemetry::init_tracing(cli.verbose, settings.log_filter.as_deref());

    match cli.command {
        Commands::Run(args) => run::run(args, settings).await,
        Commands::Admin(command) => admin::run(command, settings).await,
    }
}
