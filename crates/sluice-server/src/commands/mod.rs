//! Subcommands

pub mod admin;
pub mod run;

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use sluice_persist::{SqliteBackend, SqliteQueueStore};

use crate::settings::Settings;

/// Connect to the configured database and build the queue store on it
pub async fn open_store(settings: &Settings) -> Result<(SqliteBackend, Arc<SqliteQueueStore>)> {
    let backend = SqliteBackend::new_with_config(settings.database.sqlite_config())
        .await
        .with_context(|| format!("Failed to open database {}", settings.database.url))?;
    let store = SqliteQueueStore::new(backend.pool().clone())
        .with_rules(settings.payload_rules.clone());
    Ok((backend, Arc::new(store)))
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}
