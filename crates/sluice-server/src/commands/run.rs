//! `sluice run`: host every configured worker until interrupted

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use sluice_persist::StoragePaceStore;
use sluice_queue::{DeadLetterManager, WorkerSupervisor};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::open_store;
use crate::handler::CommandHandler;
use crate::settings::Settings;

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Only start these workers (repeatable); defaults to every enabled worker
    #[arg(long = "worker", value_name = "NAME")]
    workers: Vec<String>,

    /// Do not start the dead-letter sweeper
    #[arg(long)]
    no_sweeper: bool,
}

pub async fn run(args: RunArgs, settings: Settings) -> Result<()> {
    let selected: Vec<String> = settings
        .enabled_queues()
        .into_iter()
        .filter(|name| args.workers.is_empty() || args.workers.contains(name))
        .collect();
    for unknown in args.workers.iter().filter(|w| !selected.contains(w)) {
        warn!(worker = %unknown, "Requested worker is not configured or disabled");
    }
    if selected.is_empty() {
        bail!("No workers to run; add a [workers.<queue>] section to the configuration");
    }

    let (backend, store) = open_store(&settings).await?;
    let pace_store = Arc::new(StoragePaceStore::new(Arc::new(backend.clone())));
    let supervisor = Arc::new(
        WorkerSupervisor::with_config(store.clone(), settings.supervisor_config())
            .with_pace_store(pace_store),
    );

    for name in &selected {
        let Some(worker) = settings.workers.get(name) else {
            continue;
        };
        let handler = match CommandHandler::new(&worker.command) {
            Ok(handler) => Arc::new(handler),
            Err(e) => {
                error!(worker = %name, error = %e, "Skipping worker");
                continue;
            }
        };
        let handle = supervisor
            .initialize_worker(name, worker.worker_config(name), handler)
            .await;
        info!(
            worker = %handle.name(),
            concurrency = handle.runtime().config().concurrency,
            "Worker started"
        );
    }

    let started = supervisor.worker_names().await;
    if started.is_empty() {
        bail!("No worker could be started");
    }

    let cancel = CancellationToken::new();
    let sweeper = if settings.dead_letter.enabled && !args.no_sweeper {
        let manager = Arc::new(DeadLetterManager::new(
            store.clone(),
            started.clone(),
            settings.dead_letter.dead_letter_config(),
        ));
        Some(manager.spawn(cancel.clone()))
    } else {
        None
    };

    let health = {
        let supervisor = supervisor.clone();
        let cancel = cancel.clone();
        let mut ticker = tokio::time::interval(settings.supervisor.health_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let restarted = supervisor.check_health_and_restart().await;
                        if !restarted.is_empty() {
                            warn!(workers = ?restarted, "Restarted workers");
                        }
                    }
                }
            }
        })
    };

    info!(workers = ?started, "Sluice running");
    shutdown_signal().await;

    cancel.cancel();
    // A restart in flight must finish before the runtimes are drained
    let _ = health.await;
    let drained = supervisor
        .shutdown_all(settings.supervisor.shutdown_grace())
        .await;
    if !drained {
        warn!("Some jobs were still running at shutdown; the dead-letter sweep will reclaim them");
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    backend.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
