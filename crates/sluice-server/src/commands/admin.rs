//! Administrative commands against the job table
//!
//! Usage:
//! ```bash
//! sluice enqueue metrics '{"post_id": 42}'
//! sluice stats
//! sluice job <id>
//! sluice stuck metrics --older-than 600
//! sluice restart <id>
//! sluice terminate <id> --reason "bad payload"
//! sluice clear metrics --yes
//! sluice sweep
//! sluice check-config
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use sluice_persist::SqliteQueueStore;
use sluice_queue::{
    DeadLetterManager, EnqueueOptions, Job, JobId, JobStatus, QueueStore, TerminateAction,
};

use super::{open_store, print_error, print_success, print_warning};
use crate::settings::Settings;

#[derive(Subcommand)]
pub enum AdminCommand {
    /// Add a job to a queue
    #[command(name = "enqueue")]
    Enqueue {
        /// Queue name
        queue: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        /// Total attempts allowed; defaults to the worker's max_retries + 1
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Explicit job id
        #[arg(long)]
        id: Option<JobId>,
    },

    /// Show per-status job counts
    #[command(name = "stats")]
    Stats {
        /// Queues to show; defaults to every configured worker
        queues: Vec<String>,
    },

    /// Show a single job
    #[command(name = "job")]
    Show {
        id: JobId,
    },

    /// List jobs processing for longer than a threshold
    #[command(name = "stuck")]
    Stuck {
        queue: String,

        /// Threshold in seconds
        #[arg(long, default_value_t = 600)]
        older_than: u64,
    },

    /// Reset a job to pending with attempts and error cleared
    #[command(name = "restart")]
    Restart {
        id: JobId,
    },

    /// Fail a live job permanently, or delete a finished one
    #[command(name = "terminate")]
    Terminate {
        id: JobId,

        #[arg(long, default_value = "terminated by operator")]
        reason: String,
    },

    /// Delete every job in a queue that is not processing
    #[command(name = "clear")]
    Clear {
        queue: String,

        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Run one dead-letter sweep now
    #[command(name = "sweep")]
    Sweep {
        /// Queues to sweep; defaults to every configured worker
        queues: Vec<String>,
    },

    /// Validate every worker configuration
    #[command(name = "check-config")]
    CheckConfig,
}

pub async fn run(command: AdminCommand, settings: Settings) -> Result<()> {
    if let AdminCommand::CheckConfig = command {
        return check_config(&settings);
    }

    let (backend, store) = open_store(&settings).await?;
    let result = dispatch(command, &settings, store).await;
    backend.close().await;
    result
}

async fn dispatch(command: AdminCommand, settings: &Settings, store: Arc<SqliteQueueStore>) -> Result<()> {
    match command {
        AdminCommand::Enqueue {
            queue,
            payload,
            max_attempts,
            id,
        } => enqueue(settings, store.as_ref(), &queue, &payload, max_attempts, id).await,
        AdminCommand::Stats { queues } => {
            stats(store.as_ref(), &queues_or_configured(queues, settings)).await
        }
        AdminCommand::Show { id } => show(store.as_ref(), id).await,
        AdminCommand::Stuck { queue, older_than } => {
            stuck(store.as_ref(), &queue, Duration::from_secs(older_than)).await
        }
        AdminCommand::Restart { id } => {
            store.restart_job(id).await?;
            print_success(&format!("Job {} is pending again", id));
            Ok(())
        }
        AdminCommand::Terminate { id, reason } => {
            let outcome = store.force_terminate(id, &reason).await?;
            match outcome.action {
                TerminateAction::MarkedFailed => print_success(&format!(
                    "Job {} was {}, now failed permanently",
                    id, outcome.previous_status
                )),
                TerminateAction::Deleted => print_success(&format!(
                    "Job {} was {}, deleted",
                    id, outcome.previous_status
                )),
            }
            Ok(())
        }
        AdminCommand::Clear { queue, yes } => {
            if !yes {
                bail!("Refusing to clear '{}' without --yes", queue);
            }
            let removed = store.clear_queue(&queue).await?;
            print_success(&format!("Removed {} jobs from '{}'", removed, queue));
            Ok(())
        }
        AdminCommand::Sweep { queues } => {
            let manager = DeadLetterManager::new(
                store,
                queues_or_configured(queues, settings),
                settings.dead_letter.dead_letter_config(),
            );
            sweep(&manager).await
        }
        AdminCommand::CheckConfig => check_config(settings),
    }
}

fn queues_or_configured(queues: Vec<String>, settings: &Settings) -> Vec<String> {
    if queues.is_empty() {
        settings.workers.keys().cloned().collect()
    } else {
        queues
    }
}

async fn enqueue(
    settings: &Settings,
    store: &dyn QueueStore,
    queue: &str,
    payload: &str,
    max_attempts: Option<u32>,
    id: Option<JobId>,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let mut opts = match max_attempts {
        Some(max) => EnqueueOptions::default().max_attempts(max),
        None => settings.worker_config(queue).enqueue_options(),
    };
    if let Some(id) = id {
        opts = opts.job_id(id);
    }

    let id = store.enqueue(queue, payload, opts).await?;
    print_success(&format!("Enqueued {} on '{}'", id, queue));
    Ok(())
}

async fn stats(store: &dyn QueueStore, queues: &[String]) -> Result<()> {
    if queues.is_empty() {
        print_warning("No queues configured; pass queue names explicitly");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Pending").fg(Color::Cyan),
            Cell::new("Processing").fg(Color::Cyan),
            Cell::new("Completed").fg(Color::Cyan),
            Cell::new("Failed").fg(Color::Cyan),
            Cell::new("Total").fg(Color::Cyan),
        ]);

    for queue in queues {
        let stats = store.get_stats(queue).await?;
        let failed = if stats.failed > 0 {
            Cell::new(stats.failed).fg(Color::Red)
        } else {
            Cell::new(stats.failed)
        };
        table.add_row(vec![
            Cell::new(queue).fg(Color::Green),
            Cell::new(stats.pending),
            Cell::new(stats.processing),
            Cell::new(stats.completed),
            failed,
            Cell::new(stats.total),
        ]);
    }

    println!("{table}");
    Ok(())
}

async fn show(store: &dyn QueueStore, id: JobId) -> Result<()> {
    let job = store.get_job(id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn stuck(store: &dyn QueueStore, queue: &str, threshold: Duration) -> Result<()> {
    let jobs = store.get_stuck_jobs(queue, threshold).await?;
    if jobs.is_empty() {
        print_success(&format!(
            "No jobs in '{}' processing for more than {}s",
            queue,
            threshold.as_secs()
        ));
        return Ok(());
    }

    print_warning(&format!("{} stuck jobs in '{}'", jobs.len(), queue));
    println!("{}", job_table(&jobs));
    Ok(())
}

fn job_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Id").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Attempts").fg(Color::Cyan),
            Cell::new("Started").fg(Color::Cyan),
            Cell::new("Last error").fg(Color::Cyan),
        ]);

    for job in jobs {
        let status = match job.status {
            JobStatus::Failed => Cell::new(job.status).fg(Color::Red),
            JobStatus::Processing => Cell::new(job.status).fg(Color::Yellow),
            _ => Cell::new(job.status),
        };
        table.add_row(vec![
            Cell::new(job.id),
            status,
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(
                job.started_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
            ),
            Cell::new(job.last_error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

async fn sweep(manager: &DeadLetterManager) -> Result<()> {
    let report = manager.sweep().await;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Failed found").fg(Color::Cyan),
            Cell::new("Requeued").fg(Color::Cyan),
            Cell::new("Stuck found").fg(Color::Cyan),
            Cell::new("Reset").fg(Color::Cyan),
            Cell::new("Errors").fg(Color::Cyan),
        ]);
    for queue in &report.queues {
        table.add_row(vec![
            Cell::new(&queue.queue).fg(Color::Green),
            Cell::new(queue.failed_found),
            Cell::new(queue.failed_requeued),
            Cell::new(queue.stuck_found),
            Cell::new(queue.stuck_reset),
            Cell::new(queue.errors),
        ]);
    }
    println!("{table}");

    if report.errors() > 0 {
        bail!("Sweep finished with {} errors", report.errors());
    }
    Ok(())
}

fn check_config(settings: &Settings) -> Result<()> {
    println!("{}", "Worker configuration".bold().cyan());
    println!("{}", "═".repeat(50).cyan());

    let mut invalid = 0;
    for (name, worker) in &settings.workers {
        let problems = settings.worker_problems(name, worker);
        if problems.is_empty() {
            let state = if worker.enabled { "" } else { " (disabled)" };
            print_success(&format!("{}{}", name, state));
        } else {
            invalid += 1;
            print_error(name);
            for problem in problems {
                println!("    {} {}", "•".red(), problem);
            }
        }
    }

    if settings.workers.is_empty() {
        print_warning("No workers configured");
    }
    if invalid > 0 {
        bail!("{} invalid worker configurations", invalid);
    }
    Ok(())
}
