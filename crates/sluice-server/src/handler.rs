//! Job handler that runs an external command per job
//!
//! The payload is written to the child's stdin as JSON. Job metadata is
//! passed through `SLUICE_JOB_ID`, `SLUICE_QUEUE` and `SLUICE_ATTEMPT`.
//! Exit status 0 completes the job; anything else fails it with the tail
//! of stderr as the error.

use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sluice_queue::{Job, JobHandler};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Bytes of stderr kept in the job's error message
const STDERR_TAIL: usize = 512;

#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("worker command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SLUICE_JOB_ID", job.id.to_string())
            .env("SLUICE_QUEUE", &job.queue_name)
            .env("SLUICE_ATTEMPT", (job.attempts + 1).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&job.payload)?;
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // The command is free to ignore its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e).context("failed to write payload"),
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail = match stderr.char_indices().rev().nth(STDERR_TAIL) {
            Some((at, _)) => &stderr[at..],
            None => stderr,
        };
        if tail.is_empty() {
            bail!("'{}' exited with {}", self.program, output.status);
        }
        bail!("'{}' exited with {}: {}", self.program, output.status, tail)
    }
}
