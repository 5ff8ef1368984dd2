//! Worker pool
//!
//! A fixed number of workers pull jobs from the shared queue and dispatch
//! to the stage handlers. Transient failures are retried with a per-type
//! backoff schedule; permanent failures and exhausted retry budgets mark
//! the episode FAILED.

pub mod audio;
pub mod download;
pub mod index;
pub mod transcribe;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryConfig};
use crate::database::Database;
use crate::error::AppError;
use crate::ollama::OllamaClient;
use crate::pipeline::Pipeline;
use crate::queue::{Job, JobQueue, JobType};
use crate::whisper::WhisperClient;

/// Shared handles the stage handlers run against.
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub queue: Arc<JobQueue>,
    pub pipeline: Arc<Pipeline>,
    pub whisper: Arc<WhisperClient>,
    pub ollama: Arc<OllamaClient>,
    pub config: Arc<Config>,
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    parallelism: usize,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext) -> Self {
        let parallelism = ctx.config.jobs.worker.parallelism.max(1);
        Self {
            ctx: Arc::new(ctx),
            parallelism,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Spawn the worker tasks. Each runs until the queue is cancelled and
    /// its in-flight job, if any, has finished.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.parallelism)
            .map(|worker_id| {
                let ctx = self.ctx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, ctx, cancel).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    log::info!("Worker {} started", worker_id);

    while let Some(job) = ctx.queue.dequeue().await {
        log::info!(
            "Worker {} running {} job {} for resource {} (attempt {})",
            worker_id,
            job.job_type,
            job.job_id,
            job.resource_id,
            job.attempt
        );
        match run_job(&ctx, &job).await {
            Ok(()) => {
                ctx.queue.complete(job.job_id);
            }
            Err(e) => handle_failure(&ctx, job, e, &cancel).await,
        }
    }

    log::info!("Worker {} stopped", worker_id);
}

async fn run_job(ctx: &WorkerContext, job: &Job) -> Result<(), AppError> {
    match job.job_type {
        JobType::Download => download::run(ctx, job).await,
        JobType::Transcribe => transcribe::run(ctx, job).await,
        JobType::Index => index::run(ctx, job).await,
    }
}

/// Release the failed job, then either re-enqueue it after a backoff or
/// mark the episode FAILED when the error is permanent or the retry
/// budget is spent.
async fn handle_failure(
    ctx: &WorkerContext,
    job: Job,
    error: AppError,
    cancel: &CancellationToken,
) {
    ctx.queue.fail(job.job_id, &error.to_string());

    let retry = retry_config(&ctx.config, job.job_type);
    if error.is_transient() && job.attempt < retry.max_attempts {
        let delay = backoff_delay(retry, job.attempt);
        log::warn!(
            "{} for resource {} attempt {}/{} failed, retrying in {}s: {}",
            job.job_type,
            job.resource_id,
            job.attempt,
            retry.max_attempts,
            delay.as_secs(),
            error
        );

        // A shutdown during the backoff drops the retry; recovery
        // requeues the stage at next startup
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }

        let mut next = job;
        next.attempt += 1;
        next.started_at = None;
        next.enqueued_at = chrono::Utc::now();
        match ctx.queue.enqueue(next) {
            Ok(()) => {}
            Err(AppError::DuplicateJob(msg)) => log::warn!("Dropping retry: {}", msg),
            Err(e) => log::error!("Failed to re-enqueue retry: {}", e),
        }
        return;
    }

    let reason = if error.is_transient() {
        format!(
            "{} failed after {} attempts: {}",
            job.job_type, job.attempt, error
        )
    } else {
        format!("{} failed: {}", job.job_type, error)
    };
    if let Err(e) = ctx.pipeline.fail_episode(job.resource_id, &reason) {
        log::error!("Failed to mark episode {} failed: {}", job.resource_id, e);
    }
}

fn retry_config(config: &Config, job_type: JobType) -> &RetryConfig {
    match job_type {
        JobType::Download => &config.jobs.retry.download,
        JobType::Transcribe => &config.jobs.retry.transcribe,
        JobType::Index => &config.jobs.retry.index,
    }
}

/// Delay before the next attempt, holding at the last configured step.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let delays = &retry.backoff_seconds;
    let index = (attempt as usize)
        .saturating_sub(1)
        .min(delays.len().saturating_sub(1));
    Duration::from_secs(delays.get(index).copied().unwrap_or(30))
}

// =========================================================================
// Tests
// =========================================================================
