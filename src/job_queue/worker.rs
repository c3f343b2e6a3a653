//! Async workers that drain the queue.
//!
//! Each worker claims one job at a time and runs it on the blocking pool with
//! a child cancellation token. On shutdown a worker stops claiming and waits
//! for its in-flight job, which sees its token cancelled.

use super::models::QueuedJob;
use super::retry_policy::{Disposition, ErrorClass, RetryPolicy};
use super::JobQueue;
use crate::metrics;
use crate::ops_store::{AlertKind, OpsStore};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a job failed, in terms the retry table understands.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub class: ErrorClass,
    pub message: String,
    pub petition_id: Option<i64>,
}

impl JobFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            petition_id: None,
        }
    }

    pub fn for_petition(mut self, petition_id: i64) -> Self {
        self.petition_id = Some(petition_id);
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class.as_str())
    }
}

/// Executes the body of a queued job. Called from a blocking context.
pub trait JobPerformer: Send + Sync {
    fn perform(&self, job: &QueuedJob, cancellation: &CancellationToken) -> Result<(), JobFailure>;
}

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct QueueWorker {
    id: String,
    queue: Arc<dyn JobQueue>,
    performer: Arc<dyn JobPerformer>,
    ops_store: Arc<dyn OpsStore>,
    policy: RetryPolicy,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        performer: Arc<dyn JobPerformer>,
        ops_store: Arc<dyn OpsStore>,
        policy: RetryPolicy,
        poll_interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            performer,
            ops_store,
            policy,
            poll_interval,
            shutdown_token,
        }
    }

    pub async fn run(self) {
        info!("Queue worker {} started", self.id);
        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!("Queue worker {} failed to process a job: {:#}", self.id, e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.shutdown_token.cancelled() => break,
                }
            }
        }
        info!("Queue worker {} stopped", self.id);
    }

    /// Claims and executes at most one due job. Returns whether one ran.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.claim_next(&self.id, Utc::now())? else {
            return Ok(false);
        };
        debug!(
            "Worker {} claimed job #{} ({}, attempt {})",
            self.id, job.id, job.job_type, job.attempts
        );

        let token = self.shutdown_token.child_token();
        let performer = self.performer.clone();
        let claimed = job.clone();
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || performer.perform(&claimed, &token))
            .await
            .unwrap_or_else(|join_err| {
                Err(JobFailure::new(
                    ErrorClass::Panic,
                    format!("Job panicked: {}", join_err),
                ))
            });

        self.settle(&job, outcome, started.elapsed())?;
        Ok(true)
    }

    fn settle(
        &self,
        job: &QueuedJob,
        outcome: Result<(), JobFailure>,
        elapsed: Duration,
    ) -> Result<()> {
        let failure = match outcome {
            Ok(()) => {
                self.queue.complete(job.id)?;
                metrics::record_queue_job(&job.job_type, "completed", elapsed);
                return Ok(());
            }
            Err(failure) => failure,
        };

        let disposition = self.policy.resolve(failure.class, job.attempts, job.max_attempts);
        metrics::record_queue_job(&job.job_type, disposition.label(), elapsed);

        match disposition {
            Disposition::RetryNow => {
                debug!("Job #{} retrying now: {}", job.id, failure);
                self.queue.schedule_retry(job.id, Utc::now(), &failure.message)?;
            }
            Disposition::RetryAfter(backoff) => {
                let delay = backoff.delay_for_attempt(job.attempts);
                warn!(
                    "Job #{} ({}) failed on attempt {}, retrying in {:?}: {}",
                    job.id, job.job_type, job.attempts, delay, failure
                );
                let run_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                self.queue.schedule_retry(job.id, run_at, &failure.message)?;
            }
            Disposition::DropAndLog => {
                warn!("Dropping job #{} ({}): {}", job.id, job.job_type, failure);
                self.queue.mark_dead(job.id, &failure.message)?;
            }
            Disposition::AlertAndDrop => {
                error!(
                    "Dropping job #{} ({}) after {} attempts and raising an alert: {}",
                    job.id, job.job_type, job.attempts, failure
                );
                self.queue.mark_dead(job.id, &failure.message)?;
                let kind = match failure.class {
                    ErrorClass::StuckCorrection => AlertKind::StuckReset,
                    _ => AlertKind::JobDropped,
                };
                let details = serde_json::json!({
                    "job_id": job.id,
                    "job_type": job.job_type,
                    "attempts": job.attempts,
                    "error_class": failure.class.as_str(),
                    "error": failure.message,
                });
                self.ops_store
                    .record_alert(kind, failure.petition_id, Some(&details))?;
            }
        }
        Ok(())
    }
}

/// Spawns `config.worker_count` workers sharing one queue and performer.
pub fn spawn_workers(
    config: &QueueWorkerConfig,
    queue: Arc<dyn JobQueue>,
    performer: Arc<dyn JobPerformer>,
    ops_store: Arc<dyn OpsStore>,
    policy: RetryPolicy,
    shutdown_token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    // Lock owners must stay distinct across processes sharing one queue.db.
    let instance = uuid::Uuid::new_v4().simple().to_string();
    (0..config.worker_count.max(1))
        .map(|n| {
            let worker = QueueWorker::new(
                format!("worker-{}-{}", &instance[..8], n),
                queue.clone(),
                performer.clone(),
                ops_store.clone(),
                policy.clone(),
                config.poll_interval,
                shutdown_token.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect()
}
