//! Durable, priority-laned, at-least-once job queue backed by SQLite.

mod models;
pub mod retry_policy;
mod schema;
mod sqlite_job_queue;
pub mod worker;

pub use models::*;
pub use retry_policy::{Backoff, Disposition, ErrorClass, RetryPolicy};
pub use schema::QUEUE_VERSIONED_SCHEMAS;
pub use sqlite_job_queue::SqliteJobQueue;
pub use worker::{spawn_workers, JobFailure, JobPerformer, QueueWorker, QueueWorkerConfig};

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait JobQueue: Send + Sync {
    /// Inserts a pending job, unless `unique_key` matches a job that is still pending.
    fn enqueue(&self, job: &NewJob) -> Result<EnqueueOutcome>;

    /// Atomically moves the best due pending job to `running`: lowest lane rank,
    /// then earliest `run_at`, then lowest id.
    fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>>;

    fn complete(&self, job_id: i64) -> Result<()>;

    /// Returns a running job to `pending` at `run_at`. Returns false when a
    /// pending job with the same unique key already took its place, in which
    /// case this one is marked dead as superseded.
    fn schedule_retry(&self, job_id: i64, run_at: DateTime<Utc>, error: &str) -> Result<bool>;

    fn mark_dead(&self, job_id: i64, error: &str) -> Result<()>;

    /// Returns jobs locked before `locked_before` to `pending`.
    fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<usize>;

    fn lane_depths(&self) -> Result<Vec<LaneDepth>>;
    fn get_job(&self, job_id: i64) -> Result<Option<QueuedJob>>;
    /// Most recent first.
    fn list_jobs(&self, status: Option<QueuedJobStatus>, limit: usize) -> Result<Vec<QueuedJob>>;
    /// Deletes completed and dead jobs finished before `before`.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}
