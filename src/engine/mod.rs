//! The counting and batch-processing engine.
//!
//! Every entry point here is synchronous and expects to run on the blocking
//! pool: the queue workers call into it through [`EngineDispatcher`].

pub mod anonymize;
pub mod archive;
pub mod auditor;
pub mod batch;
pub mod corrector;
pub mod counter;
mod jobs;
pub mod termination;

pub use jobs::{EngineDispatcher, EngineJob};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::job_queue::{EnqueueOutcome, JobQueue};
use crate::ops_store::OpsStore;
use crate::petition_store::PetitionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Shared handles every engine component works against.
#[derive(Clone)]
pub struct EngineContext {
    pub petition_store: Arc<dyn PetitionStore>,
    pub job_queue: Arc<dyn JobQueue>,
    pub ops_store: Arc<dyn OpsStore>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        petition_store: Arc<dyn PetitionStore>,
        job_queue: Arc<dyn JobQueue>,
        ops_store: Arc<dyn OpsStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            petition_store,
            job_queue,
            ops_store,
            settings,
        }
    }

    /// Enqueues `job` to become claimable at `run_at`.
    pub fn enqueue(&self, job: &EngineJob, run_at: DateTime<Utc>) -> EngineResult<EnqueueOutcome> {
        let new_job = job.to_new_job()?.run_at(run_at);
        let outcome = self
            .job_queue
            .enqueue(&new_job)
            .map_err(EngineError::from_store)?;
        if outcome.is_duplicate() {
            debug!(
                "{} already pending as job #{}",
                job.unique_key(),
                outcome.job_id()
            );
        }
        Ok(outcome)
    }
}

/// `chrono` arithmetic on a std duration, saturating instead of failing.
pub(crate) fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn before(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_sub_signed(delay))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
