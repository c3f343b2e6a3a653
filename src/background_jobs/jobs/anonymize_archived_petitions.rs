//! Queues anonymization of signer details once an archived petition has been
//! closed for long enough.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::engine::EngineJob;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

pub struct AnonymizeArchivedPetitionsJob {
    interval: Duration,
    /// How long after closing a petition its signatures are kept intact
    retain_for: Duration,
}

impl AnonymizeArchivedPetitionsJob {
    pub fn new(interval: Duration, retain_for: Duration) -> Self {
        Self {
            interval,
            retain_for,
        }
    }
}

impl BackgroundJob for AnonymizeArchivedPetitionsJob {
    fn id(&self) -> &'static str {
        "anonymize_archived_petitions"
    }

    fn name(&self) -> &'static str {
        "Anonymize Archived Petitions"
    }

    fn description(&self) -> &'static str {
        "Queue redaction of signer details on old archived petitions"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let now = Utc::now();
        let closed_before = crate::engine::before(now, self.retain_for);
        let petition_ids = ctx
            .engine
            .petition_store
            .petitions_awaiting_anonymization(closed_before)
            .map_err(|e| {
                JobError::ExecutionFailed(format!("Failed to list petitions to anonymize: {}", e))
            })?;

        for petition_id in &petition_ids {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            ctx.engine.enqueue(
                &EngineJob::AnonymizeSignatures {
                    petition_id: *petition_id,
                    after_id: None,
                },
                now,
            )?;
        }

        info!(
            "{} archived petitions closed before {} queued for anonymization",
            petition_ids.len(),
            closed_before
        );
        Ok(())
    }
}
