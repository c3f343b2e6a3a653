//! Queues archival for petitions that moderation closed or rejected.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::engine::EngineJob;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

pub struct ArchiveClosedPetitionsJob {
    interval: Duration,
}

impl ArchiveClosedPetitionsJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackgroundJob for ArchiveClosedPetitionsJob {
    fn id(&self) -> &'static str {
        "archive_closed_petitions"
    }

    fn name(&self) -> &'static str {
        "Archive Closed Petitions"
    }

    fn description(&self) -> &'static str {
        "Queue archival of closed and rejected petitions"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnPetitionClosed],
        }
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let petition_ids = ctx
            .engine
            .petition_store
            .petitions_awaiting_archive()
            .map_err(|e| {
                JobError::ExecutionFailed(format!("Failed to list petitions to archive: {}", e))
            })?;

        let now = Utc::now();
        let mut queued = 0usize;
        for petition_id in &petition_ids {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let outcome = ctx.engine.enqueue(
                &EngineJob::ArchivePetition {
                    petition_id: *petition_id,
                },
                now,
            )?;
            if outcome.is_duplicate() {
                debug!("Archive of petition {} already queued", petition_id);
            } else {
                queued += 1;
            }
        }

        info!(
            "{} petitions awaiting archive, {} newly queued",
            petition_ids.len(),
            queued
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::test_support::engine;
    use crate::job_queue::{JobQueue, QueuedJobStatus};
    use crate::petition_store::{NewPetition, PetitionStore};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_queues_closed_and_rejected_only() {
        let t = engine(EngineSettings::default());
        let ctx = JobContext::new(CancellationToken::new(), t.ctx.clone());
        let open = t.petitions.insert_petition(&NewPetition::open("Open")).unwrap();
        let closed = t.petitions.insert_petition(&NewPetition::open("Closed")).unwrap();
        let rejected = t.petitions.insert_petition(&NewPetition::open("Rejected")).unwrap();
        t.petitions.close_petition(closed, Utc::now()).unwrap();
        t.petitions.reject_petition(rejected, Utc::now()).unwrap();

        let job = ArchiveClosedPetitionsJob::new(Duration::from_secs(3600));
        job.execute(&ctx).unwrap();
        job.execute(&ctx).unwrap();

        let pending = t
            .queue
            .list_jobs(Some(QueuedJobStatus::Pending), 10)
            .unwrap();
        assert_eq!(pending.len(), 2);
        let keys: Vec<_> = pending.iter().filter_map(|j| j.unique_key.clone()).collect();
        assert!(keys.contains(&format!("archive_petition:{}", closed)));
        assert!(keys.contains(&format!("archive_petition:{}", rejected)));
        assert!(!keys.contains(&format!("archive_petition:{}", open)));
    }

    #[test]
    fn test_cancelled_before_enqueue() {
        let t = engine(EngineSettings::default());
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone(), t.ctx.clone());
        let closed = t.petitions.insert_petition(&NewPetition::open("Closed")).unwrap();
        t.petitions.close_petition(closed, Utc::now()).unwrap();
        token.cancel();

        let result = ArchiveClosedPetitionsJob::new(Duration::from_secs(60)).execute(&ctx);

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert!(t.queue.list_jobs(None, 10).unwrap().is_empty());
    }
}
