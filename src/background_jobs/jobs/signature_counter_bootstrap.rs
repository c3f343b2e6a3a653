//! Makes sure a signature counter pass is queued.
//!
//! The counter reschedules itself after every pass, so once started the
//! chain is self-sustaining. This job starts it on startup and re-seeds it
//! periodically in case a pass was lost. The queue's unique key keeps a
//! re-seed from forking a second chain while one is pending.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule},
};
use crate::engine::EngineJob;
use crate::job_queue::{JobQueue, QueuedJobStatus};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

pub struct SignatureCounterBootstrapJob {
    reseed_interval: Duration,
}

impl SignatureCounterBootstrapJob {
    pub fn new(reseed_interval: Duration) -> Self {
        Self { reseed_interval }
    }

    fn counter_running(ctx: &JobContext) -> Result<bool, JobError> {
        let job_type = EngineJob::UpdateSignatureCounts { time: None }.job_type();
        let running = ctx
            .engine
            .job_queue
            .list_jobs(Some(QueuedJobStatus::Running), 1000)
            .map_err(|e| JobError::ExecutionFailed(format!("Failed to list running jobs: {}", e)))?;
        Ok(running.iter().any(|job| job.job_type == job_type))
    }
}

impl BackgroundJob for SignatureCounterBootstrapJob {
    fn id(&self) -> &'static str {
        "signature_counter_bootstrap"
    }

    fn name(&self) -> &'static str {
        "Signature Counter Bootstrap"
    }

    fn description(&self) -> &'static str {
        "Keep a signature counter pass queued"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.reseed_interval),
            hooks: vec![HookEvent::OnStartup],
        }
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        // A running pass enqueues its own successor.
        if Self::counter_running(ctx)? {
            debug!("Signature counter pass in progress, nothing to seed");
            return Ok(());
        }

        let outcome = ctx
            .engine
            .enqueue(&EngineJob::UpdateSignatureCounts { time: None }, Utc::now())?;

        if outcome.is_duplicate() {
            debug!(
                "Signature counter already queued as job #{}",
                outcome.job_id()
            );
        } else {
            info!("Queued signature counter as job #{}", outcome.job_id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::test_support::engine;
    use tokio_util::sync::CancellationToken;

    fn job() -> SignatureCounterBootstrapJob {
        SignatureCounterBootstrapJob::new(Duration::from_secs(900))
    }

    #[test]
    fn test_bootstrap_queues_a_single_counter() {
        let t = engine(EngineSettings::default());
        let ctx = JobContext::new(CancellationToken::new(), t.ctx.clone());

        job().execute(&ctx).unwrap();
        job().execute(&ctx).unwrap();

        let pending = t
            .queue
            .list_jobs(Some(QueuedJobStatus::Pending), 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_type, "update_signature_counts");
    }

    #[test]
    fn test_bootstrap_reseeds_a_dropped_chain() {
        let t = engine(EngineSettings::default());
        let ctx = JobContext::new(CancellationToken::new(), t.ctx.clone());

        job().execute(&ctx).unwrap();
        let first = t.queue.claim_next("w", Utc::now()).unwrap().unwrap();
        t.queue.mark_dead(first.id, "store unavailable").unwrap();

        job().execute(&ctx).unwrap();

        let pending = t
            .queue
            .list_jobs(Some(QueuedJobStatus::Pending), 10)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, first.id);
    }

    #[test]
    fn test_bootstrap_leaves_a_running_pass_alone() {
        let t = engine(EngineSettings::default());
        let ctx = JobContext::new(CancellationToken::new(), t.ctx.clone());

        job().execute(&ctx).unwrap();
        t.queue.claim_next("w", Utc::now()).unwrap().unwrap();

        job().execute(&ctx).unwrap();

        assert!(t
            .queue
            .list_jobs(Some(QueuedJobStatus::Pending), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bootstrap_runs_on_startup_and_interval() {
        let schedule = job().schedule();
        assert!(schedule.listens_to(HookEvent::OnStartup));
        assert_eq!(schedule.interval(), Some(Duration::from_secs(900)));
    }
}
