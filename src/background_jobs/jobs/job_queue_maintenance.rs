//! Housekeeping for the durable job queue.
//!
//! Runs at startup and then periodically:
//! - jobs left `running` by a crashed worker go back to `pending`
//! - completed and dead jobs past retention are deleted
//! - lane depth gauges are refreshed

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior},
    JobAuditLogger,
};
use crate::engine::before;
use crate::metrics;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct JobQueueMaintenanceJob {
    interval: Duration,
    stale_after: Duration,
    retention: Duration,
}

impl JobQueueMaintenanceJob {
    pub fn new(interval: Duration, stale_after: Duration, retention: Duration) -> Self {
        Self {
            interval,
            stale_after,
            retention,
        }
    }
}

impl BackgroundJob for JobQueueMaintenanceJob {
    fn id(&self) -> &'static str {
        "job_queue_maintenance"
    }

    fn name(&self) -> &'static str {
        "Job Queue Maintenance"
    }

    fn description(&self) -> &'static str {
        "Release stale queue jobs and purge finished ones"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Combined {
            interval: Some(self.interval),
            hooks: vec![HookEvent::OnStartup],
        }
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::WaitForCompletion
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let audit = JobAuditLogger::new(Arc::clone(ctx.ops_store()), self.id());
        audit.log_started(None);

        let queue = &ctx.engine.job_queue;
        let now = Utc::now();

        let released = queue.release_stale(before(now, self.stale_after)).map_err(|e| {
            let msg = format!("Failed to release stale jobs: {}", e);
            audit.log_failed(&msg, None);
            JobError::ExecutionFailed(msg)
        })?;
        if released > 0 {
            warn!("Released {} stale queue jobs", released);
        }

        let purged = queue.purge_finished(before(now, self.retention)).map_err(|e| {
            let msg = format!("Failed to purge finished jobs: {}", e);
            audit.log_failed(&msg, None);
            JobError::ExecutionFailed(msg)
        })?;

        match queue.lane_depths() {
            Ok(depths) => {
                for depth in depths {
                    metrics::set_queue_lane_depth(depth.lane.as_str(), depth.pending);
                }
            }
            Err(e) => warn!("Failed to read queue lane depths: {}", e),
        }

        info!(
            "Queue maintenance: {} stale released, {} finished purged",
            released, purged
        );
        audit.log_completed(Some(serde_json::json!({
            "released": released,
            "purged": purged,
        })));
        Ok(())
    }
}
