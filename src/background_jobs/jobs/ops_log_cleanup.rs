//! Deletes old rows from the ops database: finished job runs, job audit
//! entries and engine alerts past the retention period.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use crate::engine::before;
use chrono::Utc;
use std::time::Duration;
use tracing::info;

pub struct OpsLogCleanupJob {
    retention: Duration,
}

impl OpsLogCleanupJob {
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }
}

impl BackgroundJob for OpsLogCleanupJob {
    fn id(&self) -> &'static str {
        "ops_log_cleanup"
    }

    fn name(&self) -> &'static str {
        "Ops Log Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete old job runs, job audit entries and alerts"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(Duration::from_secs(24 * 60 * 60))
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = before(Utc::now(), self.retention);
        info!("Cleaning up ops records older than {}", cutoff);

        let ops = ctx.ops_store();
        let runs = ops
            .prune_job_runs(cutoff)
            .map_err(|e| JobError::ExecutionFailed(format!("Failed to prune job runs: {}", e)))?;
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let audit_entries = ops.prune_job_audit_log(cutoff).map_err(|e| {
            JobError::ExecutionFailed(format!("Failed to prune job audit log: {}", e))
        })?;
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let alerts = ops
            .prune_alerts(cutoff)
            .map_err(|e| JobError::ExecutionFailed(format!("Failed to prune alerts: {}", e)))?;

        if runs + audit_entries + alerts > 0 {
            info!(
                "Deleted {} job runs, {} audit entries and {} alerts",
                runs, audit_entries, alerts
            );
        } else {
            info!("No ops records to clean up");
        }
        Ok(())
    }
}
