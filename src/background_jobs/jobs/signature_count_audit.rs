//! Periodic drift audit of cached signature counts, plus the watchdog for
//! count resets that never finished.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
    JobAuditLogger,
};
use crate::engine::auditor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct SignatureCountAuditJob {
    interval: Duration,
}

impl SignatureCountAuditJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl BackgroundJob for SignatureCountAuditJob {
    fn id(&self) -> &'static str {
        "signature_count_audit"
    }

    fn name(&self) -> &'static str {
        "Signature Count Audit"
    }

    fn description(&self) -> &'static str {
        "Compare cached signature counts with a recount and flag stuck resets"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let audit = JobAuditLogger::new(Arc::clone(ctx.ops_store()), self.id());
        audit.log_started(Some(serde_json::json!({
            "lookback_hours": ctx.engine.settings.audit_lookback_hours,
        })));

        let now = chrono::Utc::now();
        let report = match auditor::audit_signature_counts(&ctx.engine, now) {
            Ok(report) => report,
            Err(e) => {
                audit.log_failed(&e.to_string(), None);
                return Err(e.into());
            }
        };

        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let stuck = match auditor::check_stuck_resets(&ctx.engine, now) {
            Ok(stuck) => stuck,
            Err(e) => {
                audit.log_failed(&e.to_string(), None);
                return Err(e.into());
            }
        };

        info!(
            "Signature count audit: {} checked, {} drifted, {} stuck resets",
            report.petitions_checked,
            report.findings.len(),
            stuck.len()
        );

        audit.log_completed(Some(serde_json::json!({
            "petitions_checked": report.petitions_checked,
            "drifted": report.findings.len(),
            "corrections_enqueued": report.corrections_enqueued,
            "stuck_resets": stuck,
        })));
        Ok(())
    }
}
