//! Job audit logging utilities.

use crate::ops_store::{JobAuditEventType, OpsStore};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Writes a job's lifecycle events to the audit log. Failures to write are
/// logged and otherwise ignored.
pub struct JobAuditLogger {
    ops_store: Arc<dyn OpsStore>,
    job_id: String,
    start_time: Instant,
}

impl JobAuditLogger {
    pub fn new(ops_store: Arc<dyn OpsStore>, job_id: &str) -> Self {
        Self {
            ops_store,
            job_id: job_id.to_string(),
            start_time: Instant::now(),
        }
    }

    pub fn log_started(&self, details: Option<serde_json::Value>) {
        self.log(JobAuditEventType::Started, None, details, None);
    }

    pub fn log_completed(&self, details: Option<serde_json::Value>) {
        self.log(
            JobAuditEventType::Completed,
            Some(self.elapsed_ms()),
            details,
            None,
        );
    }

    pub fn log_failed(&self, error: &str, details: Option<serde_json::Value>) {
        self.log(
            JobAuditEventType::Failed,
            Some(self.elapsed_ms()),
            details,
            Some(error),
        );
    }

    pub fn log_progress(&self, details: serde_json::Value) {
        self.log(JobAuditEventType::Progress, None, Some(details), None);
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    fn log(
        &self,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<serde_json::Value>,
        error: Option<&str>,
    ) {
        if let Err(e) = self.ops_store.log_job_audit(
            &self.job_id,
            event_type,
            duration_ms,
            details.as_ref(),
            error,
        ) {
            warn!("Failed to write audit entry for {}: {}", self.job_id, e);
        }
    }
}
