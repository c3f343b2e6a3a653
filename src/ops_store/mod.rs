//! Operational state of the engine: scheduled job history, schedules, audit
//! trail and alerts raised by the auditor and the queue workers.

mod models;
mod schema;
mod sqlite_ops_store;

pub use models::*;
pub use schema::OPS_VERSIONED_SCHEMAS;
pub use sqlite_ops_store::SqliteOpsStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait OpsStore: Send + Sync {
    fn record_job_start(&self, job_id: &str, triggered_by: &str) -> Result<i64>;
    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<()>;
    fn get_running_jobs(&self) -> Result<Vec<JobRun>>;
    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>>;
    fn get_last_run(&self, job_id: &str) -> Result<Option<JobRun>>;
    fn mark_stale_jobs_failed(&self) -> Result<usize>;

    // Schedule state
    fn get_schedule_state(&self, job_id: &str) -> Result<Option<JobScheduleState>>;
    fn update_schedule_state(&self, state: &JobScheduleState) -> Result<()>;

    // Job audit log
    fn log_job_audit(
        &self,
        job_id: &str,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<i64>;
    fn get_job_audit_log(&self, limit: usize, offset: usize) -> Result<Vec<JobAuditEntry>>;
    fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>>;

    // Alerts
    fn record_alert(
        &self,
        kind: AlertKind,
        petition_id: Option<i64>,
        details: Option<&serde_json::Value>,
    ) -> Result<i64>;
    /// Most recent alerts first, optionally restricted to one kind.
    fn get_alerts(&self, kind: Option<AlertKind>, limit: usize) -> Result<Vec<EngineAlert>>;

    // Retention
    /// Deletes finished job runs that started before `before`. Running ones are kept.
    fn prune_job_runs(&self, before: DateTime<Utc>) -> Result<usize>;
    fn prune_job_audit_log(&self, before: DateTime<Utc>) -> Result<usize>;
    fn prune_alerts(&self, before: DateTime<Utc>) -> Result<usize>;
}
