use super::models::{
    AlertKind, EngineAlert, JobAuditEntry, JobAuditEventType, JobRun, JobRunStatus,
    JobScheduleState,
};
use super::schema::OPS_VERSIONED_SCHEMAS;
use super::OpsStore;
use crate::sqlite_persistence::{open_in_memory_db, open_versioned_db};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct SqliteOpsStore {
    conn: Arc<Mutex<Connection>>,
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

impl SqliteOpsStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), OPS_VERSIONED_SCHEMAS, "ops")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory_db(OPS_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_job_run(row: &rusqlite::Row) -> rusqlite::Result<JobRun> {
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;

        Ok(JobRun {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            started_at: parse_datetime(&started_at).unwrap_or_else(Utc::now),
            finished_at: finished_at.as_deref().and_then(parse_datetime),
            status: JobRunStatus::parse(&status).unwrap_or(JobRunStatus::Failed),
            error_message: row.get("error_message")?,
            triggered_by: row.get("triggered_by")?,
        })
    }

    fn row_to_schedule_state(row: &rusqlite::Row) -> rusqlite::Result<JobScheduleState> {
        let next_run_at: String = row.get("next_run_at")?;
        let last_run_at: Option<String> = row.get("last_run_at")?;

        Ok(JobScheduleState {
            job_id: row.get("job_id")?,
            next_run_at: parse_datetime(&next_run_at).unwrap_or_else(Utc::now),
            last_run_at: last_run_at.as_deref().and_then(parse_datetime),
        })
    }

    fn row_to_audit_entry(row: &rusqlite::Row) -> rusqlite::Result<JobAuditEntry> {
        let event_type: String = row.get("event_type")?;
        let timestamp: String = row.get("timestamp")?;
        let details: Option<String> = row.get("details")?;

        Ok(JobAuditEntry {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            event_type: JobAuditEventType::parse(&event_type)
                .unwrap_or(JobAuditEventType::Progress),
            timestamp: parse_datetime(&timestamp)
                .unwrap_or_else(Utc::now)
                .timestamp(),
            duration_ms: row.get("duration_ms")?,
            details: details.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get("error")?,
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<Option<EngineAlert>> {
        let kind: String = row.get("kind")?;
        let Some(kind) = AlertKind::parse(&kind) else {
            return Ok(None);
        };
        let created_at: String = row.get("created_at")?;
        let details: Option<String> = row.get("details")?;

        Ok(Some(EngineAlert {
            id: row.get("id")?,
            kind,
            petition_id: row.get("petition_id")?,
            details: details.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_datetime(&created_at).unwrap_or_else(Utc::now),
        }))
    }
}

impl OpsStore for SqliteOpsStore {
    fn record_job_start(&self, job_id: &str, triggered_by: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_runs (job_id, started_at, status, triggered_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id,
                format_datetime(&Utc::now()),
                JobRunStatus::Running.as_str(),
                triggered_by
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_job_finish(
        &self,
        run_id: i64,
        status: JobRunStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_runs SET finished_at = ?1, status = ?2, error_message = ?3 WHERE id = ?4",
            params![
                format_datetime(&Utc::now()),
                status.as_str(),
                error_message,
                run_id
            ],
        )?;
        Ok(())
    }

    fn get_running_jobs(&self) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, started_at, finished_at, status, error_message, triggered_by
             FROM job_runs WHERE status = ?1 ORDER BY started_at DESC",
        )?;
        let runs = stmt
            .query_map(
                params![JobRunStatus::Running.as_str()],
                Self::row_to_job_run,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn get_job_history(&self, job_id: &str, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, started_at, finished_at, status, error_message, triggered_by
             FROM job_runs WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![job_id, limit as i64], Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn get_last_run(&self, job_id: &str) -> Result<Option<JobRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                "SELECT id, job_id, started_at, finished_at, status, error_message, triggered_by
                 FROM job_runs WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![job_id],
                Self::row_to_job_run,
            )
            .optional()?;
        Ok(run)
    }

    fn mark_stale_jobs_failed(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        // Anything still "running" at startup was interrupted by the previous process.
        let count = conn.execute(
            "UPDATE job_runs SET status = ?1, finished_at = ?2, error_message = ?3
             WHERE status = ?4",
            params![
                JobRunStatus::Failed.as_str(),
                format_datetime(&Utc::now()),
                "Job was interrupted (worker restart)",
                JobRunStatus::Running.as_str()
            ],
        )?;
        Ok(count)
    }

    fn get_schedule_state(&self, job_id: &str) -> Result<Option<JobScheduleState>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT job_id, next_run_at, last_run_at FROM job_schedules WHERE job_id = ?1",
                params![job_id],
                Self::row_to_schedule_state,
            )
            .optional()?;
        Ok(state)
    }

    fn update_schedule_state(&self, state: &JobScheduleState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_schedules (job_id, next_run_at, last_run_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET next_run_at = ?2, last_run_at = ?3",
            params![
                state.job_id,
                format_datetime(&state.next_run_at),
                state.last_run_at.as_ref().map(format_datetime)
            ],
        )?;
        Ok(())
    }

    fn log_job_audit(
        &self,
        job_id: &str,
        event_type: JobAuditEventType,
        duration_ms: Option<i64>,
        details: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_audit_log (job_id, event_type, timestamp, duration_ms, details, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job_id,
                event_type.as_str(),
                format_datetime(&Utc::now()),
                duration_ms,
                details.map(|d| d.to_string()),
                error
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_job_audit_log(&self, limit: usize, offset: usize) -> Result<Vec<JobAuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, timestamp, duration_ms, details, error
             FROM job_audit_log ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let entries = stmt
            .query_map(
                params![limit as i64, offset as i64],
                Self::row_to_audit_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn get_job_audit_log_by_job(
        &self,
        job_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobAuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, timestamp, duration_ms, details, error
             FROM job_audit_log WHERE job_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let entries = stmt
            .query_map(
                params![job_id, limit as i64, offset as i64],
                Self::row_to_audit_entry,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn record_alert(
        &self,
        kind: AlertKind,
        petition_id: Option<i64>,
        details: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO engine_alerts (kind, petition_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                kind.as_str(),
                petition_id,
                details.map(|d| d.to_string()),
                format_datetime(&Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_alerts(&self, kind: Option<AlertKind>, limit: usize) -> Result<Vec<EngineAlert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, petition_id, details, created_at FROM engine_alerts
             WHERE (?1 IS NULL OR kind = ?1)
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let alerts = stmt
            .query_map(
                params![kind.map(|k| k.as_str()), limit as i64],
                Self::row_to_alert,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts.into_iter().flatten().collect())
    }

    fn prune_job_runs(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM job_runs WHERE finished_at IS NOT NULL AND started_at < ?1",
            params![format_datetime(&before)],
        )?;
        Ok(deleted)
    }

    fn prune_job_audit_log(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM job_audit_log WHERE timestamp < ?1",
            params![format_datetime(&before)],
        )?;
        Ok(deleted)
    }

    fn prune_alerts(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM engine_alerts WHERE created_at < ?1",
            params![format_datetime(&before)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_job_start_and_finish() {
        let store = SqliteOpsStore::in_memory().unwrap();

        let run_id = store.record_job_start("signature_count_audit", "manual").unwrap();
        assert!(run_id > 0);

        let running = store.get_running_jobs().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, JobRunStatus::Running);

        store
            .record_job_finish(run_id, JobRunStatus::Completed, None)
            .unwrap();

        assert!(store.get_running_jobs().unwrap().is_empty());
        let history = store.get_job_history("signature_count_audit", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobRunStatus::Completed);
        assert!(history[0].finished_at.is_some());
    }

    #[test]
    fn test_mark_stale_jobs_failed() {
        let store = SqliteOpsStore::in_memory().unwrap();
        store.record_job_start("a", "schedule").unwrap();
        store.record_job_start("b", "schedule").unwrap();

        assert_eq!(store.mark_stale_jobs_failed().unwrap(), 2);
        let last = store.get_last_run("a").unwrap().unwrap();
        assert_eq!(last.status, JobRunStatus::Failed);
        assert!(last.error_message.unwrap().contains("interrupted"));
    }

    #[test]
    fn test_schedule_state_upsert() {
        let store = SqliteOpsStore::in_memory().unwrap();
        assert!(store.get_schedule_state("job").unwrap().is_none());

        let next = Utc::now() + chrono::Duration::hours(1);
        store
            .update_schedule_state(&JobScheduleState {
                job_id: "job".to_string(),
                next_run_at: next,
                last_run_at: None,
            })
            .unwrap();
        store
            .update_schedule_state(&JobScheduleState {
                job_id: "job".to_string(),
                next_run_at: next,
                last_run_at: Some(Utc::now()),
            })
            .unwrap();

        let state = store.get_schedule_state("job").unwrap().unwrap();
        assert_eq!(state.next_run_at.timestamp(), next.timestamp());
        assert!(state.last_run_at.is_some());
    }

    #[test]
    fn test_audit_log_by_job() {
        let store = SqliteOpsStore::in_memory().unwrap();
        let details = serde_json::json!({ "petitions_checked": 3 });
        store
            .log_job_audit("audit", JobAuditEventType::Started, None, None, None)
            .unwrap();
        store
            .log_job_audit(
                "audit",
                JobAuditEventType::Completed,
                Some(12),
                Some(&details),
                None,
            )
            .unwrap();
        store
            .log_job_audit("other", JobAuditEventType::Failed, None, None, Some("boom"))
            .unwrap();

        assert_eq!(store.get_job_audit_log(10, 0).unwrap().len(), 3);
        let entries = store.get_job_audit_log_by_job("audit", 10, 0).unwrap();
        assert_eq!(entries.len(), 2);
        let completed = entries
            .iter()
            .find(|e| e.event_type == JobAuditEventType::Completed)
            .unwrap();
        assert_eq!(completed.duration_ms, Some(12));
        assert_eq!(completed.details.as_ref().unwrap()["petitions_checked"], 3);
    }

    #[test]
    fn test_alerts_filtered_by_kind() {
        let store = SqliteOpsStore::in_memory().unwrap();
        let details = serde_json::json!({ "cached": 900, "actual": 1200 });
        store
            .record_alert(AlertKind::Drift, Some(7), Some(&details))
            .unwrap();
        store.record_alert(AlertKind::StuckReset, Some(8), None).unwrap();

        assert_eq!(store.get_alerts(None, 10).unwrap().len(), 2);
        let drift = store.get_alerts(Some(AlertKind::Drift), 10).unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].petition_id, Some(7));
        assert_eq!(drift[0].details.as_ref().unwrap()["actual"], 1200);
    }

    fn backdate(store: &SqliteOpsStore, sql: &str, days: i64) {
        let then = format_datetime(&(Utc::now() - chrono::Duration::days(days)));
        store.conn.lock().unwrap().execute(sql, params![then]).unwrap();
    }

    #[test]
    fn test_prune_removes_only_old_rows() {
        let store = SqliteOpsStore::in_memory().unwrap();
        let old_run = store.record_job_start("audit", "schedule").unwrap();
        store
            .record_job_finish(old_run, JobRunStatus::Completed, None)
            .unwrap();
        store.record_job_start("stuck", "schedule").unwrap();
        backdate(&store, "UPDATE job_runs SET started_at = ?1", 40);
        let recent_run = store.record_job_start("audit", "schedule").unwrap();
        store
            .record_job_finish(recent_run, JobRunStatus::Completed, None)
            .unwrap();

        store
            .log_job_audit("audit", JobAuditEventType::Started, None, None, None)
            .unwrap();
        backdate(&store, "UPDATE job_audit_log SET timestamp = ?1", 40);
        store
            .log_job_audit("audit", JobAuditEventType::Completed, None, None, None)
            .unwrap();

        store.record_alert(AlertKind::Drift, Some(1), None).unwrap();
        backdate(&store, "UPDATE engine_alerts SET created_at = ?1", 40);
        store.record_alert(AlertKind::Drift, Some(2), None).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.prune_job_runs(cutoff).unwrap(), 1);
        assert_eq!(store.prune_job_audit_log(cutoff).unwrap(), 1);
        assert_eq!(store.prune_alerts(cutoff).unwrap(), 1);

        let history = store.get_job_history("audit", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, recent_run);
        assert_eq!(store.get_running_jobs().unwrap().len(), 1);
        let entries = store.get_job_audit_log(10, 0).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, JobAuditEventType::Completed);
        let alerts = store.get_alerts(None, 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].petition_id, Some(2));
    }

    #[test]
    fn test_reopen_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ops.db");
        {
            let store = SqliteOpsStore::new(&path).unwrap();
            store.record_job_start("job", "manual").unwrap();
        }
        let store = SqliteOpsStore::new(&path).unwrap();
        assert_eq!(store.get_job_history("job", 10).unwrap().len(), 1);
    }
}
