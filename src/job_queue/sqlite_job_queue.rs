use super::models::*;
use super::schema::QUEUE_VERSIONED_SCHEMAS;
use super::JobQueue;
use crate::sqlite_persistence::{
    from_millis, open_in_memory_db, open_versioned_db, opt_from_millis, to_millis,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const DEFAULT_MAX_ATTEMPTS: u32 = 10;

const JOB_COLUMNS: &str = "id, job_type, payload, lane, status, unique_key, run_at, attempts, \
     max_attempts, last_error, locked_by, locked_at, created_at, finished_at";

pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
    default_max_attempts: u32,
}

impl SqliteJobQueue {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), QUEUE_VERSIONED_SCHEMAS, "queue")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory_db(QUEUE_VERSIONED_SCHEMAS)?)),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Attempts allowed for jobs enqueued without an explicit limit.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<QueuedJob> {
        let payload: String = row.get("payload")?;
        let status: String = row.get("status")?;
        Ok(QueuedJob {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            payload: serde_json::from_str(&payload).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            lane: QueueLane::from_rank(row.get("lane")?).unwrap_or(QueueLane::Default),
            status: QueuedJobStatus::parse(&status).unwrap_or(QueuedJobStatus::Dead),
            unique_key: row.get("unique_key")?,
            run_at: from_millis(row.get("run_at")?),
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            last_error: row.get("last_error")?,
            locked_by: row.get("locked_by")?,
            locked_at: opt_from_millis(row.get("locked_at")?),
            created_at: from_millis(row.get("created_at")?),
            finished_at: opt_from_millis(row.get("finished_at")?),
        })
    }

    fn pending_with_key(tx: &Transaction, unique_key: &str, except: i64) -> Result<Option<i64>> {
        let id = tx
            .query_row(
                "SELECT id FROM job_queue WHERE unique_key = ?1 AND status = 'pending' AND id != ?2
                 ORDER BY id LIMIT 1",
                params![unique_key, except],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn finish(&self, job_id: i64, status: QueuedJobStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_queue
             SET status = ?1, last_error = COALESCE(?2, last_error), finished_at = ?3,
                 locked_by = NULL, locked_at = NULL
             WHERE id = ?4",
            params![status.as_str(), error, to_millis(&Utc::now()), job_id],
        )?;
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, job: &NewJob) -> Result<EnqueueOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = &job.unique_key {
            if let Some(existing) = Self::pending_with_key(&tx, key, 0)? {
                debug!("Job {} already pending as #{}", key, existing);
                return Ok(EnqueueOutcome::Duplicate(existing));
            }
        }

        tx.execute(
            "INSERT INTO job_queue (job_type, payload, lane, status, unique_key, run_at, attempts,
                                    max_attempts, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0, ?6, ?7)",
            params![
                job.job_type,
                job.payload.to_string(),
                job.lane.rank(),
                job.unique_key,
                to_millis(&job.run_at),
                job.max_attempts.unwrap_or(self.default_max_attempts),
                to_millis(&Utc::now())
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(EnqueueOutcome::Enqueued(id))
    }

    fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&now);

        let candidate: Option<i64> = tx
            .query_row(
                "SELECT id FROM job_queue WHERE status = 'pending' AND run_at <= ?1
                 ORDER BY lane, run_at, id LIMIT 1",
                params![now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE job_queue
             SET status = 'running', attempts = attempts + 1, locked_by = ?1, locked_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![worker_id, now, job_id],
        )?;
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?1"),
            params![job_id],
            Self::row_to_job,
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    fn complete(&self, job_id: i64) -> Result<()> {
        self.finish(job_id, QueuedJobStatus::Completed, None)
    }

    fn schedule_retry(&self, job_id: i64, run_at: DateTime<Utc>, error: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let unique_key: Option<Option<String>> = tx
            .query_row(
                "SELECT unique_key FROM job_queue WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let superseded = match unique_key.flatten() {
            Some(key) => Self::pending_with_key(&tx, &key, job_id)?.is_some(),
            None => false,
        };

        if superseded {
            tx.execute(
                "UPDATE job_queue SET status = 'dead', last_error = ?1, finished_at = ?2,
                        locked_by = NULL, locked_at = NULL
                 WHERE id = ?3",
                params![
                    format!("superseded after: {}", error),
                    to_millis(&Utc::now()),
                    job_id
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE job_queue SET status = 'pending', run_at = ?1, last_error = ?2,
                        locked_by = NULL, locked_at = NULL
                 WHERE id = ?3",
                params![to_millis(&run_at), error, job_id],
            )?;
        }
        tx.commit()?;
        Ok(!superseded)
    }

    fn mark_dead(&self, job_id: i64, error: &str) -> Result<()> {
        self.finish(job_id, QueuedJobStatus::Dead, Some(error))
    }

    fn release_stale(&self, locked_before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&Utc::now());

        let stale: Vec<(i64, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, unique_key FROM job_queue WHERE status = 'running' AND locked_at < ?1
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![to_millis(&locked_before)], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut released = 0;
        for (job_id, unique_key) in stale {
            let superseded = match &unique_key {
                Some(key) => Self::pending_with_key(&tx, key, job_id)?.is_some(),
                None => false,
            };
            if superseded {
                tx.execute(
                    "UPDATE job_queue SET status = 'dead', last_error = 'superseded while stale',
                            finished_at = ?1, locked_by = NULL, locked_at = NULL
                     WHERE id = ?2",
                    params![now, job_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE job_queue SET status = 'pending', run_at = ?1, locked_by = NULL, locked_at = NULL
                     WHERE id = ?2",
                    params![now, job_id],
                )?;
                released += 1;
            }
        }
        tx.commit()?;

        if released > 0 {
            info!("Released {} stale running jobs", released);
        }
        Ok(released)
    }

    fn lane_depths(&self) -> Result<Vec<LaneDepth>> {
        let conn = self.conn.lock().unwrap();
        let mut depths: Vec<LaneDepth> = QueueLane::ALL
            .iter()
            .map(|lane| LaneDepth {
                lane: *lane,
                pending: 0,
                running: 0,
            })
            .collect();

        let mut stmt = conn.prepare(
            "SELECT lane, status, COUNT(*) FROM job_queue
             WHERE status IN ('pending', 'running') GROUP BY lane, status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (rank, status, count) in rows {
            let Some(depth) = depths.iter_mut().find(|d| d.lane.rank() == rank) else {
                continue;
            };
            match status.as_str() {
                "pending" => depth.pending = count as usize,
                _ => depth.running = count as usize,
            }
        }
        Ok(depths)
    }

    fn get_job(&self, job_id: i64) -> Result<Option<QueuedJob>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?1"),
                params![job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, status: Option<QueuedJobStatus>, limit: usize) -> Result<Vec<QueuedJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_queue WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                Self::row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let purged = conn.execute(
            "DELETE FROM job_queue WHERE status IN ('completed', 'dead') AND finished_at < ?1",
            params![to_millis(&before)],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn job(job_type: &str, lane: QueueLane) -> NewJob {
        NewJob::new(job_type, json!({})).lane(lane).run_at(Utc::now() - Duration::seconds(1))
    }

    #[test]
    fn test_claims_by_lane_then_run_at() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let base = Utc::now() - Duration::minutes(10);
        queue
            .enqueue(&job("low", QueueLane::Low).run_at(base))
            .unwrap();
        queue
            .enqueue(&job("high_late", QueueLane::High).run_at(base + Duration::minutes(2)))
            .unwrap();
        queue
            .enqueue(&job("high_early", QueueLane::High).run_at(base + Duration::minutes(1)))
            .unwrap();
        queue
            .enqueue(&job("highest", QueueLane::Highest).run_at(base + Duration::minutes(5)))
            .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| {
            queue
                .claim_next("w1", Utc::now())
                .unwrap()
                .map(|j| j.job_type)
        })
        .collect();
        assert_eq!(order, vec!["highest", "high_early", "high_late", "low"]);
    }

    #[test]
    fn test_future_jobs_are_not_claimed() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        queue
            .enqueue(&NewJob::new("later", json!({})).run_at(Utc::now() + Duration::minutes(5)))
            .unwrap();
        assert!(queue.claim_next("w1", Utc::now()).unwrap().is_none());
        assert!(queue
            .claim_next("w1", Utc::now() + Duration::minutes(6))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_claim_marks_running_and_counts_attempts() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = queue
            .enqueue(&job("a", QueueLane::Default))
            .unwrap()
            .job_id();

        let claimed = queue.claim_next("worker-1", Utc::now()).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, QueuedJobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));
        assert!(queue.claim_next("worker-2", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_unique_key_only_deduplicates_pending() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let first = queue
            .enqueue(&job("counter", QueueLane::High).unique_key("update_signature_counts"))
            .unwrap();
        let second = queue
            .enqueue(&job("counter", QueueLane::High).unique_key("update_signature_counts"))
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate(first.job_id()));

        queue.claim_next("w1", Utc::now()).unwrap().unwrap();
        let successor = queue
            .enqueue(&job("counter", QueueLane::High).unique_key("update_signature_counts"))
            .unwrap();
        assert!(!successor.is_duplicate());
    }

    #[test]
    fn test_retry_and_dead() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let id = queue.enqueue(&job("a", QueueLane::Default)).unwrap().job_id();
        queue.claim_next("w1", Utc::now()).unwrap();

        let later = Utc::now() + Duration::minutes(1);
        assert!(queue.schedule_retry(id, later, "db busy").unwrap());
        let retried = queue.get_job(id).unwrap().unwrap();
        assert_eq!(retried.status, QueuedJobStatus::Pending);
        assert_eq!(retried.last_error.as_deref(), Some("db busy"));
        assert!(retried.locked_by.is_none());
        assert!(queue.claim_next("w1", Utc::now()).unwrap().is_none());

        let claimed = queue.claim_next("w1", later).unwrap().unwrap();
        assert_eq!(claimed.attempts, 2);
        queue.mark_dead(id, "bad payload").unwrap();
        let dead = queue.get_job(id).unwrap().unwrap();
        assert_eq!(dead.status, QueuedJobStatus::Dead);
        assert!(dead.finished_at.is_some());
    }

    #[test]
    fn test_retry_superseded_by_pending_duplicate() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let running = queue
            .enqueue(&job("reset", QueueLane::Highest).unique_key("reset_signature_count:1"))
            .unwrap()
            .job_id();
        queue.claim_next("w1", Utc::now()).unwrap();
        queue
            .enqueue(&job("reset", QueueLane::Highest).unique_key("reset_signature_count:1"))
            .unwrap();

        assert!(!queue.schedule_retry(running, Utc::now(), "conflict").unwrap());
        assert_eq!(
            queue.get_job(running).unwrap().unwrap().status,
            QueuedJobStatus::Dead
        );
    }

    #[test]
    fn test_release_stale() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        let plain = queue.enqueue(&job("plain", QueueLane::Default)).unwrap().job_id();
        let keyed = queue
            .enqueue(&job("keyed", QueueLane::Default).unique_key("archive_petition:3"))
            .unwrap()
            .job_id();
        queue.claim_next("dead-worker", Utc::now()).unwrap();
        queue.claim_next("dead-worker", Utc::now()).unwrap();
        queue
            .enqueue(&job("keyed", QueueLane::Default).unique_key("archive_petition:3"))
            .unwrap();

        assert_eq!(
            queue.release_stale(Utc::now() - Duration::hours(1)).unwrap(),
            0
        );
        let released = queue
            .release_stale(Utc::now() + Duration::minutes(1))
            .unwrap();

        assert_eq!(released, 1);
        assert_eq!(
            queue.get_job(plain).unwrap().unwrap().status,
            QueuedJobStatus::Pending
        );
        assert_eq!(
            queue.get_job(keyed).unwrap().unwrap().status,
            QueuedJobStatus::Dead
        );
    }

    #[test]
    fn test_lane_depths_and_purge() {
        let queue = SqliteJobQueue::in_memory().unwrap();
        queue.enqueue(&job("a", QueueLane::Low)).unwrap();
        queue.enqueue(&job("b", QueueLane::Low)).unwrap();
        let done = queue.enqueue(&job("c", QueueLane::Highest)).unwrap().job_id();
        queue.claim_next("w1", Utc::now()).unwrap();

        let depths = queue.lane_depths().unwrap();
        let low = depths.iter().find(|d| d.lane == QueueLane::Low).unwrap();
        let highest = depths.iter().find(|d| d.lane == QueueLane::Highest).unwrap();
        assert_eq!(low.pending, 2);
        assert_eq!(highest.running, 1);

        queue.complete(done).unwrap();
        assert_eq!(queue.purge_finished(Utc::now() - Duration::hours(1)).unwrap(), 0);
        assert_eq!(queue.purge_finished(Utc::now() + Duration::seconds(1)).unwrap(), 1);
        assert_eq!(queue.list_jobs(None, 10).unwrap().len(), 2);
        assert_eq!(
            queue
                .list_jobs(Some(QueuedJobStatus::Pending), 10)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_reopen_keeps_pending_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue.db");
        {
            let queue = SqliteJobQueue::new(&path).unwrap();
            queue.enqueue(&job("a", QueueLane::Default)).unwrap();
        }
        let queue = SqliteJobQueue::new(&path).unwrap();
        assert!(queue.claim_next("w1", Utc::now()).unwrap().is_some());
    }
}
