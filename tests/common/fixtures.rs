//! Engine fixtures backed by real SQLite stores.

#![allow(dead_code)]

use super::constants::*;
use chrono::{DateTime, Utc};
use signature_engine::config::EngineSettings;
use signature_engine::job_queue::{JobQueue, QueuedJobStatus};
use signature_engine::petition_store::{NewPetition, NewSignature, Petition, PetitionStore};
use signature_engine::{EngineContext, EngineJob, SqliteJobQueue, SqliteOpsStore, SqlitePetitionStore};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestEngine {
    pub ctx: EngineContext,
    pub petitions: Arc<SqlitePetitionStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub ops: Arc<SqliteOpsStore>,
    /// Keeps on-disk databases alive for the test's duration.
    _dir: Option<TempDir>,
}

impl TestEngine {
    pub fn in_memory() -> Self {
        Self::in_memory_with(EngineSettings::default())
    }

    pub fn in_memory_with(settings: EngineSettings) -> Self {
        let petitions = Arc::new(SqlitePetitionStore::in_memory().unwrap());
        let queue = Arc::new(SqliteJobQueue::in_memory().unwrap());
        let ops = Arc::new(SqliteOpsStore::in_memory().unwrap());
        Self::assemble(petitions, queue, ops, settings, None)
    }

    /// Stores in `petitions.db`, `queue.db` and `ops.db` under a temp dir.
    pub fn on_disk(settings: EngineSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let petitions = Arc::new(SqlitePetitionStore::new(dir.path().join("petitions.db")).unwrap());
        let queue = Arc::new(SqliteJobQueue::new(dir.path().join("queue.db")).unwrap());
        let ops = Arc::new(SqliteOpsStore::new(dir.path().join("ops.db")).unwrap());
        Self::assemble(petitions, queue, ops, settings, Some(dir))
    }

    fn assemble(
        petitions: Arc<SqlitePetitionStore>,
        queue: Arc<SqliteJobQueue>,
        ops: Arc<SqliteOpsStore>,
        settings: EngineSettings,
        dir: Option<TempDir>,
    ) -> Self {
        let ctx = EngineContext::new(petitions.clone(), queue.clone(), ops.clone(), settings);
        Self {
            ctx,
            petitions,
            queue,
            ops,
            _dir: dir,
        }
    }

    pub fn open_petition(&self, action: &str) -> i64 {
        self.petitions
            .insert_petition(&NewPetition::open(action))
            .unwrap()
    }

    pub fn close(&self, petition_id: i64) {
        assert!(self.petitions.close_petition(petition_id, Utc::now()).unwrap());
    }

    pub fn petition(&self, petition_id: i64) -> Petition {
        self.petitions.get_petition(petition_id).unwrap().unwrap()
    }

    /// Inserts a pending signature and returns its id.
    pub fn add_signature(&self, petition_id: i64, constituency: &str) -> i64 {
        self.petitions
            .insert_signature(&NewSignature {
                petition_id,
                name: "Jo Bloggs".to_string(),
                email: "jo@example.com".to_string(),
                postcode: Some("CF10 1EP".to_string()),
                ip_address: Some("192.0.2.10".to_string()),
                constituency_id: Some(constituency.to_string()),
                location_code: COUNTRY_GB.to_string(),
                creator: false,
                sponsor: false,
            })
            .unwrap()
    }

    /// Inserts `n` signatures validated at `at`, returning their ids.
    pub fn add_validated_signatures(
        &self,
        petition_id: i64,
        constituency: &str,
        n: usize,
        at: DateTime<Utc>,
    ) -> Vec<i64> {
        (0..n)
            .map(|_| {
                let id = self.add_signature(petition_id, constituency);
                assert!(self.petitions.validate_signature(id, at).unwrap());
                id
            })
            .collect()
    }

    /// Advances the petition's count to `horizon` without queueing a next pass.
    pub fn count_up_to(&self, petition_id: i64, horizon: DateTime<Utc>) {
        let cursor = self.petition(petition_id).signature_count_validated_at;
        self.petitions
            .advance_signature_count(petition_id, cursor, horizon)
            .unwrap();
    }

    pub fn pending_jobs(&self) -> Vec<EngineJob> {
        self.queue
            .list_jobs(Some(QueuedJobStatus::Pending), 1000)
            .unwrap()
            .iter()
            .map(|job| EngineJob::from_queued(job).unwrap())
            .collect()
    }
}

pub fn count_interval() -> chrono::Duration {
    chrono::Duration::seconds(COUNT_INTERVAL_SECS)
}
