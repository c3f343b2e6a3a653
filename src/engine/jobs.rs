//! Queue payloads understood by the engine and the performer that routes them.

use super::{anonymize, archive, corrector, counter, EngineContext};
use crate::error::{EngineError, EngineResult};
use crate::job_queue::{ErrorClass, JobFailure, JobPerformer, NewJob, QueueLane, QueuedJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One unit of engine work. The serialized enum is the queue payload and
/// the variant name doubles as the job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineJob {
    /// `time` is the nominal pass time; None means "when claimed".
    UpdateSignatureCounts {
        #[serde(default)]
        time: Option<DateTime<Utc>>,
    },
    ResetSignatureCount {
        petition_id: i64,
    },
    ArchivePetition {
        petition_id: i64,
    },
    ArchiveSignatures {
        petition_id: i64,
        #[serde(default)]
        after_id: Option<i64>,
    },
    AnonymizeSignatures {
        petition_id: i64,
        #[serde(default)]
        after_id: Option<i64>,
    },
}

impl EngineJob {
    pub fn job_type(&self) -> &'static str {
        match self {
            EngineJob::UpdateSignatureCounts { .. } => "update_signature_counts",
            EngineJob::ResetSignatureCount { .. } => "reset_signature_count",
            EngineJob::ArchivePetition { .. } => "archive_petition",
            EngineJob::ArchiveSignatures { .. } => "archive_signatures",
            EngineJob::AnonymizeSignatures { .. } => "anonymize_signatures",
        }
    }

    pub fn lane(&self) -> QueueLane {
        match self {
            EngineJob::UpdateSignatureCounts { .. } => QueueLane::High,
            EngineJob::ResetSignatureCount { .. } => QueueLane::Highest,
            EngineJob::ArchivePetition { .. }
            | EngineJob::ArchiveSignatures { .. }
            | EngineJob::AnonymizeSignatures { .. } => QueueLane::Low,
        }
    }

    /// At most one pending job per key; continuations share their parent's key.
    pub fn unique_key(&self) -> String {
        match self {
            EngineJob::UpdateSignatureCounts { .. } => self.job_type().to_string(),
            EngineJob::ResetSignatureCount { petition_id }
            | EngineJob::ArchivePetition { petition_id }
            | EngineJob::ArchiveSignatures { petition_id, .. }
            | EngineJob::AnonymizeSignatures { petition_id, .. } => {
                format!("{}:{}", self.job_type(), petition_id)
            }
        }
    }

    pub fn petition_id(&self) -> Option<i64> {
        match self {
            EngineJob::UpdateSignatureCounts { .. } => None,
            EngineJob::ResetSignatureCount { petition_id }
            | EngineJob::ArchivePetition { petition_id }
            | EngineJob::ArchiveSignatures { petition_id, .. }
            | EngineJob::AnonymizeSignatures { petition_id, .. } => Some(*petition_id),
        }
    }

    pub fn to_new_job(&self) -> EngineResult<NewJob> {
        let payload = serde_json::to_value(self)
            .map_err(|e| EngineError::InvalidPayload(format!("{}: {}", self.job_type(), e)))?;
        Ok(NewJob::new(self.job_type(), payload)
            .lane(self.lane())
            .unique_key(self.unique_key()))
    }

    pub fn from_queued(job: &QueuedJob) -> EngineResult<Self> {
        let engine_job: EngineJob = serde_json::from_value(job.payload.clone()).map_err(|e| {
            EngineError::InvalidPayload(format!("job #{} ({}): {}", job.id, job.job_type, e))
        })?;
        if engine_job.job_type() != job.job_type {
            return Err(EngineError::InvalidPayload(format!(
                "job #{} is typed {} but carries a {} payload",
                job.id,
                job.job_type,
                engine_job.job_type()
            )));
        }
        Ok(engine_job)
    }
}

/// Routes claimed queue jobs to the engine component that owns them.
pub struct EngineDispatcher {
    ctx: EngineContext,
}

impl EngineDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    fn run(&self, job: &EngineJob, cancellation: &CancellationToken) -> EngineResult<()> {
        match job {
            EngineJob::UpdateSignatureCounts { time } => {
                let report = counter::update_signature_counts(&self.ctx, *time)?;
                debug!(
                    "Counter pass up to {} advanced {} petitions by {} signatures",
                    report.horizon, report.petitions_advanced, report.signatures_counted
                );
            }
            EngineJob::ResetSignatureCount { petition_id } => {
                let outcome = corrector::reset_signature_count(&self.ctx, *petition_id, Utc::now())?;
                info!(
                    "Signature count of petition {} reset from {} to {}",
                    petition_id, outcome.previous_count, outcome.signature_count
                );
            }
            EngineJob::ArchivePetition { petition_id } => {
                archive::archive_petition(&self.ctx, *petition_id, cancellation)?;
            }
            EngineJob::ArchiveSignatures {
                petition_id,
                after_id,
            } => {
                archive::archive_signatures(&self.ctx, *petition_id, *after_id, cancellation)?;
            }
            EngineJob::AnonymizeSignatures {
                petition_id,
                after_id,
            } => {
                anonymize::anonymize_signatures(&self.ctx, *petition_id, *after_id, cancellation)?;
            }
        }
        Ok(())
    }
}

impl JobPerformer for EngineDispatcher {
    fn perform(&self, job: &QueuedJob, cancellation: &CancellationToken) -> Result<(), JobFailure> {
        let engine_job = EngineJob::from_queued(job)?;

        self.run(&engine_job, cancellation).map_err(|err| {
            let counter_pass = matches!(engine_job, EngineJob::UpdateSignatureCounts { .. })
                && matches!(err, EngineError::StoreUnavailable(_));
            let mut failure = JobFailure::from(err);
            if counter_pass {
                failure.class = ErrorClass::CounterPass;
            }
            if failure.petition_id.is_none() {
                failure.petition_id = engine_job.petition_id();
            }
            failure
        })
    }
}
