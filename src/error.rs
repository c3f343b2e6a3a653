//! Errors raised by engine components.

use crate::job_queue::{ErrorClass, JobFailure};
use crate::sqlite_persistence::is_constraint_violation;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Built through [`EngineError::from_store`].
    #[error("Store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    /// A unique or primary key constraint rejected a write.
    #[error("Row conflict: {0}")]
    RowConflict(String),

    #[error("Petition {0} not found")]
    PetitionNotFound(i64),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Petition {petition_id} has a count reset in progress since {since}")]
    ResetInProgress {
        petition_id: i64,
        since: DateTime<Utc>,
    },

    /// A reset could neither complete nor release its flag.
    #[error("Count reset of petition {petition_id} is stuck: {reason}")]
    StuckReset { petition_id: i64, reason: String },
}

impl EngineError {
    /// Wraps a store error, turning constraint violations into `RowConflict`.
    pub fn from_store(err: anyhow::Error) -> Self {
        let conflict = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<rusqlite::Error>())
            .any(is_constraint_violation);
        if conflict {
            EngineError::RowConflict(format!("{:#}", err))
        } else {
            EngineError::StoreUnavailable(err)
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::StoreUnavailable(_) => ErrorClass::Transient,
            EngineError::RowConflict(_) => ErrorClass::Conflict,
            EngineError::PetitionNotFound(_) => ErrorClass::MissingRecord,
            EngineError::InvalidPayload(_) => ErrorClass::InvalidPayload,
            EngineError::ResetInProgress { .. } => ErrorClass::Transient,
            EngineError::StuckReset { .. } => ErrorClass::StuckCorrection,
        }
    }

    pub fn petition_id(&self) -> Option<i64> {
        match self {
            EngineError::PetitionNotFound(id) => Some(*id),
            EngineError::ResetInProgress { petition_id, .. }
            | EngineError::StuckReset { petition_id, .. } => Some(*petition_id),
            _ => None,
        }
    }
}

impl From<EngineError> for JobFailure {
    fn from(err: EngineError) -> Self {
        let failure = JobFailure::new(err.class(), err.to_string());
        match err.petition_id() {
            Some(id) => failure.for_petition(id),
            None => failure,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
