//! Two-step count reset.
//!
//! Step one sets the petition's reset flag, which freezes the counter for that
//! petition. Step two recounts, rebuilds the journals and clears the flag in a
//! single transaction, conditional on the flag still being the one step one set.

use super::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::petition_store::{ResetClaim, ResetOutcome};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

pub fn reset_signature_count(
    ctx: &EngineContext,
    petition_id: i64,
    now: DateTime<Utc>,
) -> EngineResult<ResetOutcome> {
    let started_at = match ctx
        .petition_store
        .begin_signature_count_reset(petition_id, now)
        .map_err(EngineError::from_store)?
    {
        ResetClaim::Claimed { started_at } => started_at,
        ResetClaim::InProgress { started_at } => {
            return Err(EngineError::ResetInProgress {
                petition_id,
                since: started_at,
            })
        }
        ResetClaim::NotFound => return Err(EngineError::PetitionNotFound(petition_id)),
    };
    debug!("Claimed count reset of petition {} at {}", petition_id, started_at);

    match ctx
        .petition_store
        .complete_signature_count_reset(petition_id, started_at, now)
    {
        Ok(Some(outcome)) => {
            if outcome.previous_count != outcome.signature_count {
                metrics::record_correction_applied();
                info!(
                    "Corrected signature count of petition {}: {} -> {}",
                    petition_id, outcome.previous_count, outcome.signature_count
                );
            }
            Ok(outcome)
        }
        Ok(None) => Err(EngineError::RowConflict(format!(
            "reset flag of petition {} no longer matches {}",
            petition_id, started_at
        ))),
        Err(err) => {
            warn!(
                "Count reset of petition {} failed, releasing flag: {:#}",
                petition_id, err
            );
            match ctx
                .petition_store
                .abort_signature_count_reset(petition_id, started_at)
            {
                Ok(_) => Err(EngineError::from_store(err)),
                Err(abort_err) => {
                    error!(
                        "Could not release reset flag of petition {}: {:#}",
                        petition_id, abort_err
                    );
                    Err(EngineError::StuckReset {
                        petition_id,
                        reason: format!("{:#}; abort failed: {:#}", err, abort_err),
                    })
                }
            }
        }
    }
}
