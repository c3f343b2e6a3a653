//! Anonymization of archived petitions' signatures after the retention period.

use super::archive::load_petition;
use super::batch::{enqueue_continuation, run_batch, BatchOutcome, BatchStep};
use super::{EngineContext, EngineJob};
use crate::error::{EngineError, EngineResult};
use crate::petition_store::{PetitionStore, RowOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Redacts personal fields on live and archived signatures; the petition's
/// `anonymized_at` is the terminal marker.
pub struct AnonymizeSignaturesStep {
    store: Arc<dyn PetitionStore>,
    petition_id: i64,
}

impl AnonymizeSignaturesStep {
    pub fn new(store: Arc<dyn PetitionStore>, petition_id: i64) -> Self {
        Self { store, petition_id }
    }
}

impl BatchStep for AnonymizeSignaturesStep {
    fn name(&self) -> &'static str {
        "anonymize_signatures"
    }

    fn is_done(&self) -> EngineResult<bool> {
        let petition = self
            .store
            .get_petition(self.petition_id)
            .map_err(EngineError::from_store)?
            .ok_or(EngineError::PetitionNotFound(self.petition_id))?;
        Ok(petition.anonymized_at.is_some())
    }

    fn pending_ids(&self, after: Option<i64>, limit: usize) -> EngineResult<Vec<i64>> {
        self.store
            .unanonymized_signature_ids(self.petition_id, after, limit)
            .map_err(EngineError::from_store)
    }

    fn has_pending(&self) -> EngineResult<bool> {
        self.store
            .has_unanonymized_signatures(self.petition_id)
            .map_err(EngineError::from_store)
    }

    fn process_row(&self, id: i64, now: DateTime<Utc>) -> EngineResult<RowOutcome> {
        self.store
            .anonymize_signature(id, now)
            .map_err(EngineError::from_store)
    }

    fn finish(&self, now: DateTime<Utc>) -> EngineResult<()> {
        self.store
            .mark_petition_anonymized(self.petition_id, now)
            .map_err(EngineError::from_store)?;
        Ok(())
    }
}

pub fn anonymize_signatures(
    ctx: &EngineContext,
    petition_id: i64,
    after_id: Option<i64>,
    cancellation: &CancellationToken,
) -> EngineResult<BatchOutcome> {
    let petition = load_petition(ctx, petition_id)?;
    if petition.archived_at.is_none() {
        return Err(EngineError::InvalidPayload(format!(
            "petition {} must be archived before it is anonymized",
            petition_id
        )));
    }

    let step = AnonymizeSignaturesStep::new(ctx.petition_store.clone(), petition_id);
    let outcome = run_batch(&step, cancellation, after_id, ctx.settings.anonymize_batch_limit)?;
    enqueue_continuation(ctx, &outcome, |after_id| EngineJob::AnonymizeSignatures {
        petition_id,
        after_id,
    })?;
    Ok(outcome)
}
