//! Archiving of closed and rejected petitions.
//!
//! Runs in two jobs: the petition record with its journal breakdowns first,
//! then its signatures in bounded batches. The petition's `archived_at` is
//! set only after the last signature has been copied.

use super::batch::{enqueue_continuation, run_batch, BatchOutcome, BatchStep};
use super::{after, EngineContext, EngineJob};
use crate::error::{EngineError, EngineResult};
use crate::petition_store::{Petition, PetitionStore, RowOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub(crate) fn load_petition(ctx: &EngineContext, petition_id: i64) -> EngineResult<Petition> {
    ctx.petition_store
        .get_petition(petition_id)
        .map_err(EngineError::from_store)?
        .ok_or(EngineError::PetitionNotFound(petition_id))
}

/// The single row is the petition itself, pending while no archived copy exists.
pub struct ArchivePetitionStep {
    store: Arc<dyn PetitionStore>,
    petition_id: i64,
}

impl ArchivePetitionStep {
    pub fn new(store: Arc<dyn PetitionStore>, petition_id: i64) -> Self {
        Self { store, petition_id }
    }

    fn copied(&self) -> EngineResult<bool> {
        self.store
            .is_petition_record_archived(self.petition_id)
            .map_err(EngineError::from_store)
    }
}

impl BatchStep for ArchivePetitionStep {
    fn name(&self) -> &'static str {
        "archive_petition"
    }

    fn is_done(&self) -> EngineResult<bool> {
        self.copied()
    }

    fn pending_ids(&self, after: Option<i64>, _limit: usize) -> EngineResult<Vec<i64>> {
        if after.is_some_and(|after| after >= self.petition_id) || self.copied()? {
            return Ok(Vec::new());
        }
        Ok(vec![self.petition_id])
    }

    fn has_pending(&self) -> EngineResult<bool> {
        Ok(!self.copied()?)
    }

    fn process_row(&self, id: i64, _now: DateTime<Utc>) -> EngineResult<RowOutcome> {
        self.store
            .archive_petition_record(id)
            .map_err(EngineError::from_store)
    }

    /// The archived copy is the marker.
    fn finish(&self, _now: DateTime<Utc>) -> EngineResult<()> {
        Ok(())
    }
}

pub struct ArchiveSignaturesStep {
    store: Arc<dyn PetitionStore>,
    petition_id: i64,
}

impl ArchiveSignaturesStep {
    pub fn new(store: Arc<dyn PetitionStore>, petition_id: i64) -> Self {
        Self { store, petition_id }
    }
}

impl BatchStep for ArchiveSignaturesStep {
    fn name(&self) -> &'static str {
        "archive_signatures"
    }

    fn is_done(&self) -> EngineResult<bool> {
        let petition = self
            .store
            .get_petition(self.petition_id)
            .map_err(EngineError::from_store)?
            .ok_or(EngineError::PetitionNotFound(self.petition_id))?;
        Ok(petition.archived_at.is_some())
    }

    fn pending_ids(&self, after: Option<i64>, limit: usize) -> EngineResult<Vec<i64>> {
        self.store
            .unarchived_signature_ids(self.petition_id, after, limit)
            .map_err(EngineError::from_store)
    }

    fn has_pending(&self) -> EngineResult<bool> {
        self.store
            .has_unarchived_signatures(self.petition_id)
            .map_err(EngineError::from_store)
    }

    fn process_row(&self, id: i64, now: DateTime<Utc>) -> EngineResult<RowOutcome> {
        self.store
            .archive_signature(id, now)
            .map_err(EngineError::from_store)
    }

    fn finish(&self, now: DateTime<Utc>) -> EngineResult<()> {
        self.store
            .mark_petition_archived(self.petition_id, now)
            .map_err(EngineError::from_store)?;
        Ok(())
    }
}

/// The archived record freezes the total and both breakdowns, so it waits for
/// a reset in flight and for the counter to pass the last validated signature.
fn counts_pending(ctx: &EngineContext, petition: &Petition) -> bool {
    petition.signature_count_reset_at.is_some()
        || (ctx.settings.counter_enabled && petition.has_uncounted_signatures())
}

/// Copies the petition record, then hands over to signature archiving.
pub fn archive_petition(
    ctx: &EngineContext,
    petition_id: i64,
    cancellation: &CancellationToken,
) -> EngineResult<BatchOutcome> {
    let petition = load_petition(ctx, petition_id)?;
    if !petition.state.is_archivable() {
        return Err(EngineError::InvalidPayload(format!(
            "petition {} is {} and cannot be archived",
            petition_id,
            petition.state.as_str()
        )));
    }

    let step = ArchivePetitionStep::new(ctx.petition_store.clone(), petition_id);
    if !step.is_done()? && counts_pending(ctx, &petition) {
        let retry_at = after(Utc::now(), ctx.settings.signature_count_interval());
        info!(
            "Petition {} still has counting to settle, archiving at {}",
            petition_id, retry_at
        );
        ctx.enqueue(&EngineJob::ArchivePetition { petition_id }, retry_at)?;
        return Ok(BatchOutcome::Deferred);
    }
    let outcome = run_batch(&step, cancellation, None, 1)?;

    match outcome {
        BatchOutcome::Finished { .. } | BatchOutcome::AlreadyDone
            if petition.archived_at.is_none() =>
        {
            ctx.enqueue(
                &EngineJob::ArchiveSignatures {
                    petition_id,
                    after_id: None,
                },
                Utc::now(),
            )?;
        }
        _ => enqueue_continuation(ctx, &outcome, |_| EngineJob::ArchivePetition { petition_id })?,
    }
    Ok(outcome)
}

/// Copies the next batch of signatures and, once none are left, marks the
/// petition archived.
pub fn archive_signatures(
    ctx: &EngineContext,
    petition_id: i64,
    after_id: Option<i64>,
    cancellation: &CancellationToken,
) -> EngineResult<BatchOutcome> {
    let petition = load_petition(ctx, petition_id)?;
    if petition.archived_at.is_none()
        && !ctx
            .petition_store
            .is_petition_record_archived(petition_id)
            .map_err(EngineError::from_store)?
    {
        info!(
            "Petition {} record not archived yet, archiving it first",
            petition_id
        );
        ctx.enqueue(&EngineJob::ArchivePetition { petition_id }, Utc::now())?;
        return Ok(BatchOutcome::Deferred);
    }

    let step = ArchiveSignaturesStep::new(ctx.petition_store.clone(), petition_id);
    let outcome = run_batch(&step, cancellation, after_id, ctx.settings.archive_batch_limit)?;
    enqueue_continuation(ctx, &outcome, |after_id| EngineJob::ArchiveSignatures {
        petition_id,
        after_id,
    })?;
    Ok(outcome)
}
