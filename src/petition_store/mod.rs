//! Petitions, signatures, their journals and the archive.
//!
//! Writes issued by the counter, the corrector and the batch steps are
//! conditional updates inside `BEGIN IMMEDIATE` transactions, so several
//! engine processes can share one database file.

mod journals;
mod models;
mod schema;
mod sqlite_petition_store;

pub use models::*;
pub use schema::PETITION_VERSIONED_SCHEMAS;
pub use sqlite_petition_store::SqlitePetitionStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait PetitionStore: Send + Sync {
    // =========================================================================
    // Signing and moderation flows
    // =========================================================================

    fn insert_petition(&self, petition: &NewPetition) -> Result<i64>;
    fn get_petition(&self, petition_id: i64) -> Result<Option<Petition>>;
    /// Moves an open petition to `closed`. Returns false if it was not open.
    fn close_petition(&self, petition_id: i64, at: DateTime<Utc>) -> Result<bool>;
    /// Moves a petition to `rejected` from any state that is not already final.
    fn reject_petition(&self, petition_id: i64, at: DateTime<Utc>) -> Result<bool>;

    fn insert_signature(&self, signature: &NewSignature) -> Result<i64>;
    fn get_signature(&self, signature_id: i64) -> Result<Option<Signature>>;
    /// Marks a pending signature validated and bumps the petition's `last_signed_at`.
    fn validate_signature(&self, signature_id: i64, at: DateTime<Utc>) -> Result<bool>;
    /// Leaves cached totals untouched; the drift auditor picks up the difference.
    fn invalidate_signature(&self, signature_id: i64) -> Result<bool>;

    // =========================================================================
    // Counter
    // =========================================================================

    /// Petitions with validated signatures past their cursor and no reset in flight.
    fn petitions_with_uncounted_signatures(&self) -> Result<Vec<Petition>>;

    /// Counts `(prior_cursor, horizon]` and advances the cached count, the cursor
    /// and both journals in one transaction, provided the cursor is still
    /// `prior_cursor` and no reset holds the petition.
    fn advance_signature_count(
        &self,
        petition_id: i64,
        prior_cursor: Option<DateTime<Utc>>,
        horizon: DateTime<Utc>,
    ) -> Result<AdvanceOutcome>;

    /// Validated signatures with `validated_at <= until`.
    fn count_validated_signatures(&self, petition_id: i64, until: DateTime<Utc>) -> Result<i64>;

    // =========================================================================
    // Journals
    // =========================================================================

    fn journal_entries(
        &self,
        petition_id: i64,
        dimension: JournalDimension,
    ) -> Result<Vec<JournalEntry>>;
    fn journal_total(&self, petition_id: i64, dimension: JournalDimension) -> Result<i64>;

    // =========================================================================
    // Auditor and corrector
    // =========================================================================

    /// Petitions signed at or after `since` with no reset in flight.
    fn petitions_signed_since(&self, since: DateTime<Utc>) -> Result<Vec<Petition>>;
    /// Petitions whose reset flag was set before `cutoff`.
    fn petitions_with_reset_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Petition>>;

    fn begin_signature_count_reset(&self, petition_id: i64, now: DateTime<Utc>)
        -> Result<ResetClaim>;
    /// Recounts, rebuilds the journals and clears the flag set at `started_at`.
    /// Returns None when the flag is no longer the one this reset set.
    fn complete_signature_count_reset(
        &self,
        petition_id: i64,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetOutcome>>;
    fn abort_signature_count_reset(&self, petition_id: i64, started_at: DateTime<Utc>)
        -> Result<bool>;

    // =========================================================================
    // Archive
    // =========================================================================

    /// Closed or rejected petitions not yet archived.
    fn petitions_awaiting_archive(&self) -> Result<Vec<i64>>;
    fn is_petition_record_archived(&self, petition_id: i64) -> Result<bool>;
    /// Copies the petition and its journal breakdowns into `archived_petitions`.
    /// A second copy of the same petition fails with a constraint violation.
    fn archive_petition_record(&self, petition_id: i64) -> Result<RowOutcome>;
    fn get_archived_petition(&self, petition_id: i64) -> Result<Option<ArchivedPetition>>;

    fn unarchived_signature_ids(
        &self,
        petition_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>>;
    fn has_unarchived_signatures(&self, petition_id: i64) -> Result<bool>;
    fn archive_signature(&self, signature_id: i64, now: DateTime<Utc>) -> Result<RowOutcome>;
    fn count_archived_signatures(&self, petition_id: i64) -> Result<i64>;
    /// Sets `archived_at` on the petition and its archived copy, once.
    fn mark_petition_archived(&self, petition_id: i64, now: DateTime<Utc>) -> Result<bool>;

    // =========================================================================
    // Anonymization
    // =========================================================================

    /// Archived petitions closed before `closed_before` and not yet anonymized.
    fn petitions_awaiting_anonymization(&self, closed_before: DateTime<Utc>) -> Result<Vec<i64>>;
    fn unanonymized_signature_ids(
        &self,
        petition_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>>;
    fn has_unanonymized_signatures(&self, petition_id: i64) -> Result<bool>;
    fn anonymize_signature(&self, signature_id: i64, now: DateTime<Utc>) -> Result<RowOutcome>;
    fn mark_petition_anonymized(&self, petition_id: i64, now: DateTime<Utc>) -> Result<bool>;
}
