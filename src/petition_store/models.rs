use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder written over personal fields when a signature is anonymized.
pub const REDACTED: &str = "[redacted]";

/// Moderation state of a petition. The engine only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetitionState {
    Pending,
    Validated,
    Sponsored,
    Open,
    Closed,
    Rejected,
    Hidden,
}

impl PetitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PetitionState::Pending => "pending",
            PetitionState::Validated => "validated",
            PetitionState::Sponsored => "sponsored",
            PetitionState::Open => "open",
            PetitionState::Closed => "closed",
            PetitionState::Rejected => "rejected",
            PetitionState::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PetitionState::Pending),
            "validated" => Some(PetitionState::Validated),
            "sponsored" => Some(PetitionState::Sponsored),
            "open" => Some(PetitionState::Open),
            "closed" => Some(PetitionState::Closed),
            "rejected" => Some(PetitionState::Rejected),
            "hidden" => Some(PetitionState::Hidden),
            _ => None,
        }
    }

    /// Petitions in these states no longer collect signatures and can be archived.
    pub fn is_archivable(&self) -> bool {
        matches!(self, PetitionState::Closed | PetitionState::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureState {
    Pending,
    Validated,
    Invalidated,
}

impl SignatureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureState::Pending => "pending",
            SignatureState::Validated => "validated",
            SignatureState::Invalidated => "invalidated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SignatureState::Pending),
            "validated" => Some(SignatureState::Validated),
            "invalidated" => Some(SignatureState::Invalidated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Petition {
    pub id: i64,
    pub action: String,
    pub state: PetitionState,
    /// Cached total, correct as of `signature_count_validated_at`.
    pub signature_count: i64,
    pub last_signed_at: Option<DateTime<Utc>>,
    /// Progress cursor of the counter.
    pub signature_count_validated_at: Option<DateTime<Utc>>,
    /// Set while a count reset holds the petition.
    pub signature_count_reset_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Petition {
    /// Validated signatures exist past the counter's cursor.
    pub fn has_uncounted_signatures(&self) -> bool {
        match (self.last_signed_at, self.signature_count_validated_at) {
            (Some(last_signed_at), Some(cursor)) => last_signed_at > cursor,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPetition {
    pub action: String,
    pub state: PetitionState,
    pub opened_at: Option<DateTime<Utc>>,
}

impl NewPetition {
    pub fn open(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            state: PetitionState::Open,
            opened_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub id: i64,
    pub petition_id: i64,
    pub state: SignatureState,
    pub name: String,
    pub email: String,
    pub postcode: Option<String>,
    pub ip_address: Option<String>,
    pub constituency_id: Option<String>,
    pub location_code: String,
    pub validated_at: Option<DateTime<Utc>>,
    pub creator: bool,
    pub sponsor: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub anonymized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSignature {
    pub petition_id: i64,
    pub name: String,
    pub email: String,
    pub postcode: Option<String>,
    pub ip_address: Option<String>,
    pub constituency_id: Option<String>,
    pub location_code: String,
    pub creator: bool,
    pub sponsor: bool,
}

/// The two breakdowns kept alongside every petition total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalDimension {
    Constituency,
    Country,
}

impl JournalDimension {
    pub const ALL: [JournalDimension; 2] = [JournalDimension::Constituency, JournalDimension::Country];

    pub fn as_str(&self) -> &'static str {
        match self {
            JournalDimension::Constituency => "constituency",
            JournalDimension::Country => "country",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            JournalDimension::Constituency => "constituency_journals",
            JournalDimension::Country => "country_journals",
        }
    }

    /// Column naming the dimension key, both in the journal and in `signatures`.
    pub(crate) fn key_column(&self) -> &'static str {
        match self {
            JournalDimension::Constituency => "constituency_id",
            JournalDimension::Country => "location_code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub petition_id: i64,
    pub key: String,
    pub signature_count: i64,
    pub last_signed_at: Option<DateTime<Utc>>,
}

/// A committed counter advance for one petition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountAdvance {
    pub petition_id: i64,
    pub prior_cursor: Option<DateTime<Utc>>,
    pub cursor: DateTime<Utc>,
    pub delta: i64,
    pub signature_count: i64,
    /// Journal rows advanced in the same transaction.
    pub journal_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced(CountAdvance),
    /// No validated signatures in the interval.
    NothingToCount,
    /// Cursor moved or a reset flag appeared since the caller read the petition.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetClaim {
    Claimed { started_at: DateTime<Utc> },
    InProgress { started_at: DateTime<Utc> },
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub previous_count: i64,
    pub signature_count: i64,
}

/// Result of transforming one row of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Processed,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedPetition {
    pub id: i64,
    pub action: String,
    pub state: PetitionState,
    pub signature_count: i64,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub constituency_breakdown: BTreeMap<String, i64>,
    pub country_breakdown: BTreeMap<String, i64>,
    pub archived_at: Option<DateTime<Utc>>,
    pub anonymized_at: Option<DateTime<Utc>>,
}
