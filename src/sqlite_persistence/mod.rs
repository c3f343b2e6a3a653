//! SQLite plumbing shared by every store in the engine.

mod versioned_schema;

pub use versioned_schema::*;

use chrono::{DateTime, Utc};

/// Timestamps are persisted as Unix milliseconds.
pub fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn opt_to_millis(dt: Option<&DateTime<Utc>>) -> Option<i64> {
    dt.map(to_millis)
}

pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// True when the error is a SQLite constraint violation (unique, primary key, foreign key).
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
