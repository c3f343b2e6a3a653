//! Per-constituency and per-country breakdowns of a petition's count.
//!
//! Journals only move together with the petition cursor: `record_interval` runs
//! inside the counter's transaction for exactly the interval it advanced, and
//! `rebuild` runs inside the corrector's transaction.

use super::models::{JournalDimension, JournalEntry};
use crate::sqlite_persistence::{opt_from_millis, to_millis};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// Validated signatures in `(since, until]` grouped by the dimension key:
/// `(key, count, max(validated_at))`. Signatures without a key are skipped.
fn validated_by_key(
    conn: &Connection,
    dimension: JournalDimension,
    petition_id: i64,
    since: Option<i64>,
    until: i64,
) -> Result<Vec<(String, i64, i64)>> {
    let sql = format!(
        "SELECT {key}, COUNT(*), MAX(validated_at) FROM signatures
         WHERE petition_id = ?1 AND state = 'validated' AND {key} IS NOT NULL
           AND (?2 IS NULL OR validated_at > ?2) AND validated_at <= ?3
         GROUP BY {key} ORDER BY {key}",
        key = dimension.key_column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![petition_id, since, until], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Advances both journals by the signatures validated in `(since, until]`.
///
/// A row whose `last_signed_at` is already past `since` has seen this interval,
/// so replaying it changes nothing. Returns the number of journal rows advanced.
pub(crate) fn record_interval(
    conn: &Connection,
    petition_id: i64,
    since: Option<&DateTime<Utc>>,
    until: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Result<usize> {
    let since = since.map(to_millis);
    let until = to_millis(until);
    let now = to_millis(now);
    let mut advanced = 0;

    for dimension in JournalDimension::ALL {
        let table = dimension.table();
        let key_column = dimension.key_column();
        for (key, count, max_validated_at) in
            validated_by_key(conn, dimension, petition_id, since, until)?
        {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (petition_id, {key_column}, signature_count, last_signed_at, created_at, updated_at)
                     VALUES (?1, ?2, 0, NULL, ?3, ?3)
                     ON CONFLICT(petition_id, {key_column}) DO NOTHING"
                ),
                params![petition_id, key, now],
            )?;
            advanced += conn.execute(
                &format!(
                    "UPDATE {table}
                     SET signature_count = signature_count + ?1, last_signed_at = ?2, updated_at = ?3
                     WHERE petition_id = ?4 AND {key_column} = ?5
                       AND (last_signed_at IS NULL OR last_signed_at <= ?6)"
                ),
                params![count, max_validated_at, now, petition_id, key, since],
            )?;
        }
    }
    Ok(advanced)
}

/// Recomputes both journals from scratch up to `until`.
///
/// Keys that no longer have any validated signature keep their row at zero.
pub(crate) fn rebuild(
    conn: &Connection,
    petition_id: i64,
    until: &DateTime<Utc>,
    now: &DateTime<Utc>,
) -> Result<()> {
    let until = to_millis(until);
    let now = to_millis(now);

    for dimension in JournalDimension::ALL {
        let table = dimension.table();
        let key_column = dimension.key_column();
        conn.execute(
            &format!("UPDATE {table} SET signature_count = 0, updated_at = ?1 WHERE petition_id = ?2"),
            params![now, petition_id],
        )?;
        for (key, count, max_validated_at) in
            validated_by_key(conn, dimension, petition_id, None, until)?
        {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (petition_id, {key_column}, signature_count, last_signed_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(petition_id, {key_column}) DO UPDATE SET
                        signature_count = excluded.signature_count,
                        last_signed_at = excluded.last_signed_at,
                        updated_at = excluded.updated_at"
                ),
                params![petition_id, key, count, max_validated_at, now],
            )?;
        }
    }
    Ok(())
}

pub(crate) fn entries(
    conn: &Connection,
    petition_id: i64,
    dimension: JournalDimension,
) -> Result<Vec<JournalEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT petition_id, {key}, signature_count, last_signed_at FROM {table}
         WHERE petition_id = ?1 ORDER BY {key}",
        key = dimension.key_column(),
        table = dimension.table()
    ))?;
    let entries = stmt
        .query_map(params![petition_id], |row| {
            Ok(JournalEntry {
                petition_id: row.get(0)?,
                key: row.get(1)?,
                signature_count: row.get(2)?,
                last_signed_at: opt_from_millis(row.get(3)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub(crate) fn total(conn: &Connection, petition_id: i64, dimension: JournalDimension) -> Result<i64> {
    let total = conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(signature_count), 0) FROM {} WHERE petition_id = ?1",
            dimension.table()
        ),
        params![petition_id],
        |row| row.get(0),
    )?;
    Ok(total)
}
