use super::journals;
use super::models::*;
use super::schema::PETITION_VERSIONED_SCHEMAS;
use super::PetitionStore;
use crate::sqlite_persistence::{
    from_millis, is_constraint_violation, open_in_memory_db, open_versioned_db, opt_from_millis,
    opt_to_millis, to_millis,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const PETITION_COLUMNS: &str = "id, action, state, signature_count, last_signed_at, \
     signature_count_validated_at, signature_count_reset_at, opened_at, closed_at, \
     archived_at, anonymized_at, created_at";

const SIGNATURE_COLUMNS: &str = "id, petition_id, state, name, email, postcode, ip_address, \
     constituency_id, location_code, validated_at, creator, sponsor, archived_at, \
     anonymized_at, created_at";

pub struct SqlitePetitionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePetitionStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), PETITION_VERSIONED_SCHEMAS, "petition")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory_db(PETITION_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_petition(row: &rusqlite::Row) -> rusqlite::Result<Petition> {
        let state: String = row.get("state")?;
        Ok(Petition {
            id: row.get("id")?,
            action: row.get("action")?,
            state: PetitionState::parse(&state).unwrap_or(PetitionState::Hidden),
            signature_count: row.get("signature_count")?,
            last_signed_at: opt_from_millis(row.get("last_signed_at")?),
            signature_count_validated_at: opt_from_millis(row.get("signature_count_validated_at")?),
            signature_count_reset_at: opt_from_millis(row.get("signature_count_reset_at")?),
            opened_at: opt_from_millis(row.get("opened_at")?),
            closed_at: opt_from_millis(row.get("closed_at")?),
            archived_at: opt_from_millis(row.get("archived_at")?),
            anonymized_at: opt_from_millis(row.get("anonymized_at")?),
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn row_to_signature(row: &rusqlite::Row) -> rusqlite::Result<Signature> {
        let state: String = row.get("state")?;
        Ok(Signature {
            id: row.get("id")?,
            petition_id: row.get("petition_id")?,
            state: SignatureState::parse(&state).unwrap_or(SignatureState::Invalidated),
            name: row.get("name")?,
            email: row.get("email")?,
            postcode: row.get("postcode")?,
            ip_address: row.get("ip_address")?,
            constituency_id: row.get("constituency_id")?,
            location_code: row.get("location_code")?,
            validated_at: opt_from_millis(row.get("validated_at")?),
            creator: row.get("creator")?,
            sponsor: row.get("sponsor")?,
            archived_at: opt_from_millis(row.get("archived_at")?),
            anonymized_at: opt_from_millis(row.get("anonymized_at")?),
            created_at: from_millis(row.get("created_at")?),
        })
    }

    fn row_to_archived_petition(row: &rusqlite::Row) -> rusqlite::Result<ArchivedPetition> {
        fn breakdown(row: &rusqlite::Row, column: &str) -> rusqlite::Result<BTreeMap<String, i64>> {
            let raw: String = row.get(column)?;
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        }

        let state: String = row.get("state")?;
        Ok(ArchivedPetition {
            id: row.get("id")?,
            action: row.get("action")?,
            state: PetitionState::parse(&state).unwrap_or(PetitionState::Closed),
            signature_count: row.get("signature_count")?,
            opened_at: opt_from_millis(row.get("opened_at")?),
            closed_at: opt_from_millis(row.get("closed_at")?),
            created_at: from_millis(row.get("created_at")?),
            constituency_breakdown: breakdown(row, "constituency_breakdown")?,
            country_breakdown: breakdown(row, "country_breakdown")?,
            archived_at: opt_from_millis(row.get("archived_at")?),
            anonymized_at: opt_from_millis(row.get("anonymized_at")?),
        })
    }

    fn query_petitions(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Petition>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {PETITION_COLUMNS} FROM petitions WHERE {filter} ORDER BY id"
        ))?;
        let petitions = stmt
            .query_map(params, Self::row_to_petition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(petitions)
    }

    fn query_ids(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn count_validated(conn: &Connection, petition_id: i64, since: Option<i64>, until: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM signatures
             WHERE petition_id = ?1 AND state = 'validated'
               AND (?2 IS NULL OR validated_at > ?2) AND validated_at <= ?3",
            params![petition_id, since, until],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn breakdown(
        conn: &Connection,
        petition_id: i64,
        dimension: JournalDimension,
    ) -> Result<String> {
        let map: BTreeMap<String, i64> = journals::entries(conn, petition_id, dimension)?
            .into_iter()
            .map(|entry| (entry.key, entry.signature_count))
            .collect();
        Ok(serde_json::to_string(&map)?)
    }
}

impl PetitionStore for SqlitePetitionStore {
    fn insert_petition(&self, petition: &NewPetition) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = to_millis(&Utc::now());
        conn.execute(
            "INSERT INTO petitions (action, state, signature_count, opened_at, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?4)",
            params![
                petition.action,
                petition.state.as_str(),
                opt_to_millis(petition.opened_at.as_ref()),
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_petition(&self, petition_id: i64) -> Result<Option<Petition>> {
        let conn = self.conn.lock().unwrap();
        let petition = conn
            .query_row(
                &format!("SELECT {PETITION_COLUMNS} FROM petitions WHERE id = ?1"),
                params![petition_id],
                Self::row_to_petition,
            )
            .optional()?;
        Ok(petition)
    }

    fn close_petition(&self, petition_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let at = to_millis(&at);
        let updated = conn.execute(
            "UPDATE petitions SET state = 'closed', closed_at = ?1, updated_at = ?1
             WHERE id = ?2 AND state = 'open'",
            params![at, petition_id],
        )?;
        Ok(updated > 0)
    }

    fn reject_petition(&self, petition_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let at = to_millis(&at);
        let updated = conn.execute(
            "UPDATE petitions SET state = 'rejected', closed_at = COALESCE(closed_at, ?1), updated_at = ?1
             WHERE id = ?2 AND state NOT IN ('closed', 'rejected')",
            params![at, petition_id],
        )?;
        Ok(updated > 0)
    }

    fn insert_signature(&self, signature: &NewSignature) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signatures (petition_id, state, name, email, postcode, ip_address,
                                     constituency_id, location_code, creator, sponsor, created_at)
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                signature.petition_id,
                signature.name,
                signature.email,
                signature.postcode,
                signature.ip_address,
                signature.constituency_id,
                signature.location_code,
                signature.creator,
                signature.sponsor,
                to_millis(&Utc::now())
            ],
        )
        .with_context(|| format!("Failed to insert signature for petition {}", signature.petition_id))?;
        Ok(conn.last_insert_rowid())
    }

    fn get_signature(&self, signature_id: i64) -> Result<Option<Signature>> {
        let conn = self.conn.lock().unwrap();
        let signature = conn
            .query_row(
                &format!("SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE id = ?1"),
                params![signature_id],
                Self::row_to_signature,
            )
            .optional()?;
        Ok(signature)
    }

    fn validate_signature(&self, signature_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = to_millis(&at);

        let updated = tx.execute(
            "UPDATE signatures SET state = 'validated', validated_at = ?1
             WHERE id = ?2 AND state = 'pending'",
            params![at, signature_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        let petition_id: i64 = tx.query_row(
            "SELECT petition_id FROM signatures WHERE id = ?1",
            params![signature_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE petitions SET last_signed_at = MAX(COALESCE(last_signed_at, ?1), ?1), updated_at = ?1
             WHERE id = ?2",
            params![at, petition_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn invalidate_signature(&self, signature_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE signatures SET state = 'invalidated' WHERE id = ?1 AND state != 'invalidated'",
            params![signature_id],
        )?;
        Ok(updated > 0)
    }

    fn petitions_with_uncounted_signatures(&self) -> Result<Vec<Petition>> {
        let conn = self.conn.lock().unwrap();
        Self::query_petitions(
            &conn,
            "signature_count_reset_at IS NULL AND last_signed_at IS NOT NULL
             AND (signature_count_validated_at IS NULL OR last_signed_at > signature_count_validated_at)",
            [],
        )
    }

    fn advance_signature_count(
        &self,
        petition_id: i64,
        prior_cursor: Option<DateTime<Utc>>,
        horizon: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let prior = opt_to_millis(prior_cursor.as_ref());
        let until = to_millis(&horizon);
        if matches!(prior, Some(prior) if prior >= until) {
            return Ok(AdvanceOutcome::NothingToCount);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let delta = Self::count_validated(&tx, petition_id, prior, until)?;
        if delta == 0 {
            // Signatures that were invalidated before being counted still moved
            // last_signed_at, so the cursor has to pass them.
            tx.execute(
                "UPDATE petitions SET signature_count_validated_at = ?1
                 WHERE id = ?2 AND signature_count_reset_at IS NULL
                   AND signature_count_validated_at IS ?3",
                params![until, petition_id, prior],
            )?;
            tx.commit()?;
            return Ok(AdvanceOutcome::NothingToCount);
        }

        let updated = tx.execute(
            "UPDATE petitions
             SET signature_count = signature_count + ?1, signature_count_validated_at = ?2, updated_at = ?3
             WHERE id = ?4 AND signature_count_reset_at IS NULL AND signature_count_validated_at IS ?5",
            params![delta, until, to_millis(&now), petition_id, prior],
        )?;
        if updated == 0 {
            debug!(
                "Petition {} cursor moved or reset in flight, skipping advance",
                petition_id
            );
            return Ok(AdvanceOutcome::Conflict);
        }

        let journal_rows =
            journals::record_interval(&tx, petition_id, prior_cursor.as_ref(), &horizon, &now)?;
        let signature_count: i64 = tx.query_row(
            "SELECT signature_count FROM petitions WHERE id = ?1",
            params![petition_id],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(AdvanceOutcome::Advanced(CountAdvance {
            petition_id,
            prior_cursor,
            cursor: from_millis(until),
            delta,
            signature_count,
            journal_rows,
        }))
    }

    fn count_validated_signatures(&self, petition_id: i64, until: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Self::count_validated(&conn, petition_id, None, to_millis(&until))
    }

    fn journal_entries(
        &self,
        petition_id: i64,
        dimension: JournalDimension,
    ) -> Result<Vec<JournalEntry>> {
        let conn = self.conn.lock().unwrap();
        journals::entries(&conn, petition_id, dimension)
    }

    fn journal_total(&self, petition_id: i64, dimension: JournalDimension) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        journals::total(&conn, petition_id, dimension)
    }

    fn petitions_signed_since(&self, since: DateTime<Utc>) -> Result<Vec<Petition>> {
        let conn = self.conn.lock().unwrap();
        Self::query_petitions(
            &conn,
            "last_signed_at >= ?1 AND signature_count_reset_at IS NULL",
            params![to_millis(&since)],
        )
    }

    fn petitions_with_reset_started_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Petition>> {
        let conn = self.conn.lock().unwrap();
        Self::query_petitions(
            &conn,
            "signature_count_reset_at IS NOT NULL AND signature_count_reset_at < ?1",
            params![to_millis(&cutoff)],
        )
    }

    fn begin_signature_count_reset(
        &self,
        petition_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ResetClaim> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&now);

        let flag: Option<Option<i64>> = tx
            .query_row(
                "SELECT signature_count_reset_at FROM petitions WHERE id = ?1",
                params![petition_id],
                |row| row.get(0),
            )
            .optional()?;

        match flag {
            None => Ok(ResetClaim::NotFound),
            Some(Some(started_at)) => Ok(ResetClaim::InProgress {
                started_at: from_millis(started_at),
            }),
            Some(None) => {
                tx.execute(
                    "UPDATE petitions SET signature_count_reset_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND signature_count_reset_at IS NULL",
                    params![now, petition_id],
                )?;
                tx.commit()?;
                Ok(ResetClaim::Claimed {
                    started_at: from_millis(now),
                })
            }
        }
    }

    fn complete_signature_count_reset(
        &self,
        petition_id: i64,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetOutcome>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let started_at = to_millis(&started_at);

        let held: Option<(i64, Option<i64>)> = tx
            .query_row(
                "SELECT signature_count, signature_count_validated_at FROM petitions
                 WHERE id = ?1 AND signature_count_reset_at = ?2",
                params![petition_id, started_at],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((previous_count, cursor)) = held else {
            return Ok(None);
        };

        // The recount becomes the new cursor, which never moves backwards.
        let until = cursor.map_or(to_millis(&now), |cursor| cursor.max(to_millis(&now)));
        let signature_count = Self::count_validated(&tx, petition_id, None, until)?;
        journals::rebuild(&tx, petition_id, &from_millis(until), &now)?;

        tx.execute(
            "UPDATE petitions
             SET signature_count = ?1, signature_count_validated_at = ?2,
                 signature_count_reset_at = NULL, updated_at = ?3
             WHERE id = ?4 AND signature_count_reset_at = ?5",
            params![signature_count, until, to_millis(&now), petition_id, started_at],
        )?;
        tx.commit()?;

        Ok(Some(ResetOutcome {
            previous_count,
            signature_count,
        }))
    }

    fn abort_signature_count_reset(
        &self,
        petition_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE petitions SET signature_count_reset_at = NULL
             WHERE id = ?1 AND signature_count_reset_at = ?2",
            params![petition_id, to_millis(&started_at)],
        )?;
        Ok(updated > 0)
    }

    fn petitions_awaiting_archive(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM petitions
             WHERE state IN ('closed', 'rejected') AND archived_at IS NULL ORDER BY id",
            [],
        )
    }

    fn is_petition_record_archived(&self, petition_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM archived_petitions WHERE id = ?1)",
            params![petition_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn archive_petition_record(&self, petition_id: i64) -> Result<RowOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(petition) = tx
            .query_row(
                &format!("SELECT {PETITION_COLUMNS} FROM petitions WHERE id = ?1"),
                params![petition_id],
                Self::row_to_petition,
            )
            .optional()?
        else {
            bail!("Petition {} not found", petition_id);
        };

        let constituency_breakdown =
            Self::breakdown(&tx, petition_id, JournalDimension::Constituency)?;
        let country_breakdown = Self::breakdown(&tx, petition_id, JournalDimension::Country)?;

        tx.execute(
            "INSERT INTO archived_petitions (id, action, state, signature_count, opened_at, closed_at,
                                             created_at, constituency_breakdown, country_breakdown)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                petition.id,
                petition.action,
                petition.state.as_str(),
                petition.signature_count,
                opt_to_millis(petition.opened_at.as_ref()),
                opt_to_millis(petition.closed_at.as_ref()),
                to_millis(&petition.created_at),
                constituency_breakdown,
                country_breakdown
            ],
        )?;
        tx.commit()?;
        Ok(RowOutcome::Processed)
    }

    fn get_archived_petition(&self, petition_id: i64) -> Result<Option<ArchivedPetition>> {
        let conn = self.conn.lock().unwrap();
        let archived = conn
            .query_row(
                "SELECT id, action, state, signature_count, opened_at, closed_at, created_at,
                        constituency_breakdown, country_breakdown, archived_at, anonymized_at
                 FROM archived_petitions WHERE id = ?1",
                params![petition_id],
                Self::row_to_archived_petition,
            )
            .optional()?;
        Ok(archived)
    }

    fn unarchived_signature_ids(
        &self,
        petition_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM signatures
             WHERE petition_id = ?1 AND archived_at IS NULL AND (?2 IS NULL OR id > ?2)
             ORDER BY id LIMIT ?3",
            params![petition_id, after_id, limit as i64],
        )
    }

    fn has_unarchived_signatures(&self, petition_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let pending = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM signatures WHERE petition_id = ?1 AND archived_at IS NULL)",
            params![petition_id],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    fn archive_signature(&self, signature_id: i64, now: DateTime<Utc>) -> Result<RowOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            "UPDATE signatures SET archived_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
            params![to_millis(&now), signature_id],
        )?;
        if claimed == 0 {
            return Ok(RowOutcome::AlreadyProcessed);
        }

        let copied = tx.execute(
            "INSERT INTO archived_signatures (id, petition_id, state, name, email, postcode, ip_address,
                                              constituency_id, location_code, validated_at, creator,
                                              sponsor, created_at, archived_at, anonymized_at)
             SELECT id, petition_id, state, name, email, postcode, ip_address, constituency_id,
                    location_code, validated_at, creator, sponsor, created_at, archived_at, anonymized_at
             FROM signatures WHERE id = ?1",
            params![signature_id],
        );
        match copied {
            Ok(_) => {
                tx.commit()?;
                Ok(RowOutcome::Processed)
            }
            // The copy is already there, only the live marker was missing.
            Err(e) if is_constraint_violation(&e) => {
                tx.commit()?;
                debug!("Signature {} already had an archived copy", signature_id);
                Ok(RowOutcome::AlreadyProcessed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn count_archived_signatures(&self, petition_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM archived_signatures WHERE petition_id = ?1",
            params![petition_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn mark_petition_archived(&self, petition_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&now);

        let updated = tx.execute(
            "UPDATE petitions SET archived_at = ?1, updated_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
            params![now, petition_id],
        )?;
        tx.execute(
            "UPDATE archived_petitions SET archived_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
            params![now, petition_id],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }

    fn petitions_awaiting_anonymization(&self, closed_before: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM petitions
             WHERE archived_at IS NOT NULL AND anonymized_at IS NULL
               AND closed_at IS NOT NULL AND closed_at <= ?1
             ORDER BY id",
            params![to_millis(&closed_before)],
        )
    }

    fn unanonymized_signature_ids(
        &self,
        petition_id: i64,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        Self::query_ids(
            &conn,
            "SELECT id FROM signatures
             WHERE petition_id = ?1 AND anonymized_at IS NULL AND (?2 IS NULL OR id > ?2)
             ORDER BY id LIMIT ?3",
            params![petition_id, after_id, limit as i64],
        )
    }

    fn has_unanonymized_signatures(&self, petition_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let pending = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM signatures WHERE petition_id = ?1 AND anonymized_at IS NULL)",
            params![petition_id],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    fn anonymize_signature(&self, signature_id: i64, now: DateTime<Utc>) -> Result<RowOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&now);

        let claimed = tx.execute(
            "UPDATE signatures
             SET name = ?1, email = ?1, postcode = NULL, ip_address = NULL, anonymized_at = ?2
             WHERE id = ?3 AND anonymized_at IS NULL",
            params![REDACTED, now, signature_id],
        )?;
        if claimed == 0 {
            return Ok(RowOutcome::AlreadyProcessed);
        }
        tx.execute(
            "UPDATE archived_signatures
             SET name = ?1, email = ?1, postcode = NULL, ip_address = NULL, anonymized_at = ?2
             WHERE id = ?3",
            params![REDACTED, now, signature_id],
        )?;
        tx.commit()?;
        Ok(RowOutcome::Processed)
    }

    fn mark_petition_anonymized(&self, petition_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = to_millis(&now);

        let updated = tx.execute(
            "UPDATE petitions SET anonymized_at = ?1, updated_at = ?1 WHERE id = ?2 AND anonymized_at IS NULL",
            params![now, petition_id],
        )?;
        tx.execute(
            "UPDATE archived_petitions SET anonymized_at = ?1 WHERE id = ?2 AND anonymized_at IS NULL",
            params![now, petition_id],
        )?;
        tx.commit()?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn signature(petition_id: i64, constituency: Option<&str>) -> NewSignature {
        NewSignature {
            petition_id,
            name: "Bob Jones".to_string(),
            email: "bob@example.com".to_string(),
            postcode: Some("CF10 1AA".to_string()),
            ip_address: Some("192.0.2.10".to_string()),
            constituency_id: constituency.map(str::to_string),
            location_code: "GB".to_string(),
            creator: false,
            sponsor: false,
        }
    }

    fn signed(store: &SqlitePetitionStore, petition_id: i64, at: DateTime<Utc>) -> i64 {
        let id = store
            .insert_signature(&signature(petition_id, Some("W07000050")))
            .unwrap();
        assert!(store.validate_signature(id, at).unwrap());
        id
    }

    #[test]
    fn test_validate_signature_bumps_last_signed_at() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();

        signed(&store, petition_id, t(5));
        signed(&store, petition_id, t(3));

        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert_eq!(petition.last_signed_at, Some(t(5)));
        assert_eq!(petition.signature_count, 0);
    }

    #[test]
    fn test_validate_signature_twice_is_rejected() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        let id = signed(&store, petition_id, t(1));

        assert!(!store.validate_signature(id, t(2)).unwrap());
        let sig = store.get_signature(id).unwrap().unwrap();
        assert_eq!(sig.validated_at, Some(t(1)));
        assert_eq!(sig.state, SignatureState::Validated);
    }

    #[test]
    fn test_advance_only_counts_up_to_horizon() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        signed(&store, petition_id, t(1));
        signed(&store, petition_id, t(2));
        signed(&store, petition_id, t(9));

        let outcome = store.advance_signature_count(petition_id, None, t(5)).unwrap();
        let AdvanceOutcome::Advanced(advance) = outcome else {
            panic!("expected an advance, got {:?}", outcome);
        };
        assert_eq!(advance.delta, 2);
        assert_eq!(advance.cursor, t(5));

        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert_eq!(petition.signature_count, 2);
        assert_eq!(petition.signature_count_validated_at, Some(t(5)));
        assert_eq!(
            store.journal_total(petition_id, JournalDimension::Country).unwrap(),
            2
        );
    }

    #[test]
    fn test_advance_with_stale_cursor_conflicts() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        signed(&store, petition_id, t(1));

        let first = store.advance_signature_count(petition_id, None, t(5)).unwrap();
        let second = store.advance_signature_count(petition_id, None, t(5)).unwrap();

        assert!(matches!(first, AdvanceOutcome::Advanced(_)));
        assert_eq!(second, AdvanceOutcome::Conflict);
        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert_eq!(petition.signature_count, 1);
    }

    #[test]
    fn test_advance_blocked_by_reset_flag() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        signed(&store, petition_id, t(1));

        let claim = store.begin_signature_count_reset(petition_id, t(2)).unwrap();
        assert!(matches!(claim, ResetClaim::Claimed { .. }));
        assert!(store.petitions_with_uncounted_signatures().unwrap().is_empty());

        let outcome = store.advance_signature_count(petition_id, None, t(5)).unwrap();
        assert_eq!(outcome, AdvanceOutcome::Conflict);
    }

    #[test]
    fn test_empty_interval_moves_cursor_past_invalidated_signatures() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        let id = signed(&store, petition_id, t(1));
        assert!(store.invalidate_signature(id).unwrap());
        assert_eq!(store.petitions_with_uncounted_signatures().unwrap().len(), 1);

        let outcome = store.advance_signature_count(petition_id, None, t(5)).unwrap();
        assert_eq!(outcome, AdvanceOutcome::NothingToCount);

        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert_eq!(petition.signature_count, 0);
        assert_eq!(petition.signature_count_validated_at, Some(t(5)));
        assert!(store.petitions_with_uncounted_signatures().unwrap().is_empty());
    }

    #[test]
    fn test_empty_interval_leaves_reset_flag_alone() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        store.begin_signature_count_reset(petition_id, t(2)).unwrap();

        let outcome = store.advance_signature_count(petition_id, None, t(5)).unwrap();
        assert_eq!(outcome, AdvanceOutcome::NothingToCount);
        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert!(petition.signature_count_validated_at.is_none());
    }

    #[test]
    fn test_reset_claim_in_progress_and_abort() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();

        let ResetClaim::Claimed { started_at } =
            store.begin_signature_count_reset(petition_id, t(1)).unwrap()
        else {
            panic!("expected claim");
        };
        assert_eq!(
            store.begin_signature_count_reset(petition_id, t(2)).unwrap(),
            ResetClaim::InProgress { started_at }
        );
        assert_eq!(
            store.begin_signature_count_reset(999, t(2)).unwrap(),
            ResetClaim::NotFound
        );

        assert!(!store.abort_signature_count_reset(petition_id, t(9)).unwrap());
        assert!(store.abort_signature_count_reset(petition_id, started_at).unwrap());
        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert!(petition.signature_count_reset_at.is_none());
    }

    #[test]
    fn test_complete_reset_requires_matching_flag() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        signed(&store, petition_id, t(1));

        assert!(store
            .complete_signature_count_reset(petition_id, t(1), t(2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_archive_signature_is_idempotent() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        let id = signed(&store, petition_id, t(1));

        assert_eq!(store.archive_signature(id, t(2)).unwrap(), RowOutcome::Processed);
        assert_eq!(
            store.archive_signature(id, t(3)).unwrap(),
            RowOutcome::AlreadyProcessed
        );
        assert_eq!(store.count_archived_signatures(petition_id).unwrap(), 1);
        assert!(!store.has_unarchived_signatures(petition_id).unwrap());
    }

    #[test]
    fn test_archive_signature_with_existing_copy_keeps_marker() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        let id = signed(&store, petition_id, t(1));
        store.archive_signature(id, t(2)).unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE signatures SET archived_at = NULL", [])
                .unwrap();
        }

        assert_eq!(
            store.archive_signature(id, t(3)).unwrap(),
            RowOutcome::AlreadyProcessed
        );
        assert!(!store.has_unarchived_signatures(petition_id).unwrap());
    }

    #[test]
    fn test_second_petition_copy_is_constraint_violation() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        store.close_petition(petition_id, t(1)).unwrap();

        store.archive_petition_record(petition_id).unwrap();
        let err = store.archive_petition_record(petition_id).unwrap_err();
        let sqlite_err = err.downcast_ref::<rusqlite::Error>().unwrap();
        assert!(is_constraint_violation(sqlite_err));
    }

    #[test]
    fn test_anonymize_redacts_live_and_archived_copies() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let petition_id = store.insert_petition(&NewPetition::open("Save the pier")).unwrap();
        let id = signed(&store, petition_id, t(1));
        store.archive_signature(id, t(2)).unwrap();

        assert_eq!(
            store.anonymize_signature(id, t(3)).unwrap(),
            RowOutcome::Processed
        );
        assert_eq!(
            store.anonymize_signature(id, t(4)).unwrap(),
            RowOutcome::AlreadyProcessed
        );

        let sig = store.get_signature(id).unwrap().unwrap();
        assert_eq!(sig.name, REDACTED);
        assert_eq!(sig.email, REDACTED);
        assert!(sig.postcode.is_none());
        assert!(sig.ip_address.is_none());
        assert_eq!(sig.anonymized_at, Some(t(3)));

        let conn = store.conn.lock().unwrap();
        let (name, ip): (String, Option<String>) = conn
            .query_row(
                "SELECT name, ip_address FROM archived_signatures WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, REDACTED);
        assert!(ip.is_none());
    }

    #[test]
    fn test_archive_and_anonymize_selection() {
        let store = SqlitePetitionStore::in_memory().unwrap();
        let open = store.insert_petition(&NewPetition::open("Open")).unwrap();
        let closed = store.insert_petition(&NewPetition::open("Closed")).unwrap();
        let rejected = store.insert_petition(&NewPetition::open("Rejected")).unwrap();
        store.close_petition(closed, t(0)).unwrap();
        store.reject_petition(rejected, t(100)).unwrap();

        assert_eq!(
            store.petitions_awaiting_archive().unwrap(),
            vec![closed, rejected]
        );

        store.archive_petition_record(closed).unwrap();
        assert!(store.mark_petition_archived(closed, t(1)).unwrap());
        assert!(!store.mark_petition_archived(closed, t(2)).unwrap());
        assert_eq!(store.petitions_awaiting_archive().unwrap(), vec![rejected]);
        assert_eq!(
            store.get_archived_petition(closed).unwrap().unwrap().archived_at,
            Some(t(1))
        );

        assert_eq!(store.petitions_awaiting_anonymization(t(50)).unwrap(), vec![closed]);
        assert!(store.mark_petition_anonymized(closed, t(60)).unwrap());
        assert!(store.petitions_awaiting_anonymization(t(50)).unwrap().is_empty());
        assert!(store.get_petition(open).unwrap().unwrap().archived_at.is_none());
    }

    #[test]
    fn test_reopen_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("petitions.db");
        let petition_id = {
            let store = SqlitePetitionStore::new(&path).unwrap();
            store.insert_petition(&NewPetition::open("Persisted")).unwrap()
        };

        let store = SqlitePetitionStore::new(&path).unwrap();
        let petition = store.get_petition(petition_id).unwrap().unwrap();
        assert_eq!(petition.action, "Persisted");
        assert_eq!(petition.state, PetitionState::Open);
    }
}
