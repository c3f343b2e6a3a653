//! Drift auditor and stuck-reset watchdog.
//!
//! The auditor never writes counts. It compares each recently signed petition's
//! cached count with a recount at the petition's own cursor and hands every
//! mismatch to the corrector through the queue.

use super::{before, EngineContext, EngineJob};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::ops_store::AlertKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    pub petition_id: i64,
    pub cached_count: i64,
    pub actual_count: i64,
    /// Cursor the recount was taken at.
    pub checked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub petitions_checked: usize,
    pub findings: Vec<DriftFinding>,
    pub corrections_enqueued: usize,
}

pub fn audit_signature_counts(ctx: &EngineContext, now: DateTime<Utc>) -> EngineResult<AuditReport> {
    let since = before(now, ctx.settings.audit_lookback());
    let petitions = ctx
        .petition_store
        .petitions_signed_since(since)
        .map_err(EngineError::from_store)?;

    let mut report = AuditReport::default();
    for petition in petitions {
        report.petitions_checked += 1;

        let checked_until = petition.signature_count_validated_at.map(|cursor| cursor.min(now));
        let actual_count = match checked_until {
            Some(until) => ctx
                .petition_store
                .count_validated_signatures(petition.id, until)
                .map_err(EngineError::from_store)?,
            None => 0,
        };
        if actual_count == petition.signature_count {
            continue;
        }

        let finding = DriftFinding {
            petition_id: petition.id,
            cached_count: petition.signature_count,
            actual_count,
            checked_until,
        };
        warn!(
            "Signature count drift on petition {}: cached {}, actual {}",
            finding.petition_id, finding.cached_count, finding.actual_count
        );
        metrics::record_drift_detected();
        ctx.ops_store
            .record_alert(AlertKind::Drift, Some(petition.id), Some(&json!(finding)))
            .map_err(EngineError::from_store)?;

        let outcome = ctx.enqueue(
            &EngineJob::ResetSignatureCount {
                petition_id: petition.id,
            },
            now,
        )?;
        if !outcome.is_duplicate() {
            report.corrections_enqueued += 1;
        }
        report.findings.push(finding);
    }

    info!(
        "Audited {} petitions, {} with drift",
        report.petitions_checked,
        report.findings.len()
    );
    Ok(report)
}

/// Alerts on every petition whose reset flag has been held longer than the
/// timeout. The flag is left in place for an operator to inspect.
pub fn check_stuck_resets(ctx: &EngineContext, now: DateTime<Utc>) -> EngineResult<Vec<i64>> {
    let cutoff = before(now, ctx.settings.stuck_reset_timeout());
    let stuck = ctx
        .petition_store
        .petitions_with_reset_started_before(cutoff)
        .map_err(EngineError::from_store)?;

    let mut petition_ids = Vec::with_capacity(stuck.len());
    for petition in stuck {
        let Some(started_at) = petition.signature_count_reset_at else {
            continue;
        };
        error!(
            "Signature count reset of petition {} stuck since {}",
            petition.id, started_at
        );
        metrics::record_stuck_reset();
        ctx.ops_store
            .record_alert(
                AlertKind::StuckReset,
                Some(petition.id),
                Some(&json!({ "reset_started_at": started_at })),
            )
            .map_err(EngineError::from_store)?;
        petition_ids.push(petition.id);
    }
    Ok(petition_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::engine::counter::update_signature_counts;
    use crate::engine::test_support::{engine, signature};
    use crate::job_queue::{JobQueue, QueuedJobStatus};
    use crate::ops_store::OpsStore;
    use crate::petition_store::{NewPetition, PetitionStore};
    use chrono::Duration;

    #[test]
    fn test_consistent_counts_raise_nothing() {
        let t = engine(EngineSettings::default());
        let petition_id = t.petitions.insert_petition(&NewPetition::open("Act")).unwrap();
        let now = Utc::now();
        for _ in 0..3 {
            let id = t
                .petitions
                .insert_signature(&signature(petition_id, None, "GB"))
                .unwrap();
            t.petitions
                .validate_signature(id, now - Duration::minutes(10))
                .unwrap();
        }
        update_signature_counts(&t.ctx, Some(now)).unwrap();
        // Validated after the cursor: not yet counted, not drift.
        let id = t
            .petitions
            .insert_signature(&signature(petition_id, None, "GB"))
            .unwrap();
        t.petitions
            .validate_signature(id, now - Duration::seconds(5))
            .unwrap();

        let report = audit_signature_counts(&t.ctx, now).unwrap();
        assert_eq!(report.petitions_checked, 1);
        assert!(report.findings.is_empty());
        assert!(t.ops.get_alerts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_invalidation_is_reported_and_corrected() {
        let t = engine(EngineSettings::default());
        let petition_id = t.petitions.insert_petition(&NewPetition::open("Act")).unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = t
                .petitions
                .insert_signature(&signature(petition_id, None, "GB"))
                .unwrap();
            t.petitions
                .validate_signature(id, now - Duration::minutes(10))
                .unwrap();
            ids.push(id);
        }
        update_signature_counts(&t.ctx, Some(now)).unwrap();
        t.petitions.invalidate_signature(ids[0]).unwrap();

        let report = audit_signature_counts(&t.ctx, now).unwrap();
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].cached_count, 3);
        assert_eq!(report.findings[0].actual_count, 2);
        assert_eq!(report.corrections_enqueued, 1);

        let alerts = t.ops.get_alerts(Some(AlertKind::Drift), 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].petition_id, Some(petition_id));

        let pending = t.queue.list_jobs(Some(QueuedJobStatus::Pending), 10).unwrap();
        assert!(pending
            .iter()
            .any(|job| job.unique_key.as_deref()
                == Some(format!("reset_signature_count:{}", petition_id).as_str())));

        // A second audit finds the same drift but does not queue a second reset.
        let again = audit_signature_counts(&t.ctx, now).unwrap();
        assert_eq!(again.findings.len(), 1);
        assert_eq!(again.corrections_enqueued, 0);
    }

    #[test]
    fn test_stuck_reset_alerts_after_timeout() {
        let t = engine(EngineSettings::default());
        let petition_id = t.petitions.insert_petition(&NewPetition::open("Act")).unwrap();
        let started = Utc::now() - Duration::minutes(10);
        t.petitions
            .begin_signature_count_reset(petition_id, started)
            .unwrap();

        let fresh = check_stuck_resets(&t.ctx, started + Duration::minutes(1)).unwrap();
        assert!(fresh.is_empty());

        let stuck = check_stuck_resets(&t.ctx, Utc::now()).unwrap();
        assert_eq!(stuck, vec![petition_id]);
        assert_eq!(
            t.ops.get_alerts(Some(AlertKind::StuckReset), 10).unwrap().len(),
            1
        );
        // Still held: the watchdog never clears the flag.
        assert!(t
            .petitions
            .get_petition(petition_id)
            .unwrap()
            .unwrap()
            .signature_count_reset_at
            .is_some());
    }
}
