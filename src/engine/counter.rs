//! Windowed signature counter.
//!
//! A pass counts validated signatures in `(cursor, horizon]` for every petition
//! with signatures past its cursor, where `horizon = time - interval`. Signatures
//! newer than the horizon wait for a later pass, so late-committing
//! validations inside the window are never skipped. Each petition advances in its own
//! transaction; the journals move in the same one.

use super::{after, before, EngineContext, EngineJob};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::petition_store::AdvanceOutcome;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterPassReport {
    pub time: DateTime<Utc>,
    pub horizon: DateTime<Utc>,
    pub petitions_advanced: usize,
    pub signatures_counted: i64,
    /// Petitions skipped because another writer moved their cursor or holds a reset.
    pub conflicts: usize,
    pub next_pass_at: DateTime<Utc>,
}

/// Runs one pass at nominal time `time` (now when None) and schedules the next.
pub fn update_signature_counts(
    ctx: &EngineContext,
    time: Option<DateTime<Utc>>,
) -> EngineResult<CounterPassReport> {
    let time = time.unwrap_or_else(Utc::now);
    let horizon = before(time, ctx.settings.signature_count_interval());

    let mut report = CounterPassReport {
        time,
        horizon,
        petitions_advanced: 0,
        signatures_counted: 0,
        conflicts: 0,
        next_pass_at: after(time, ctx.settings.signature_count_interval()),
    };

    if !ctx.settings.counter_enabled {
        debug!("Signature counter disabled, skipping pass at {}", time);
        schedule_next_pass(ctx, time)?;
        return Ok(report);
    }

    let petitions = ctx
        .petition_store
        .petitions_with_uncounted_signatures()
        .map_err(EngineError::from_store)?;

    for petition in petitions {
        let outcome = ctx
            .petition_store
            .advance_signature_count(petition.id, petition.signature_count_validated_at, horizon)
            .map_err(EngineError::from_store)?;

        match outcome {
            AdvanceOutcome::Advanced(advance) => {
                debug!(
                    "Petition {} counted {} signatures up to {} (total {})",
                    advance.petition_id, advance.delta, advance.cursor, advance.signature_count
                );
                report.petitions_advanced += 1;
                report.signatures_counted += advance.delta;
                metrics::record_signatures_counted(advance.delta);
                metrics::record_counter_petition("advanced");
            }
            AdvanceOutcome::NothingToCount => {
                metrics::record_counter_petition("nothing_to_count");
            }
            AdvanceOutcome::Conflict => {
                report.conflicts += 1;
                metrics::record_counter_petition("conflict");
            }
        }
    }

    schedule_next_pass(ctx, time)?;

    if report.petitions_advanced > 0 || report.conflicts > 0 {
        info!(
            "Counter pass up to {}: {} petitions advanced, {} signatures counted, {} conflicts",
            horizon, report.petitions_advanced, report.signatures_counted, report.conflicts
        );
    }
    Ok(report)
}

/// Enqueues the pass after the one at `time`. The next horizon is exactly one
/// interval past this one, so consecutive passes tile the timeline.
pub fn schedule_next_pass(ctx: &EngineContext, time: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
    let next = after(time, ctx.settings.signature_count_interval());
    ctx.enqueue(&EngineJob::UpdateSignatureCounts { time: Some(next) }, next)?;
    Ok(next)
}
