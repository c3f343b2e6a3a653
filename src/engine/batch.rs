//! Resumable batch processor.
//!
//! A [`BatchStep`] names a set of rows that still need a transformation and a
//! parent record that gets a terminal marker once none are left. Whether a
//! row is done is recorded on the row itself, in the same transaction as its
//! transformation, so an invocation can stop after any row and the next one
//! resumes with exactly the rows that remain.
//!
//! ## Per invocation
//!
//! ```text
//! is_done? ── yes ─▶ AlreadyDone
//!    │ no
//!    ▼
//! next `limit` pending ids ─▶ process each ─▶ terminating, rows left? ─▶ Interrupted
//!    │
//!    ▼
//! still pending? ── yes ─▶ Exhausted (continue in a new job), or Interrupted if terminating
//!    │ no
//!    ▼
//! finish ─▶ Finished
//! ```

use super::termination::TerminationScope;
use super::{after, EngineContext, EngineJob};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::petition_store::RowOutcome;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub trait BatchStep {
    /// Used in logs and as the metrics label.
    fn name(&self) -> &'static str;
    /// True when the parent already carries its terminal marker.
    fn is_done(&self) -> EngineResult<bool>;
    /// Up to `limit` pending row ids greater than `after`, in ascending order.
    fn pending_ids(&self, after: Option<i64>, limit: usize) -> EngineResult<Vec<i64>>;
    fn has_pending(&self) -> EngineResult<bool>;
    /// Transforms one row and writes its marker, atomically.
    fn process_row(&self, id: i64, now: DateTime<Utc>) -> EngineResult<RowOutcome>;
    /// Sets the parent's terminal marker.
    fn finish(&self, now: DateTime<Utc>) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    AlreadyDone,
    /// Stopped early because the worker is shutting down.
    Interrupted {
        processed: usize,
        checkpoint: Option<i64>,
    },
    /// Hit the row limit with rows still pending.
    Exhausted {
        processed: usize,
        checkpoint: Option<i64>,
    },
    Finished {
        processed: usize,
    },
    /// A prerequisite step had not run yet and was enqueued instead.
    Deferred,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        match self {
            BatchOutcome::Interrupted { processed, .. }
            | BatchOutcome::Exhausted { processed, .. }
            | BatchOutcome::Finished { processed } => *processed,
            BatchOutcome::AlreadyDone | BatchOutcome::Deferred => 0,
        }
    }
}

/// Processes up to `limit` pending rows of `step`, starting after `after`.
///
/// `processed` counts rows this invocation transformed. Rows some earlier
/// invocation already handled, including ones rejected by a constraint, are
/// skipped silently.
pub fn run_batch(
    step: &dyn BatchStep,
    cancellation: &CancellationToken,
    after: Option<i64>,
    limit: usize,
) -> EngineResult<BatchOutcome> {
    let scope = TerminationScope::enter(cancellation, step.name());

    if step.is_done()? {
        debug!("{} already done", step.name());
        return Ok(BatchOutcome::AlreadyDone);
    }

    let ids = step.pending_ids(after, limit)?;
    let mut processed = 0usize;
    let mut skipped = 0usize;
    let mut checkpoint = after;

    for (index, id) in ids.iter().enumerate() {
        match step.process_row(*id, Utc::now()) {
            Ok(RowOutcome::Processed) => processed += 1,
            Ok(RowOutcome::AlreadyProcessed) => skipped += 1,
            Err(EngineError::RowConflict(reason)) => {
                debug!("{} row {} already processed: {}", step.name(), id, reason);
                skipped += 1;
            }
            Err(err) => {
                record_rows(step.name(), processed, skipped);
                return Err(err);
            }
        }
        checkpoint = Some(*id);

        let rows_left = index + 1 < ids.len();
        if rows_left && scope.is_terminating() {
            record_rows(step.name(), processed, skipped);
            info!(
                "{} interrupted after {} rows at checkpoint {:?}",
                step.name(),
                processed,
                checkpoint
            );
            return Ok(BatchOutcome::Interrupted {
                processed,
                checkpoint,
            });
        }
    }
    record_rows(step.name(), processed, skipped);

    if step.has_pending()? {
        // A short page means rows appeared behind the checkpoint; rescan from the start.
        let checkpoint = if ids.len() < limit { None } else { checkpoint };
        if scope.is_terminating() {
            info!(
                "{} interrupted after {} rows at checkpoint {:?}",
                step.name(),
                processed,
                checkpoint
            );
            return Ok(BatchOutcome::Interrupted {
                processed,
                checkpoint,
            });
        }
        debug!(
            "{} processed {} rows, more pending after {:?}",
            step.name(),
            processed,
            checkpoint
        );
        return Ok(BatchOutcome::Exhausted {
            processed,
            checkpoint,
        });
    }

    step.finish(Utc::now())?;
    info!("{} finished after {} rows", step.name(), processed);
    Ok(BatchOutcome::Finished { processed })
}

fn record_rows(step: &str, processed: usize, skipped: usize) {
    if processed > 0 {
        metrics::record_batch_rows(step, "processed", processed);
    }
    if skipped > 0 {
        metrics::record_batch_rows(step, "skipped", skipped);
    }
}

/// Enqueues the job that picks up where `outcome` left off, if any.
///
/// `continuation` builds the follow-up job from the checkpoint. Interrupted
/// runs come back after the termination delay so a shutting-down worker does
/// not immediately claim its own continuation.
pub(crate) fn enqueue_continuation(
    ctx: &EngineContext,
    outcome: &BatchOutcome,
    continuation: impl FnOnce(Option<i64>) -> EngineJob,
) -> EngineResult<()> {
    let now = Utc::now();
    match *outcome {
        BatchOutcome::Exhausted { checkpoint, .. } => {
            ctx.enqueue(&continuation(checkpoint), now)?;
        }
        BatchOutcome::Interrupted { checkpoint, .. } => {
            let run_at = after(now, ctx.settings.termination_reschedule_delay());
            ctx.enqueue(&continuation(checkpoint), run_at)?;
        }
        BatchOutcome::AlreadyDone | BatchOutcome::Finished { .. } | BatchOutcome::Deferred => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory step over rows `1..=n`.
    struct FakeStep {
        rows: Mutex<BTreeMap<i64, bool>>,
        finished: Mutex<bool>,
        conflict_on: Option<i64>,
        cancel_after: Option<(i64, CancellationToken)>,
    }

    impl FakeStep {
        fn new(n: i64) -> Self {
            Self {
                rows: Mutex::new((1..=n).map(|id| (id, false)).collect()),
                finished: Mutex::new(false),
                conflict_on: None,
                cancel_after: None,
            }
        }

        fn done_rows(&self) -> usize {
            self.rows.lock().unwrap().values().filter(|done| **done).count()
        }
    }

    impl BatchStep for FakeStep {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn is_done(&self) -> EngineResult<bool> {
            Ok(*self.finished.lock().unwrap())
        }

        fn pending_ids(&self, after: Option<i64>, limit: usize) -> EngineResult<Vec<i64>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, done)| !**done && after.map_or(true, |after| **id > after))
                .map(|(id, _)| *id)
                .take(limit)
                .collect())
        }

        fn has_pending(&self) -> EngineResult<bool> {
            Ok(self.rows.lock().unwrap().values().any(|done| !*done))
        }

        fn process_row(&self, id: i64, _now: DateTime<Utc>) -> EngineResult<RowOutcome> {
            if let Some((cancel_id, token)) = &self.cancel_after {
                if *cancel_id == id {
                    token.cancel();
                }
            }
            let mut rows = self.rows.lock().unwrap();
            if self.conflict_on == Some(id) {
                rows.insert(id, true);
                return Err(EngineError::RowConflict("duplicate copy".to_string()));
            }
            let done = rows.insert(id, true).unwrap_or(false);
            Ok(if done {
                RowOutcome::AlreadyProcessed
            } else {
                RowOutcome::Processed
            })
        }

        fn finish(&self, _now: DateTime<Utc>) -> EngineResult<()> {
            *self.finished.lock().unwrap() = true;
            Ok(())
        }
    }

    #[test]
    fn test_runs_to_completion_in_limited_invocations() {
        let step = FakeStep::new(25);
        let token = CancellationToken::new();

        let first = run_batch(&step, &token, None, 10).unwrap();
        assert_eq!(
            first,
            BatchOutcome::Exhausted {
                processed: 10,
                checkpoint: Some(10)
            }
        );
        let second = run_batch(&step, &token, Some(10), 10).unwrap();
        assert_eq!(second.processed(), 10);
        let third = run_batch(&step, &token, Some(20), 10).unwrap();
        assert_eq!(third, BatchOutcome::Finished { processed: 5 });

        assert_eq!(
            run_batch(&step, &token, None, 10).unwrap(),
            BatchOutcome::AlreadyDone
        );
    }

    #[test]
    fn test_interrupted_between_rows() {
        let token = CancellationToken::new();
        let mut step = FakeStep::new(10);
        step.cancel_after = Some((4, token.clone()));

        let outcome = run_batch(&step, &token, None, 100).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Interrupted {
                processed: 4,
                checkpoint: Some(4)
            }
        );
        assert_eq!(step.done_rows(), 4);

        let resumed = run_batch(&step, &CancellationToken::new(), Some(4), 100).unwrap();
        assert_eq!(resumed, BatchOutcome::Finished { processed: 6 });
    }

    #[test]
    fn test_termination_on_last_row_still_finishes() {
        let token = CancellationToken::new();
        let mut step = FakeStep::new(3);
        step.cancel_after = Some((3, token.clone()));

        let outcome = run_batch(&step, &token, None, 100).unwrap();
        assert_eq!(outcome, BatchOutcome::Finished { processed: 3 });
        assert!(*step.finished.lock().unwrap());
    }

    #[test]
    fn test_termination_at_page_end_with_rows_pending_interrupts() {
        let token = CancellationToken::new();
        let mut step = FakeStep::new(6);
        step.cancel_after = Some((3, token.clone()));

        let outcome = run_batch(&step, &token, None, 3).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Interrupted {
                processed: 3,
                checkpoint: Some(3)
            }
        );
    }

    #[test]
    fn test_row_conflict_counts_as_done() {
        let mut step = FakeStep::new(3);
        step.conflict_on = Some(2);

        let outcome = run_batch(&step, &CancellationToken::new(), None, 10).unwrap();
        assert_eq!(outcome, BatchOutcome::Finished { processed: 2 });
    }

    #[test]
    fn test_already_processed_rows_are_not_counted() {
        let step = FakeStep::new(4);
        step.rows.lock().unwrap().insert(2, true);

        let outcome = run_batch(&step, &CancellationToken::new(), None, 10).unwrap();
        assert_eq!(outcome, BatchOutcome::Finished { processed: 3 });
    }

    #[test]
    fn test_stale_checkpoint_rescans_from_start() {
        let step = FakeStep::new(5);
        // Everything after 3 is done, but 1..=3 are not.
        for id in 4..=5 {
            step.rows.lock().unwrap().insert(id, true);
        }

        let outcome = run_batch(&step, &CancellationToken::new(), Some(3), 10).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome::Exhausted {
                processed: 0,
                checkpoint: None
            }
        );
        let rescan = run_batch(&step, &CancellationToken::new(), None, 10).unwrap();
        assert_eq!(rescan, BatchOutcome::Finished { processed: 3 });
    }
}
