//! What happens to a failed job, decided by looking its error class up in a
//! table rather than by branching at each call site.

use rand::Rng;
use std::time::Duration;

/// Delay before a retried job becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)` capped at `max`, plus up to 10% jitter.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub const TRANSIENT: Backoff = Backoff::Exponential {
        base: Duration::from_secs(30),
        max: Duration::from_secs(3600),
    };

    /// Delay before attempt `attempt + 1`, given `attempt` already ran (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(20);
                let delay = base.saturating_mul(1u32 << exponent).min(max);
                let jitter = rand::rng().random_range(0.0..=0.1);
                delay.mul_f64(1.0 + jitter).min(max)
            }
        }
    }
}

/// Coarse category of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Storage or other infrastructure hiccup.
    Transient,
    /// A counter pass failed; retried on the counter's own cadence.
    CounterPass,
    /// Lost a conditional update to a concurrent writer.
    Conflict,
    InvalidPayload,
    MissingRecord,
    /// A count reset could neither complete nor release its flag.
    StuckCorrection,
    /// The job body panicked.
    Panic,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::CounterPass => "counter_pass",
            ErrorClass::Conflict => "conflict",
            ErrorClass::InvalidPayload => "invalid_payload",
            ErrorClass::MissingRecord => "missing_record",
            ErrorClass::StuckCorrection => "stuck_correction",
            ErrorClass::Panic => "panic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    RetryNow,
    RetryAfter(Backoff),
    DropAndLog,
    AlertAndDrop,
}

impl Disposition {
    pub fn is_retry(&self) -> bool {
        matches!(self, Disposition::RetryNow | Disposition::RetryAfter(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Disposition::RetryNow => "retry_now",
            Disposition::RetryAfter(_) => "retry_after",
            Disposition::DropAndLog => "dropped",
            Disposition::AlertAndDrop => "alerted",
        }
    }
}

/// Builds the classification table. The counter interval is the only entry
/// that depends on configuration.
pub fn classification_table(counter_interval: Duration) -> [(ErrorClass, Disposition); 7] {
    [
        (ErrorClass::Transient, Disposition::RetryAfter(Backoff::TRANSIENT)),
        (
            ErrorClass::CounterPass,
            Disposition::RetryAfter(Backoff::Fixed(counter_interval)),
        ),
        (ErrorClass::Conflict, Disposition::RetryNow),
        (ErrorClass::InvalidPayload, Disposition::DropAndLog),
        (ErrorClass::MissingRecord, Disposition::DropAndLog),
        (ErrorClass::StuckCorrection, Disposition::AlertAndDrop),
        (ErrorClass::Panic, Disposition::RetryAfter(Backoff::TRANSIENT)),
    ]
}

/// The classification table. Attempt limits live on each queued job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    table: [(ErrorClass, Disposition); 7],
}

impl RetryPolicy {
    pub fn new(counter_interval: Duration) -> Self {
        Self {
            table: classification_table(counter_interval),
        }
    }

    pub fn disposition_for(&self, class: ErrorClass) -> Disposition {
        self.table
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, disposition)| *disposition)
            .unwrap_or(Disposition::AlertAndDrop)
    }

    /// Disposition for a failure on attempt `attempts` (1-indexed) of a job
    /// allowed `max_attempts`. Retries past the limit become an alert, except
    /// for counter passes: the counter chain has no other way back onto the
    /// queue while the engine runs.
    pub fn resolve(&self, class: ErrorClass, attempts: u32, max_attempts: u32) -> Disposition {
        let disposition = self.disposition_for(class);
        if disposition.is_retry() && class != ErrorClass::CounterPass && attempts >= max_attempts {
            Disposition::AlertAndDrop
        } else {
            disposition
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_class() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.disposition_for(ErrorClass::Transient),
            Disposition::RetryAfter(Backoff::TRANSIENT)
        );
        assert_eq!(
            policy.disposition_for(ErrorClass::CounterPass),
            Disposition::RetryAfter(Backoff::Fixed(Duration::from_secs(60)))
        );
        assert_eq!(
            policy.disposition_for(ErrorClass::Conflict),
            Disposition::RetryNow
        );
        assert_eq!(
            policy.disposition_for(ErrorClass::InvalidPayload),
            Disposition::DropAndLog
        );
        assert_eq!(
            policy.disposition_for(ErrorClass::MissingRecord),
            Disposition::DropAndLog
        );
        assert_eq!(
            policy.disposition_for(ErrorClass::StuckCorrection),
            Disposition::AlertAndDrop
        );
        assert!(policy.disposition_for(ErrorClass::Panic).is_retry());
    }

    #[test]
    fn test_exhausted_attempts_alert() {
        let policy = RetryPolicy::default();
        assert!(policy.resolve(ErrorClass::Transient, 2, 3).is_retry());
        assert_eq!(
            policy.resolve(ErrorClass::Transient, 3, 3),
            Disposition::AlertAndDrop
        );
        assert_eq!(
            policy.resolve(ErrorClass::MissingRecord, 3, 3),
            Disposition::DropAndLog
        );
    }

    #[test]
    fn test_counter_pass_retries_past_attempt_limit() {
        let policy = RetryPolicy::new(Duration::from_secs(60));
        assert_eq!(
            policy.resolve(ErrorClass::CounterPass, 10, 10),
            Disposition::RetryAfter(Backoff::Fixed(Duration::from_secs(60)))
        );
        assert!(policy.resolve(ErrorClass::CounterPass, 500, 10).is_retry());
    }

    #[test]
    fn test_per_job_limit_applies() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.resolve(ErrorClass::Conflict, 1, 1),
            Disposition::AlertAndDrop
        );
        assert!(policy.resolve(ErrorClass::Conflict, 1, 2).is_retry());
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(30),
            max: Duration::from_secs(3600),
        };
        let first = backoff.delay_for_attempt(1);
        let third = backoff.delay_for_attempt(3);
        assert!(first >= Duration::from_secs(30) && first <= Duration::from_secs(33));
        assert!(third >= Duration::from_secs(120) && third <= Duration::from_secs(132));
        assert_eq!(backoff.delay_for_attempt(30), Duration::from_secs(3600));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed(Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_secs(60));
    }
}
