use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority lanes, claimed strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLane {
    Highest,
    High,
    Default,
    Low,
}

impl QueueLane {
    pub const ALL: [QueueLane; 4] = [
        QueueLane::Highest,
        QueueLane::High,
        QueueLane::Default,
        QueueLane::Low,
    ];

    /// Stored rank; lower is claimed first.
    pub fn rank(&self) -> i64 {
        match self {
            QueueLane::Highest => 1,
            QueueLane::High => 2,
            QueueLane::Default => 3,
            QueueLane::Low => 4,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            1 => Some(QueueLane::Highest),
            2 => Some(QueueLane::High),
            3 => Some(QueueLane::Default),
            4 => Some(QueueLane::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueLane::Highest => "highest",
            QueueLane::High => "high",
            QueueLane::Default => "default",
            QueueLane::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedJobStatus {
    Pending,
    Running,
    Completed,
    /// Dropped after a non-retryable failure, exhausted attempts or supersession.
    Dead,
}

impl QueuedJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueuedJobStatus::Pending => "pending",
            QueuedJobStatus::Running => "running",
            QueuedJobStatus::Completed => "completed",
            QueuedJobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueuedJobStatus::Pending),
            "running" => Some(QueuedJobStatus::Running),
            "completed" => Some(QueuedJobStatus::Completed),
            "dead" => Some(QueuedJobStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub lane: QueueLane,
    pub status: QueuedJobStatus,
    pub unique_key: Option<String>,
    pub run_at: DateTime<Utc>,
    /// Incremented on every claim, so the first execution sees 1.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub lane: QueueLane,
    pub unique_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            lane: QueueLane::Default,
            unique_key: None,
            run_at: Utc::now(),
            max_attempts: None,
        }
    }

    pub fn lane(mut self, lane: QueueLane) -> Self {
        self.lane = lane;
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// A pending job with the same unique key already exists.
    Duplicate(i64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneDepth {
    pub lane: QueueLane,
    pub pending: usize,
    pub running: usize,
}
