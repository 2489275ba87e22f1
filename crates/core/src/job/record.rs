//! Durable job record

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique job identity
///
/// UUID v7, so identities sort roughly by submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh identity
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, eligible for pickup
    Pending,

    /// Lease held, execution in progress
    Running,

    /// Completed successfully (terminal)
    Success,

    /// Failed, pollable again once `next_eligible_at` passes
    RetryScheduled,

    /// Attempts exhausted (terminal)
    Dead,
}

impl JobStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::RetryScheduled,
        JobStatus::Dead,
    ];

    /// Stable lowercase name, used as the persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::RetryScheduled => "retry_scheduled",
            Self::Dead => "dead",
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Dead)
    }

    /// Whether a dispatcher may pick the job up (subject to `next_eligible_at`)
    pub fn is_pollable(&self) -> bool {
        matches!(self, Self::Pending | Self::RetryScheduled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown persisted status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead" => Ok(Self::Dead),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A job as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Handler selector
    pub kind: String,

    /// Opaque to the core; interpreted by the handler registered for `kind`
    pub payload: serde_json::Value,

    pub status: JobStatus,

    /// Number of failed attempts recorded so far
    pub attempt_count: u32,

    /// Fixed at submission
    pub max_attempts: u32,

    /// Not pollable before this instant (`None` means immediately)
    pub next_eligible_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Diagnostic from the most recent failed attempt
    pub last_error: Option<String>,
}

impl Job {
    /// Whether the job may be picked up at `now`
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pollable() && self.next_eligible_at.map_or(true, |at| at <= now)
    }

    /// Attempts left before the job is dead-lettered
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// A job submission
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
}

impl NewJob {
    /// Create a new submission
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            kind: kind.into(),
            payload,
            max_attempts,
        }
    }
}
