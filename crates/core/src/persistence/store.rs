//! JobStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{FieldUpdates, Job, JobId, JobStatus, NewJob};

/// Default upper bound for a serialized payload (256 KiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Submission rejected before anything was written
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown job identity
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Backing I/O failed; transient, never a job failure
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    /// The write would violate a record invariant
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A persisted record could not be decoded
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Job counts per status plus aggregate retry information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub retry_scheduled: u64,
    pub dead: u64,

    /// Sum of `attempt_count` across all jobs
    pub total_retries: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.success + self.retry_scheduled + self.dead
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Success => self.success,
            JobStatus::RetryScheduled => self.retry_scheduled,
            JobStatus::Dead => self.dead,
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Running => self.running += n,
            JobStatus::Success => self.success += n,
            JobStatus::RetryScheduled => self.retry_scheduled += n,
            JobStatus::Dead => self.dead += n,
        }
    }
}

/// Durable job persistence
///
/// The single source of truth for job status. Every mutation after `enqueue`
/// goes through [`apply_transition`](Self::apply_transition), a
/// compare-and-set on the current status.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new `PENDING` job
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Pollable jobs whose eligibility time has passed, ordered by `created_at`
    ///
    /// Side-effect free.
    async fn fetch_eligible(&self, limit: usize, now: DateTime<Utc>)
        -> Result<Vec<Job>, StoreError>;

    /// Move `job_id` from `expected` to `new_status`, applying `updates`
    ///
    /// Returns `false` (and changes nothing) when the current status is not
    /// `expected`. `updated_at` is set to `now` on success.
    async fn apply_transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        updates: FieldUpdates,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Current committed record
    async fn get_status(&self, job_id: JobId) -> Result<Job, StoreError>;

    /// `RUNNING` jobs not touched since `stale_before`, least recently updated first
    async fn fetch_stale_running(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Per-status counts for operational queries
    async fn count_by_status(&self) -> Result<JobCounts, StoreError>;
}

/// Submission checks shared by every backend
pub(crate) fn validate_new_job(job: &NewJob, max_payload_bytes: usize) -> Result<(), StoreError> {
    if job.max_attempts == 0 {
        return Err(StoreError::Validation(
            "max_attempts must be greater than zero".to_string(),
        ));
    }
    if job.kind.trim().is_empty() {
        return Err(StoreError::Validation("job kind must not be empty".to_string()));
    }

    let size = serde_json::to_vec(&job.payload)
        .map_err(|e| StoreError::Validation(format!("payload is not serializable: {e}")))?
        .len();
    if size > max_payload_bytes {
        return Err(StoreError::Validation(format!(
            "payload is {size} bytes, limit is {max_payload_bytes}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_new_job() {
        assert!(validate_new_job(&NewJob::new("email", json!({"to": "a"}), 3), 1024).is_ok());

        let err = validate_new_job(&NewJob::new("email", json!({}), 0), 1024).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = validate_new_job(&NewJob::new("  ", json!({}), 1), 1024).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let big = json!({ "blob": "x".repeat(2048) });
        let err = validate_new_job(&NewJob::new("email", big, 1), 1024).unwrap_err();
        assert!(err.to_string().contains("limit is 1024"));
    }

    #[test]
    fn test_job_counts() {
        let mut counts = JobCounts::default();
        counts.add(JobStatus::Pending, 2);
        counts.add(JobStatus::Dead, 1);
        assert_eq!(counts.get(JobStatus::Pending), 2);
        assert_eq!(counts.get(JobStatus::Dead), 1);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_transient_errors() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound(JobId::new()).is_transient());
    }
}
