//! LeaseCoordinator trait definition

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobId;

/// Error type for lease operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LeaseError {
    /// The lease store could not be reached; transient
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

/// Proof of one acquisition attempt
///
/// Unique per attempt, not per worker: a worker that re-acquires a job it
/// previously held gets a different token, so stale renewals from the earlier
/// execution can never extend the new lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Fresh token tagged with the worker id, for diagnostics
    pub fn generate(worker_id: &str) -> Self {
        Self(format!("{worker_id}:{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lease this process is trying to hold
///
/// `acquired_at` is taken before the acquisition request is sent, so it never
/// overstates how much of the TTL is left.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub owner: OwnerToken,
    pub acquired_at: tokio::time::Instant,
}

impl LeaseGrant {
    /// Fresh token for `worker_id`, stamped now
    pub fn new(worker_id: &str) -> Self {
        Self {
            owner: OwnerToken::generate(worker_id),
            acquired_at: tokio::time::Instant::now(),
        }
    }
}

/// Acquisition counters for this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStats {
    pub acquire_attempts: u64,

    /// Attempts that found a live lease held by someone else
    pub acquire_conflicts: u64,
}

impl LeaseStats {
    /// Fraction of acquisition attempts that lost, 0.0 when nothing was attempted
    pub fn contention_rate(&self) -> f64 {
        if self.acquire_attempts == 0 {
            0.0
        } else {
            self.acquire_conflicts as f64 / self.acquire_attempts as f64
        }
    }
}

/// Lock-free counters shared by coordinator implementations
#[derive(Debug, Default)]
pub struct LeaseCounters {
    attempts: AtomicU64,
    conflicts: AtomicU64,
}

impl LeaseCounters {
    pub fn record(&self, acquired: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if !acquired {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LeaseStats {
        LeaseStats {
            acquire_attempts: self.attempts.load(Ordering::Relaxed),
            acquire_conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// TTL-based mutual exclusion over job identities
///
/// Advisory only: the job store's compare-and-set remains the correctness
/// backstop, so losing every lease at once only causes redundant execution.
#[async_trait]
pub trait LeaseCoordinator: Send + Sync + 'static {
    /// Create the lease only if none is live; exactly one concurrent caller wins
    async fn try_acquire(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError>;

    /// Extend the lease if `owner` still holds it
    ///
    /// `false` means authority was lost and any result must not be committed.
    async fn renew(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError>;

    /// Delete the lease if `owner` still holds it; no-op otherwise
    async fn release(&self, job_id: JobId, owner: &OwnerToken) -> Result<(), LeaseError>;

    /// Acquisition counters since startup
    fn stats(&self) -> LeaseStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_per_attempt() {
        let a = OwnerToken::generate("worker-1");
        let b = OwnerToken::generate("worker-1");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("worker-1:"));
    }

    #[test]
    fn test_contention_rate() {
        assert_eq!(LeaseStats::default().contention_rate(), 0.0);

        let counters = LeaseCounters::default();
        counters.record(true);
        counters.record(false);
        counters.record(false);
        counters.record(true);

        let stats = counters.snapshot();
        assert_eq!(stats.acquire_attempts, 4);
        assert_eq!(stats.acquire_conflicts, 2);
        assert_eq!(stats.contention_rate(), 0.5);
    }
}
