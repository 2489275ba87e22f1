//! In-memory implementation of LeaseCoordinator

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::coordinator::*;
use crate::job::JobId;

struct Lease {
    owner: OwnerToken,
    expires_at: Instant,
}

/// In-memory implementation of LeaseCoordinator
///
/// Expiry uses [`tokio::time::Instant`], so tests running on a paused clock
/// can advance past a TTL deterministically. [`flush`](Self::flush) drops
/// every lease to simulate a lease-store restart.
pub struct InMemoryLeaseCoordinator {
    leases: Mutex<HashMap<JobId, Lease>>,
    available: AtomicBool,
    counters: LeaseCounters,
}

impl InMemoryLeaseCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            counters: LeaseCounters::default(),
        }
    }

    /// Forget every lease
    pub fn flush(&self) {
        self.leases.lock().clear();
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current live holder of `job_id`, if any
    pub fn holder(&self, job_id: JobId) -> Option<OwnerToken> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(&job_id)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone())
    }

    /// Number of live leases
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), LeaseError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LeaseError::Unavailable(
                "in-memory lease store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryLeaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseCoordinator for InMemoryLeaseCoordinator {
    async fn try_acquire(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        self.check_available()?;

        let now = Instant::now();
        let acquired = {
            let mut leases = self.leases.lock();
            match leases.get(&job_id) {
                Some(lease) if lease.expires_at > now => false,
                _ => {
                    leases.insert(
                        job_id,
                        Lease {
                            owner: owner.clone(),
                            expires_at: now + ttl,
                        },
                    );
                    true
                }
            }
        };

        self.counters.record(acquired);
        Ok(acquired)
    }

    async fn renew(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        self.check_available()?;

        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(&job_id) {
            Some(lease) if lease.owner == *owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, job_id: JobId, owner: &OwnerToken) -> Result<(), LeaseError> {
        self.check_available()?;

        let mut leases = self.leases.lock();
        if leases.get(&job_id).is_some_and(|lease| lease.owner == *owner) {
            leases.remove(&job_id);
        }
        Ok(())
    }

    fn stats(&self) -> LeaseStats {
        self.counters.snapshot()
    }
}
