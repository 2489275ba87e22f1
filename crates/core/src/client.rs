//! Submission and status queries

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::error::TaskFlowError;
use crate::job::{Job, JobId, NewJob};
use crate::lease::{LeaseCoordinator, LeaseStats};
use crate::persistence::{JobCounts, JobStore};

/// Read-only operational view over the store and the lease coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalSnapshot {
    pub jobs: JobCounts,

    /// Present when the client was built with a lease coordinator
    pub leases: Option<LeaseStats>,

    pub lease_contention_rate: Option<f64>,

    /// Jobs in `DEAD`
    pub dead_letters: u64,

    /// Failed attempts recorded across all jobs
    pub retries: u64,

    pub taken_at: DateTime<Utc>,
}

/// Inbound interface: submit jobs, read their status, inspect the system
#[derive(Clone)]
pub struct JobClient {
    store: Arc<dyn JobStore>,
    leases: Option<Arc<dyn LeaseCoordinator>>,
}

impl JobClient {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store, leases: None }
    }

    /// Include lease contention in snapshots
    pub fn with_leases(mut self, leases: Arc<dyn LeaseCoordinator>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Persist a new `PENDING` job
    #[instrument(skip(self, payload))]
    pub async fn submit(
        &self,
        kind: &str,
        payload: Value,
        max_attempts: u32,
    ) -> Result<JobId, TaskFlowError> {
        let id = self
            .store
            .enqueue(NewJob::new(kind, payload, max_attempts))
            .await?;
        info!(%id, kind, max_attempts, "Submitted job");
        Ok(id)
    }

    /// Last committed state of a job
    pub async fn status(&self, id: JobId) -> Result<Job, TaskFlowError> {
        Ok(self.store.get_status(id).await?)
    }

    pub async fn snapshot(&self) -> Result<OperationalSnapshot, TaskFlowError> {
        let jobs = self.store.count_by_status().await?;
        let leases = self.leases.as_ref().map(|l| l.stats());

        Ok(OperationalSnapshot {
            dead_letters: jobs.dead,
            retries: jobs.total_retries,
            lease_contention_rate: leases.map(|s| s.contention_rate()),
            leases,
            jobs,
            taken_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::JobStatus;
    use crate::lease::{InMemoryLeaseCoordinator, OwnerToken};
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_and_status() {
        let client = JobClient::new(Arc::new(InMemoryJobStore::new()));

        let id = client.submit("email", json!({"to": "a@b.c"}), 3).await.unwrap();
        let job = client.status(id).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, "email");
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let client = JobClient::new(Arc::new(InMemoryJobStore::new()));

        let err = client.submit("email", json!({}), 0).await.unwrap_err();
        assert!(matches!(err, TaskFlowError::Validation(_)));

        let err = client.status(JobId::new()).await.unwrap_err();
        assert!(matches!(err, TaskFlowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let leases = Arc::new(InMemoryLeaseCoordinator::new());
        let client = JobClient::new(Arc::new(InMemoryJobStore::new())).with_leases(leases.clone());
        let id = client.submit("email", json!({}), 3).await.unwrap();

        let ttl = Duration::from_secs(30);
        assert!(leases.try_acquire(id, &OwnerToken::generate("a"), ttl).await.unwrap());
        assert!(!leases.try_acquire(id, &OwnerToken::generate("b"), ttl).await.unwrap());

        let snapshot = client.snapshot().await.unwrap();
        assert_eq!(snapshot.jobs.pending, 1);
        assert_eq!(snapshot.dead_letters, 0);
        assert_eq!(snapshot.lease_contention_rate, Some(0.5));
    }
}
