//! In-memory implementation of JobStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;
use crate::job::{FieldUpdates, Job, JobId, JobStatus, NewJob};

/// Record plus insertion order, used to break ordering ties
struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// In-memory implementation of JobStore
///
/// Provides the same semantics as the PostgreSQL implementation, including
/// the record invariants the database enforces with `CHECK` constraints.
/// [`set_available`](Self::set_available) simulates an outage: every call
/// fails with [`StoreError::Unavailable`] until availability is restored.
///
/// # Example
///
/// ```
/// use taskflow_core::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    available: AtomicBool,
    max_payload_bytes: usize,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Override the payload size bound
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.inner.read().jobs.len()
    }

    /// Snapshot of every job, in submission order
    pub fn all_jobs(&self) -> Vec<Job> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Overwrite a record's `updated_at` (tests only care about staleness)
    pub fn set_updated_at(&self, job_id: JobId, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let entry = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        entry.job.updated_at = updated_at;
        Ok(())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".to_string()))
        }
    }

    /// Jobs matching `filter`, ordered by `(order_by, seq)`, truncated to `limit`
    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&Job) -> bool,
        order_by: impl Fn(&Job) -> DateTime<Utc>,
    ) -> Vec<Job> {
        let inner = self.inner.read();
        let mut matching: Vec<&Entry> = inner.jobs.values().filter(|e| filter(&e.job)).collect();
        matching.sort_by(|a, b| {
            order_by(&a.job)
                .cmp(&order_by(&b.job))
                .then(a.seq.cmp(&b.seq))
        });
        matching
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.check_available()?;
        validate_new_job(&job, self.max_payload_bytes)?;

        let id = JobId::new();
        let now = Utc::now();
        let record = Job {
            id,
            kind: job.kind,
            payload: job.payload,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: job.max_attempts,
            next_eligible_at: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        };

        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(id, Entry { seq, job: record });

        Ok(id)
    }

    async fn fetch_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        Ok(self.select(limit, |job| job.is_eligible_at(now), |job| job.created_at))
    }

    async fn apply_transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        updates: FieldUpdates,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;

        let mut inner = self.inner.write();
        let entry = inner.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        if entry.job.status != expected {
            return Ok(false);
        }

        let mut next = entry.job.clone();
        updates.apply_to(&mut next);
        next.status = new_status;
        next.updated_at = now;

        if next.attempt_count > next.max_attempts {
            return Err(StoreError::Constraint(format!(
                "attempt_count {} exceeds max_attempts {} for job {}",
                next.attempt_count, next.max_attempts, job_id
            )));
        }

        entry.job = next;
        Ok(true)
    }

    async fn get_status(&self, job_id: JobId) -> Result<Job, StoreError> {
        self.check_available()?;
        self.inner
            .read()
            .jobs
            .get(&job_id)
            .map(|e| e.job.clone())
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn fetch_stale_running(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        Ok(self.select(
            limit,
            |job| job.status == JobStatus::Running && job.updated_at <= stale_before,
            |job| job.updated_at,
        ))
    }

    async fn count_by_status(&self) -> Result<JobCounts, StoreError> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut counts = JobCounts::default();
        for entry in inner.jobs.values() {
            counts.add(entry.job.status, 1);
            counts.total_retries += u64::from(entry.job.attempt_count);
        }
        Ok(counts)
    }
}
