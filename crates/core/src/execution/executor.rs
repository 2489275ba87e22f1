//! Execution wrapper
//!
//! Runs one attempt of a job that this worker has already moved to `RUNNING`
//! under a lease, then records the outcome durably:
//!
//! 1. Run the handler under `execution_timeout`, renewing the lease every
//!    `renew_interval`. Losing the lease drops the in-flight work.
//! 2. Confirm the lease with one final renewal.
//! 3. Feed the outcome through the state machine and backoff policy.
//! 4. Commit with compare-and-set on `RUNNING`.
//! 5. Release the lease, only after the commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::handler::{ExecutionFailure, HandlerRegistry, JobContext, JobHandler};
use crate::config::TaskFlowConfig;
use crate::error::TaskFlowError;
use crate::job::{Job, JobEvent, JobId, JobStatus, Transition};
use crate::lease::{LeaseCoordinator, LeaseGrant};
use crate::persistence::{JobStore, StoreError};
use crate::reliability::BackoffPolicy;

/// Why an attempt's result was not committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Renewal failed or authority lapsed; the job is recovered through expiry
    LeaseLost,

    /// The job was moved by another path before the commit
    Superseded,

    /// The commit could not reach the store; the lease is left to expire
    StoreUnavailable(String),

    /// The state machine or the store refused the transition
    Rejected(String),
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReport {
    /// The transition to this status was durably recorded
    Committed(JobStatus),

    /// Nothing was recorded
    Discarded(DiscardReason),
}

impl ExecutionReport {
    /// Whether the outcome was durably recorded
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Map onto the crate error taxonomy
    pub fn into_result(self, job_id: JobId) -> Result<JobStatus, TaskFlowError> {
        match self {
            Self::Committed(status) => Ok(status),
            Self::Discarded(DiscardReason::LeaseLost) => Err(TaskFlowError::LeaseLost(job_id)),
            Self::Discarded(DiscardReason::Superseded) => Err(TaskFlowError::Superseded(job_id)),
            Self::Discarded(DiscardReason::StoreUnavailable(msg)) => {
                Err(TaskFlowError::StoreUnavailable(msg))
            }
            Self::Discarded(DiscardReason::Rejected(msg)) => Err(TaskFlowError::Internal(msg)),
        }
    }
}

enum RunOutcome {
    Finished(Result<(), ExecutionFailure>),
    LeaseLost,
}

/// Runs attempts and records their outcome
pub struct ExecutionWrapper {
    store: Arc<dyn JobStore>,
    leases: Arc<dyn LeaseCoordinator>,
    handlers: Arc<HandlerRegistry>,
    worker_id: String,
    lease_ttl: Duration,
    renew_interval: Duration,
    execution_timeout: Duration,
    backoff: BackoffPolicy,
}

impl ExecutionWrapper {
    pub fn new(
        store: Arc<dyn JobStore>,
        leases: Arc<dyn LeaseCoordinator>,
        handlers: Arc<HandlerRegistry>,
        config: &TaskFlowConfig,
    ) -> Self {
        Self {
            store,
            leases,
            handlers,
            worker_id: config.worker_id.clone(),
            lease_ttl: config.lease_ttl,
            renew_interval: config.renew_interval,
            execution_timeout: config.execution_timeout,
            backoff: config.backoff.clone(),
        }
    }

    /// Failure event for `job`'s current attempt, with its backoff delay
    fn failure_event(&self, job: &Job, error: impl Into<String>) -> JobEvent {
        JobEvent::Failed {
            error: error.into(),
            retry_delay: self.backoff.delay_for_attempt(job.attempt_count + 1),
        }
    }

    /// Execute `job` (already `RUNNING` under `grant`) and record the outcome
    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt_count + 1))]
    pub async fn execute(&self, job: Job, grant: LeaseGrant) -> ExecutionReport {
        let ctx = JobContext::for_job(&job, self.worker_id.clone());

        let outcome = match self.handlers.get(&job.kind) {
            Some(handler) => match self.run_with_renewal(handler, &ctx, &job, &grant).await {
                RunOutcome::Finished(outcome) => outcome,
                RunOutcome::LeaseLost => {
                    warn!("Lease lost during execution, discarding result");
                    return ExecutionReport::Discarded(DiscardReason::LeaseLost);
                }
            },
            None => {
                warn!("No handler registered for job kind");
                Err(ExecutionFailure::new(format!(
                    "no handler registered for kind '{}'",
                    job.kind
                )))
            }
        };

        // Authority must be confirmed right before the commit
        match self.leases.renew(job.id, &grant.owner, self.lease_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Lease lost before commit, discarding result");
                return ExecutionReport::Discarded(DiscardReason::LeaseLost);
            }
            Err(e) => {
                warn!(error = %e, "Could not confirm lease before commit, discarding result");
                return ExecutionReport::Discarded(DiscardReason::LeaseLost);
            }
        }

        let event = match outcome {
            Ok(()) => JobEvent::Succeeded,
            Err(failure) => {
                debug!(error = %failure, "Attempt failed");
                self.failure_event(&job, failure.message)
            }
        };

        let report = self.commit(&job, &event).await;
        if !matches!(report, ExecutionReport::Discarded(DiscardReason::StoreUnavailable(_))) {
            self.release(&job, &grant).await;
        }
        report
    }

    async fn run_with_renewal(
        &self,
        handler: Arc<dyn JobHandler>,
        ctx: &JobContext,
        job: &Job,
        grant: &LeaseGrant,
    ) -> RunOutcome {
        let work = tokio::time::timeout(
            self.execution_timeout,
            handler.execute(ctx, job.payload.clone()),
        );
        tokio::pin!(work);

        let mut ticker = tokio::time::interval_at(Instant::now() + self.renew_interval, self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_confirmed = grant.acquired_at;

        loop {
            tokio::select! {
                result = &mut work => {
                    return RunOutcome::Finished(result.unwrap_or_else(|_| {
                        Err(ExecutionFailure::new(format!(
                            "timed out after {}ms",
                            self.execution_timeout.as_millis()
                        )))
                    }));
                }
                _ = ticker.tick() => {
                    match self.leases.renew(job.id, &grant.owner, self.lease_ttl).await {
                        Ok(true) => {
                            last_confirmed = Instant::now();
                            debug!("Lease renewed");
                        }
                        Ok(false) => return RunOutcome::LeaseLost,
                        Err(e) => {
                            // Authority survives until the last confirmed renewal expires
                            if last_confirmed.elapsed() >= self.lease_ttl {
                                warn!(error = %e, "Lease renewal failing past TTL");
                                return RunOutcome::LeaseLost;
                            }
                            warn!(error = %e, "Lease renewal failed, will retry");
                        }
                    }
                }
            }
        }
    }

    async fn commit(&self, job: &Job, event: &JobEvent) -> ExecutionReport {
        let now = Utc::now();
        let transition = match Transition::compute(job, event, now) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Illegal transition, not applied");
                return ExecutionReport::Discarded(DiscardReason::Rejected(e.to_string()));
            }
        };

        match self
            .store
            .apply_transition(job.id, transition.from, transition.to, transition.updates, now)
            .await
        {
            Ok(true) => {
                info!(status = %transition.to, "Recorded attempt outcome");
                ExecutionReport::Committed(transition.to)
            }
            Ok(false) => {
                warn!("Job moved by another path, result superseded");
                ExecutionReport::Discarded(DiscardReason::Superseded)
            }
            Err(StoreError::Unavailable(msg)) => {
                warn!(error = %msg, "Store unavailable at commit, leaving lease to expire");
                ExecutionReport::Discarded(DiscardReason::StoreUnavailable(msg))
            }
            Err(e) => {
                error!(error = %e, "Store rejected transition");
                ExecutionReport::Discarded(DiscardReason::Rejected(e.to_string()))
            }
        }
    }

    async fn release(&self, job: &Job, grant: &LeaseGrant) {
        if let Err(e) = self.leases.release(job.id, &grant.owner).await {
            // Harmless: the lease expires on its own
            warn!(error = %e, "Failed to release lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::job::{FieldUpdates, NewJob};
    use crate::lease::InMemoryLeaseCoordinator;
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryJobStore>,
        leases: Arc<InMemoryLeaseCoordinator>,
        wrapper: ExecutionWrapper,
        config: TaskFlowConfig,
    }

    fn harness(registry: HandlerRegistry, config: TaskFlowConfig) -> Harness {
        let store = Arc::new(InMemoryJobStore::new());
        let leases = Arc::new(InMemoryLeaseCoordinator::new());
        let wrapper = ExecutionWrapper::new(store.clone(), leases.clone(), Arc::new(registry), &config);
        Harness {
            store,
            leases,
            wrapper,
            config,
        }
    }

    fn config() -> TaskFlowConfig {
        TaskFlowConfig::default()
            .with_worker_id("test-worker")
            .with_lease_ttl(Duration::from_secs(30))
            .with_renew_interval(Duration::from_secs(10))
            .with_backoff(BackoffPolicy::exponential().with_base(Duration::from_secs(2)))
    }

    /// Enqueue, acquire and move to RUNNING the way the dispatcher does
    async fn claim(h: &Harness, kind: &str, max_attempts: u32) -> (Job, LeaseGrant) {
        let id = h.store.enqueue(NewJob::new(kind, json!({}), max_attempts)).await.unwrap();
        let grant = LeaseGrant::new(&h.config.worker_id);
        assert!(h.leases.try_acquire(id, &grant.owner, h.config.lease_ttl).await.unwrap());
        assert!(h
            .store
            .apply_transition(id, JobStatus::Pending, JobStatus::Running, FieldUpdates::none(), Utc::now())
            .await
            .unwrap());
        (h.store.get_status(id).await.unwrap(), grant)
    }

    fn registry_with(kind: &str, fail: bool) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(kind, move |_, _| async move {
                if fail {
                    Err(ExecutionFailure::new("boom"))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_success_commits_and_releases() {
        let h = harness(registry_with("ok", false), config());
        let (job, grant) = claim(&h, "ok", 3).await;

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert_eq!(report, ExecutionReport::Committed(JobStatus::Success));
        let stored = h.store.get_status(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.attempt_count, 0);
        assert!(h.leases.holder(job.id).is_none());
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let h = harness(registry_with("bad", true), config());
        let (job, grant) = claim(&h, "bad", 3).await;
        let before = Utc::now();

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert_eq!(report, ExecutionReport::Committed(JobStatus::RetryScheduled));
        let stored = h.store.get_status(job.id).await.unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        let eligible_at = stored.next_eligible_at.unwrap();
        assert!(eligible_at >= before + chrono::Duration::seconds(2));
        assert!(h.leases.holder(job.id).is_none());
    }

    #[tokio::test]
    async fn test_missing_handler_fails_attempt() {
        let h = harness(HandlerRegistry::new(), config());
        let (job, grant) = claim(&h, "unknown", 1).await;

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert_eq!(report, ExecutionReport::Committed(JobStatus::Dead));
        let stored = h.store.get_status(job.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("no handler registered"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failure() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .unwrap();
        let h = harness(registry, config().with_execution_timeout(Duration::from_secs(25)));
        let (job, grant) = claim(&h, "slow", 2).await;

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert_eq!(report, ExecutionReport::Committed(JobStatus::RetryScheduled));
        let stored = h.store.get_status(job.id).await.unwrap();
        assert!(stored.last_error.unwrap().starts_with("timed out after 25000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_execution_renews_lease() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("long", |_, _| async {
                tokio::time::sleep(Duration::from_secs(95)).await;
                Ok(())
            })
            .unwrap();
        let h = harness(registry, config());
        let (job, grant) = claim(&h, "long", 1).await;

        // 95s is three TTLs; without renewal the lease would have expired
        let report = h.wrapper.execute(job.clone(), grant).await;
        assert_eq!(report, ExecutionReport::Committed(JobStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lost_discards_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry
            .register_fn("long", move |_, _| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        let h = harness(registry, config());
        let (job, grant) = claim(&h, "long", 3).await;

        let leases = h.leases.clone();
        let flusher = async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            leases.flush();
        };
        let (report, _) = tokio::join!(h.wrapper.execute(job.clone(), grant), flusher);

        assert_eq!(report, ExecutionReport::Discarded(DiscardReason::LeaseLost));
        // Work is dropped at the first failed renewal, before it finishes
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get_status(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_superseded_commit_is_discarded() {
        let h = harness(registry_with("ok", false), config());
        let (job, grant) = claim(&h, "ok", 3).await;

        // Another path already moved the job
        h.store
            .apply_transition(
                job.id,
                JobStatus::Running,
                JobStatus::RetryScheduled,
                FieldUpdates::none()
                    .with_attempt_count(1)
                    .with_next_eligible_at(Some(Utc::now())),
                Utc::now(),
            )
            .await
            .unwrap();

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert_eq!(report, ExecutionReport::Discarded(DiscardReason::Superseded));
        assert!(h.leases.holder(job.id).is_none());
        assert_eq!(
            h.store.get_status(job.id).await.unwrap().status,
            JobStatus::RetryScheduled
        );
    }

    #[tokio::test]
    async fn test_store_outage_at_commit_keeps_lease() {
        let store = Arc::new(InMemoryJobStore::new());
        let leases = Arc::new(InMemoryLeaseCoordinator::new());
        let mut registry = HandlerRegistry::new();
        let outage = store.clone();
        registry
            .register_fn("flaky", move |_, _| {
                let outage = outage.clone();
                async move {
                    outage.set_available(false);
                    Ok(())
                }
            })
            .unwrap();
        let config = config();
        let h = Harness {
            wrapper: ExecutionWrapper::new(store.clone(), leases.clone(), Arc::new(registry), &config),
            store,
            leases,
            config,
        };
        let (job, grant) = claim(&h, "flaky", 3).await;
        let owner = grant.owner.clone();

        let report = h.wrapper.execute(job.clone(), grant).await;

        assert!(matches!(
            report,
            ExecutionReport::Discarded(DiscardReason::StoreUnavailable(_))
        ));
        assert_eq!(h.leases.holder(job.id), Some(owner));

        h.store.set_available(true);
        assert_eq!(h.store.get_status(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[test]
    fn test_into_result() {
        let id = JobId::new();
        assert_eq!(
            ExecutionReport::Committed(JobStatus::Dead).into_result(id).unwrap(),
            JobStatus::Dead
        );
        assert!(matches!(
            ExecutionReport::Discarded(DiscardReason::LeaseLost).into_result(id),
            Err(TaskFlowError::LeaseLost(_))
        ));
    }
}
