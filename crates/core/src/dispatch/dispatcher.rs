//! Dispatcher: the per-worker control loop
//!
//! Discovers eligible jobs, gates each through lease acquisition, moves the
//! winners to `RUNNING` and hands them to the execution wrapper. A second
//! loop reclaims `RUNNING` jobs whose holder stopped renewing.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::backpressure::ExecutionSlots;
use super::poller::JobPoller;
use crate::config::{ConfigError, TaskFlowConfig};
use crate::execution::{ExecutionWrapper, HandlerRegistry};
use crate::job::{Job, JobEvent, JobStatus, Transition};
use crate::lease::{LeaseCoordinator, LeaseGrant};
use crate::persistence::{JobStore, StoreError};

/// Dispatcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    Stopped,
    Running,
    /// Shutdown signaled, waiting for in-flight executions
    Draining,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out with {in_flight} executions in flight")]
    ShutdownTimeout { in_flight: usize },
}

/// What one discovery/claim cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Candidates returned by the store
    pub fetched: usize,

    /// Claimed and handed to execution
    pub dispatched: usize,

    /// Lease held by another worker
    pub lost_races: usize,

    /// Lease won but the job had already moved
    pub superseded: usize,

    /// Lease store errors; the candidate is retried next poll
    pub lease_errors: usize,

    /// Polling skipped because execution slots are saturated
    pub backpressured: bool,
}

struct Shared {
    store: Arc<dyn JobStore>,
    leases: Arc<dyn LeaseCoordinator>,
    executor: Arc<ExecutionWrapper>,
    config: TaskFlowConfig,
    slots: ExecutionSlots,
    poller: JobPoller,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<DispatcherStatus>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Polling dispatcher with bounded execution slots
///
/// Cheap to clone; clones share the same loops and slots.
///
/// # Example
///
/// ```ignore
/// use taskflow_core::prelude::*;
///
/// let dispatcher = Dispatcher::new(store, leases, Arc::new(registry), config)?;
/// dispatcher.start()?;
///
/// // ... later, graceful shutdown
/// dispatcher.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Build a stopped dispatcher; fails on an invalid `config`
    pub fn new(
        store: Arc<dyn JobStore>,
        leases: Arc<dyn LeaseCoordinator>,
        handlers: Arc<HandlerRegistry>,
        config: TaskFlowConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let executor = Arc::new(ExecutionWrapper::new(
            store.clone(),
            leases.clone(),
            handlers,
            &config,
        ));
        let slots = ExecutionSlots::new(config.max_concurrency, &config.backpressure);
        let poller = JobPoller::new(store.clone(), config.poller.clone(), shutdown_rx);

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                leases,
                executor,
                slots,
                poller,
                shutdown_tx,
                status: RwLock::new(DispatcherStatus::Stopped),
                loops: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Identity used in lease owner tokens
    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Current lifecycle state
    pub fn status(&self) -> DispatcherStatus {
        *self.shared.status.read()
    }

    /// Executions currently running on this worker
    pub fn in_flight(&self) -> usize {
        self.shared.slots.in_flight()
    }

    /// Run one discovery/claim cycle
    ///
    /// Executions are spawned and not awaited. A store outage is returned as
    /// [`StoreError::Unavailable`] after any lease taken in this cycle has
    /// been released; the job itself is left untouched.
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn poll_once(&self) -> Result<DispatchReport, StoreError> {
        let s = &self.shared;
        let mut report = DispatchReport::default();

        if !s.slots.admit() {
            debug!(
                in_flight = s.slots.in_flight(),
                capacity = s.slots.capacity(),
                "Under backpressure, not polling"
            );
            report.backpressured = true;
            return Ok(report);
        }

        let candidates = s
            .poller
            .poll(s.slots.available(), Utc::now())
            .await?;
        report.fetched = candidates.len();

        for job in candidates {
            if s.poller.is_shutdown() {
                break;
            }

            let Some(slot) = s.slots.try_claim() else {
                debug!("No execution slots available");
                break;
            };

            let grant = LeaseGrant::new(&s.config.worker_id);
            match s.leases.try_acquire(job.id, &grant.owner, s.config.lease_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "Lost lease race");
                    report.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Lease acquisition failed");
                    report.lease_errors += 1;
                    continue;
                }
            }

            let running = match self.mark_running(&job, &grant).await {
                Ok(Some(running)) => running,
                Ok(None) => {
                    report.superseded += 1;
                    continue;
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Could not start job");
                    report.superseded += 1;
                    continue;
                }
            };

            let executor = s.executor.clone();
            tokio::spawn(async move {
                // The slot is held until the outcome is recorded, even on panic
                let _slot = slot;
                let job_id = running.id;
                match executor.execute(running, grant).await.into_result(job_id) {
                    Ok(status) => debug!(%job_id, %status, "Execution committed"),
                    Err(e) => debug!(%job_id, error = %e, "Execution result discarded"),
                }
            });

            report.dispatched += 1;
        }

        if report.dispatched > 0 {
            s.poller.reset_backoff();
            debug!(
                fetched = report.fetched,
                dispatched = report.dispatched,
                lost_races = report.lost_races,
                "Dispatched jobs"
            );
        } else {
            s.poller.increase_backoff();
        }

        Ok(report)
    }

    /// Move a leased candidate to `RUNNING`; releases the lease unless it succeeds
    async fn mark_running(&self, job: &Job, grant: &LeaseGrant) -> Result<Option<Job>, StoreError> {
        let s = &self.shared;
        let now = Utc::now();

        let transition = match Transition::compute(job, &JobEvent::LeaseAcquired, now) {
            Ok(t) => t,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Candidate not startable");
                self.release(job, grant).await;
                return Ok(None);
            }
        };

        let applied = s
            .store
            .apply_transition(job.id, transition.from, transition.to, transition.updates.clone(), now)
            .await;

        match applied {
            Ok(true) => {
                let mut running = job.clone();
                transition.updates.apply_to(&mut running);
                running.status = transition.to;
                running.updated_at = now;
                Ok(Some(running))
            }
            Ok(false) => {
                debug!(job_id = %job.id, "Job moved before it could be started");
                self.release(job, grant).await;
                Ok(None)
            }
            Err(e) => {
                self.release(job, grant).await;
                Err(e)
            }
        }
    }

    /// Recover `RUNNING` jobs whose lease expired
    ///
    /// Winning the lease on a stale `RUNNING` job proves the previous holder
    /// stopped renewing. The job goes back to `RETRY_SCHEDULED`, eligible
    /// immediately and without spending an attempt, so a crash never pushes
    /// it toward `DEAD`. Returns the number of jobs reclaimed.
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn reclaim_once(&self) -> Result<usize, StoreError> {
        let s = &self.shared;
        let ttl = chrono::Duration::from_std(s.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let stale_before = Utc::now() - ttl;

        let candidates = s
            .store
            .fetch_stale_running(s.config.reclaim_batch_size, stale_before)
            .await?;

        let mut reclaimed = 0;
        for job in candidates {
            let grant = LeaseGrant::new(&s.config.worker_id);
            match s.leases.try_acquire(job.id, &grant.owner, s.config.lease_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "Stale job still leased, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Lease acquisition failed during reclaim");
                    continue;
                }
            }

            let event = JobEvent::LeaseExpired {
                reason: format!(
                    "lease expired: holder stopped renewing within {}ms",
                    s.config.lease_ttl.as_millis()
                ),
            };
            let now = Utc::now();
            let result = match Transition::compute(&job, &event, now) {
                Ok(Transition { to, updates, .. }) => s
                    .store
                    .apply_transition(job.id, JobStatus::Running, to, updates, now)
                    .await
                    .map(|applied| applied.then_some(to)),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Stale job cannot be reclaimed");
                    Ok(None)
                }
            };

            self.release(&job, &grant).await;

            match result {
                Ok(Some(status)) => {
                    info!(job_id = %job.id, %status, "Reclaimed abandoned job");
                    reclaimed += 1;
                }
                Ok(None) => debug!(job_id = %job.id, "Stale job moved before reclaim"),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => error!(job_id = %job.id, error = %e, "Reclaim rejected by store"),
            }
        }

        Ok(reclaimed)
    }

    async fn release(&self, job: &Job, grant: &LeaseGrant) {
        if let Err(e) = self.shared.leases.release(job.id, &grant.owner).await {
            warn!(job_id = %job.id, error = %e, "Failed to release lease");
        }
    }

    /// Spawn the poll and reclaim loops
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub fn start(&self) -> Result<(), DispatcherError> {
        {
            let mut status = self.shared.status.write();
            if *status != DispatcherStatus::Stopped {
                return Err(DispatcherError::AlreadyRunning);
            }
            *status = DispatcherStatus::Running;
        }
        self.shared.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.shared.config.worker_id,
            max_concurrency = self.shared.config.max_concurrency,
            batch_size = self.shared.config.poller.batch_size,
            "Starting dispatcher"
        );

        let poll = self.spawn_poll_loop();
        let reclaim = self.spawn_reclaim_loop();
        self.shared.loops.lock().extend([poll, reclaim]);
        Ok(())
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let s = &this.shared;
            loop {
                if s.poller.is_shutdown() {
                    break;
                }

                let shutdown = match this.poll_once().await {
                    Ok(report) if report.backpressured => {
                        s.poller.wait_for(s.config.poller.min_interval).await
                    }
                    Ok(report) if report.dispatched > 0 => false,
                    Ok(_) => s.poller.wait().await,
                    Err(e) => {
                        warn!(error = %e, "Poll failed, retrying after delay");
                        s.poller.wait_for(s.config.store_retry_delay).await
                    }
                };

                if shutdown {
                    break;
                }
            }
            debug!("Poll loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let s = &this.shared;
            let mut shutdown_rx = s.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(s.config.reclaim_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match this.reclaim_once().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "Reclaimed abandoned jobs"),
                            Err(e) => warn!(error = %e, "Reclaim failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            debug!("Reclaim loop exited");
        })
    }

    /// Wait until no execution is in flight
    pub async fn wait_idle(&self) {
        self.shared.slots.drained().await;
    }

    /// Stop polling and drain in-flight executions within `shutdown_timeout`
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        {
            let mut status = self.shared.status.write();
            if *status == DispatcherStatus::Stopped {
                return Ok(());
            }
            *status = DispatcherStatus::Draining;
        }

        info!(worker_id = %self.shared.config.worker_id, "Initiating graceful shutdown");
        let _ = self.shared.shutdown_tx.send(true);

        let loops: Vec<JoinHandle<()>> = self.shared.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher loop panicked");
            }
        }

        if tokio::time::timeout(self.shared.config.shutdown_timeout, self.wait_idle())
            .await
            .is_err()
        {
            let in_flight = self.in_flight();
            warn!(in_flight, "Shutdown timeout reached");
            *self.shared.status.write() = DispatcherStatus::Stopped;
            return Err(DispatcherError::ShutdownTimeout { in_flight });
        }

        *self.shared.status.write() = DispatcherStatus::Stopped;
        info!(worker_id = %self.shared.config.worker_id, "Dispatcher stopped");
        Ok(())
    }
}
