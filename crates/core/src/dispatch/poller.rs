//! Candidate discovery with adaptive idle backoff

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::config::duration_millis;
use crate::job::Job;
use crate::persistence::{JobStore, StoreError};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Idle wait right after work was found
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest idle wait
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the idle wait per empty poll
    pub backoff_multiplier: f64,

    /// Maximum candidates fetched per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a config with default intervals
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shortest idle wait
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set the longest idle wait
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the idle wait growth factor
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the per-poll fetch limit
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Fetches eligible jobs and tracks the idle interval
///
/// The interval grows by `backoff_multiplier` after every empty poll and
/// resets to `min_interval` once work is dispatched.
pub struct JobPoller {
    store: Arc<dyn JobStore>,
    config: PollerConfig,
    current_interval_ms: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    /// Create a poller that stops waiting once `shutdown_rx` reads `true`
    pub fn new(
        store: Arc<dyn JobStore>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            current_interval_ms: AtomicU64::new(millis(config.min_interval)),
            store,
            config,
            shutdown_rx,
        }
    }

    /// Fetch up to `max_jobs` candidates (never more than `batch_size`)
    #[instrument(skip(self))]
    pub async fn poll(&self, max_jobs: usize, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let limit = max_jobs.min(self.config.batch_size);
        if limit == 0 {
            return Ok(vec![]);
        }

        let jobs = self.store.fetch_eligible(limit, now).await?;
        trace!(count = jobs.len(), "Fetched candidates");
        Ok(jobs)
    }

    /// Sleep for the current idle interval
    ///
    /// Returns `true` if shutdown was signaled during the wait.
    pub async fn wait(&self) -> bool {
        self.wait_for(self.current_interval()).await
    }

    /// Sleep for `duration`, waking early on shutdown
    pub async fn wait_for(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current idle interval
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_interval_ms.load(Ordering::Relaxed))
    }

    /// Whether shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Work was dispatched; poll again promptly
    pub fn reset_backoff(&self) {
        self.current_interval_ms
            .store(millis(self.config.min_interval), Ordering::Relaxed);
    }

    /// Nothing was dispatched; wait longer next time
    pub fn increase_backoff(&self) {
        let current = self.current_interval().as_secs_f64();
        let grown = (current * self.config.backoff_multiplier).min(self.config.max_interval.as_secs_f64());
        let next = Duration::from_secs_f64(grown.max(self.config.min_interval.as_secs_f64()));
        self.current_interval_ms.store(millis(next), Ordering::Relaxed);
        trace!(interval_ms = millis(next), "No work dispatched, backing off");
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
