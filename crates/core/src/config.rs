//! Runtime configuration
//!
//! Every tunable of the coordination core lives in [`TaskFlowConfig`]. Values
//! come from code (`with_*` builders), from serde, or from `TASKFLOW_*`
//! environment variables.
//!
//! | Variable | Field |
//! |---|---|
//! | `WORKER_ID` | `worker_id` |
//! | `TASKFLOW_LEASE_TTL_MS` | `lease_ttl` |
//! | `TASKFLOW_LEASE_RENEW_INTERVAL_MS` | `renew_interval` |
//! | `TASKFLOW_POLL_MIN_INTERVAL_MS` | `poller.min_interval` |
//! | `TASKFLOW_POLL_MAX_INTERVAL_MS` | `poller.max_interval` |
//! | `TASKFLOW_POLL_BACKOFF_MULTIPLIER` | `poller.backoff_multiplier` |
//! | `TASKFLOW_POLL_BATCH_SIZE` | `poller.batch_size` |
//! | `TASKFLOW_BACKOFF_BASE_MS` | `backoff.base` |
//! | `TASKFLOW_BACKOFF_MULTIPLIER` | `backoff.multiplier` |
//! | `TASKFLOW_BACKOFF_MAX_MS` | `backoff.max` |
//! | `TASKFLOW_MAX_CONCURRENCY` | `max_concurrency` |
//! | `TASKFLOW_BACKPRESSURE_HIGH_WATERMARK` | `backpressure.high_watermark` |
//! | `TASKFLOW_BACKPRESSURE_LOW_WATERMARK` | `backpressure.low_watermark` |
//! | `TASKFLOW_EXECUTION_TIMEOUT_MS` | `execution_timeout` |
//! | `TASKFLOW_STORE_RETRY_DELAY_MS` | `store_retry_delay` |
//! | `TASKFLOW_RECLAIM_INTERVAL_MS` | `reclaim_interval` |
//! | `TASKFLOW_RECLAIM_BATCH_SIZE` | `reclaim_batch_size` |
//! | `TASKFLOW_MAX_PAYLOAD_BYTES` | `max_payload_bytes` |
//! | `TASKFLOW_SHUTDOWN_TIMEOUT_MS` | `shutdown_timeout` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::{BackpressureConfig, PollerConfig};
use crate::persistence::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::reliability::BackoffPolicy;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// The combination of values is unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Coordination core configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFlowConfig {
    /// Identifies this worker in owner tokens and logs
    pub worker_id: String,

    /// Lease lifetime without renewal
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// How often a running execution renews its lease (must be < `lease_ttl`)
    #[serde(with = "duration_millis")]
    pub renew_interval: Duration,

    pub poller: PollerConfig,

    /// Delay between failed attempts
    pub backoff: BackoffPolicy,

    /// Execution slots per worker
    pub max_concurrency: usize,

    pub backpressure: BackpressureConfig,

    /// Per-attempt time budget; exceeding it is an execution failure
    #[serde(with = "duration_millis")]
    pub execution_timeout: Duration,

    /// Wait after a store outage before polling again
    #[serde(with = "duration_millis")]
    pub store_retry_delay: Duration,

    /// How often stale `RUNNING` jobs are reclaimed
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    pub reclaim_batch_size: usize,

    /// Upper bound for a submitted payload, serialized
    pub max_payload_bytes: usize,

    /// How long shutdown waits for in-flight executions
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for TaskFlowConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            poller: PollerConfig::default(),
            backoff: BackoffPolicy::default(),
            max_concurrency: 10,
            backpressure: BackpressureConfig::default(),
            execution_timeout: Duration::from_secs(300),
            store_retry_delay: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(15),
            reclaim_batch_size: 50,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskFlowConfig {
    /// Load from the process environment, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Lookup(&lookup);

        if let Some(worker_id) = lookup("WORKER_ID").filter(|id| !id.trim().is_empty()) {
            config.worker_id = worker_id;
        }

        env.millis("TASKFLOW_LEASE_TTL_MS", &mut config.lease_ttl)?;
        env.millis("TASKFLOW_LEASE_RENEW_INTERVAL_MS", &mut config.renew_interval)?;
        env.millis("TASKFLOW_POLL_MIN_INTERVAL_MS", &mut config.poller.min_interval)?;
        env.millis("TASKFLOW_POLL_MAX_INTERVAL_MS", &mut config.poller.max_interval)?;
        env.parse("TASKFLOW_POLL_BACKOFF_MULTIPLIER", &mut config.poller.backoff_multiplier)?;
        env.parse("TASKFLOW_POLL_BATCH_SIZE", &mut config.poller.batch_size)?;
        env.millis("TASKFLOW_BACKOFF_BASE_MS", &mut config.backoff.base)?;
        env.parse("TASKFLOW_BACKOFF_MULTIPLIER", &mut config.backoff.multiplier)?;
        env.millis("TASKFLOW_BACKOFF_MAX_MS", &mut config.backoff.max)?;
        env.parse("TASKFLOW_MAX_CONCURRENCY", &mut config.max_concurrency)?;
        env.parse(
            "TASKFLOW_BACKPRESSURE_HIGH_WATERMARK",
            &mut config.backpressure.high_watermark,
        )?;
        env.parse(
            "TASKFLOW_BACKPRESSURE_LOW_WATERMARK",
            &mut config.backpressure.low_watermark,
        )?;
        env.millis("TASKFLOW_EXECUTION_TIMEOUT_MS", &mut config.execution_timeout)?;
        env.millis("TASKFLOW_STORE_RETRY_DELAY_MS", &mut config.store_retry_delay)?;
        env.millis("TASKFLOW_RECLAIM_INTERVAL_MS", &mut config.reclaim_interval)?;
        env.parse("TASKFLOW_RECLAIM_BATCH_SIZE", &mut config.reclaim_batch_size)?;
        env.parse("TASKFLOW_MAX_PAYLOAD_BYTES", &mut config.max_payload_bytes)?;
        env.millis("TASKFLOW_SHUTDOWN_TIMEOUT_MS", &mut config.shutdown_timeout)?;

        Ok(config)
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_store_retry_delay(mut self, delay: Duration) -> Self {
        self.store_retry_delay = delay;
        self
    }

    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn with_reclaim_batch_size(mut self, size: usize) -> Self {
        self.reclaim_batch_size = size.max(1);
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject configurations the core cannot run correctly with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".into()));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Invalid("lease_ttl must be positive".into()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "renew_interval ({:?}) must be positive and shorter than lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.poller.min_interval.is_zero() || self.poller.min_interval > self.poller.max_interval {
            return Err(ConfigError::Invalid(
                "poller intervals must satisfy 0 < min_interval <= max_interval".into(),
            ));
        }
        if self.poller.batch_size == 0 || self.reclaim_batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be positive".into()));
        }
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::Invalid("execution_timeout must be positive".into()));
        }
        if self.reclaim_interval.is_zero() {
            return Err(ConfigError::Invalid("reclaim_interval must be positive".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("max_payload_bytes must be positive".into()));
        }
        self.backoff.validate().map_err(ConfigError::Invalid)?;
        self.backpressure
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, var: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = (self.0)(var) {
            *target = value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidVar {
                    var,
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn millis(&self, var: &'static str, target: &mut Duration) -> Result<(), ConfigError> {
        let mut ms = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
        self.parse(var, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
