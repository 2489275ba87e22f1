//! Redis implementation of LeaseCoordinator
//!
//! - Acquire: `SET key token NX PX ttl`
//! - Renew: Lua compare-and-`PEXPIRE`
//! - Release: Lua compare-and-`DEL`

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, error, instrument};

use super::coordinator::*;
use crate::job::JobId;

/// Default key prefix; the job id is appended
pub const DEFAULT_KEY_PREFIX: &str = "taskflow:lease:";

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis implementation of LeaseCoordinator
///
/// # Example
///
/// ```ignore
/// use taskflow_core::RedisLeaseCoordinator;
///
/// let leases = RedisLeaseCoordinator::connect("redis://localhost:6379").await?;
/// ```
#[derive(Clone)]
pub struct RedisLeaseCoordinator {
    conn: ConnectionManager,
    key_prefix: String,
    counters: std::sync::Arc<LeaseCounters>,
    renew_script: Script,
    release_script: Script,
}

impl RedisLeaseCoordinator {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(redis_url: &str) -> Result<Self, LeaseError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            counters: Default::default(),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    /// Namespace keys, e.g. per environment
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    fn key(&self, job_id: JobId) -> String {
        format!("{}{}", self.key_prefix, job_id)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn unavailable(e: redis::RedisError) -> LeaseError {
    error!("Lease store error: {}", e);
    LeaseError::Unavailable(e.to_string())
}

#[async_trait]
impl LeaseCoordinator for RedisLeaseCoordinator {
    #[instrument(skip(self, owner))]
    async fn try_acquire(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(job_id))
            .arg(owner.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let acquired = reply.is_some();
        self.counters.record(acquired);
        debug!(%job_id, acquired, "lease acquisition");
        Ok(acquired)
    }

    #[instrument(skip(self, owner))]
    async fn renew(
        &self,
        job_id: JobId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew_script
            .key(self.key(job_id))
            .arg(owner.as_str())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(renewed == 1)
    }

    #[instrument(skip(self, owner))]
    async fn release(&self, job_id: JobId, owner: &OwnerToken) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(self.key(job_id))
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        debug!(%job_id, released = deleted == 1, "lease release");
        Ok(())
    }

    fn stats(&self) -> LeaseStats {
        self.counters.snapshot()
    }
}
