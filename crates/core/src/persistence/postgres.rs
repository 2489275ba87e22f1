//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - Compare-and-set transitions via `UPDATE ... WHERE id = $1 AND status = $2`
//! - `CHECK` constraints enforcing the record invariants
//! - Embedded migrations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::job::{FieldUpdates, Job, JobId, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, kind, payload, status, attempt_count, max_attempts, \
                           next_eligible_at, created_at, updated_at, last_error";

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use taskflow_core::PostgresJobStore;
///
/// let store = PostgresJobStore::connect("postgres://localhost/taskflow", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    max_payload_bytes: usize,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Open a connection pool and wrap it
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to job store: {}", e);
                StoreError::Unavailable(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Override the payload size bound
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running job store migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Unavailable(e.to_string())
            })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(kind = %job.kind))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        validate_new_job(&job, self.max_payload_bytes)?;

        let id = JobId::new();
        let max_attempts = i32::try_from(job.max_attempts).map_err(|_| {
            StoreError::Validation(format!("max_attempts {} is too large", job.max_attempts))
        })?;

        sqlx::query(
            r#"
            INSERT INTO taskflow_jobs (id, kind, payload, status, attempt_count, max_attempts)
            VALUES ($1, $2, $3, 'pending', 0, $4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue job", e))?;

        debug!(%id, "enqueued job");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn fetch_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM taskflow_jobs
            WHERE status IN ('pending', 'retry_scheduled')
              AND (next_eligible_at IS NULL OR next_eligible_at <= $1)
            ORDER BY created_at, id
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch eligible jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, updates))]
    async fn apply_transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        updates: FieldUpdates,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let attempt_count = updates
            .attempt_count
            .map(i32::try_from)
            .transpose()
            .map_err(|_| StoreError::Constraint("attempt_count out of range".to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE taskflow_jobs
            SET status = $3,
                attempt_count = CASE WHEN $4 THEN $5 ELSE attempt_count END,
                next_eligible_at = CASE WHEN $6 THEN $7 ELSE next_eligible_at END,
                last_error = CASE WHEN $8 THEN $9 ELSE last_error END,
                updated_at = $10
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(attempt_count.is_some())
        .bind(attempt_count.unwrap_or(0))
        .bind(updates.next_eligible_at.is_some())
        .bind(updates.next_eligible_at.flatten())
        .bind(updates.last_error.is_some())
        .bind(updates.last_error.clone().flatten())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply transition", e))?;

        if result.rows_affected() == 1 {
            debug!(%job_id, from = %expected, to = %new_status, "applied transition");
            return Ok(true);
        }

        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM taskflow_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("check job existence", e))?;

        match exists {
            Some(_) => {
                debug!(%job_id, expected = %expected, "transition lost compare-and-set");
                Ok(false)
            }
            None => Err(StoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self))]
    async fn get_status(&self, job_id: JobId) -> Result<Job, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM taskflow_jobs WHERE id = $1");

        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get job", e))?
            .ok_or(StoreError::NotFound(job_id))?;

        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn fetch_stale_running(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM taskflow_jobs
            WHERE status = 'running' AND updated_at <= $1
            ORDER BY updated_at, id
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch stale running jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n, COALESCE(SUM(attempt_count), 0)::BIGINT AS retries
            FROM taskflow_jobs
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count jobs", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let retries: i64 = row.try_get("retries").map_err(corrupt)?;

            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            counts.add(status, n.max(0) as u64);
            counts.total_retries += retries.max(0) as u64;
        }
        Ok(counts)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn corrupt(e: sqlx::Error) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

/// Classify a sqlx error; anything not attributable to the data is transient
fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::CheckViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::UniqueViolation => {
                warn!("Constraint violation during {}: {}", operation, e);
                StoreError::Constraint(db.message().to_string())
            }
            _ => {
                error!("Failed to {}: {}", operation, e);
                StoreError::Unavailable(e.to_string())
            }
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            error!("Failed to decode row during {}: {}", operation, e);
            StoreError::Corrupt(e.to_string())
        }
        _ => {
            error!("Failed to {}: {}", operation, e);
            StoreError::Unavailable(e.to_string())
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(corrupt)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(corrupt)?;
    let id: Uuid = row.try_get("id").map_err(corrupt)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        kind: row.try_get("kind").map_err(corrupt)?,
        payload: row.try_get("payload").map_err(corrupt)?,
        status: status
            .parse()
            .map_err(|e: crate::job::ParseStatusError| StoreError::Corrupt(e.to_string()))?,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| StoreError::Corrupt(format!("negative attempt_count for job {id}")))?,
        max_attempts: u32::try_from(max_attempts)
            .map_err(|_| StoreError::Corrupt(format!("negative max_attempts for job {id}")))?,
        next_eligible_at: row.try_get("next_eligible_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
    })
}
