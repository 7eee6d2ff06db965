//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is a single statement:
//!
//! ```sql
//! UPDATE jobs SET status = 'processing', attempts = attempts + 1, ...
//! WHERE id = (SELECT id FROM jobs WHERE <eligible> ORDER BY priority, scheduled_at
//!             FOR UPDATE SKIP LOCKED LIMIT 1)
//! RETURNING *
//! ```
//!
//! Rows locked by a concurrent claimer are skipped rather than waited on, so N
//! workers claim N distinct jobs without serialising on the queue head.
//!
//! ## Conditional writes
//!
//! `update_if` adds `AND status = $expected AND attempts = $expected` to the
//! `UPDATE`; zero affected rows means the claim was lost.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use bulwark_core::{CallerId, CorrelationId, ErrorKind, JobId};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobFilter, JobKind, JobMetadata, JobStats, JobStatus, JobVersion};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id                  UUID PRIMARY KEY,
    kind                TEXT NOT NULL,
    priority            SMALLINT NOT NULL CHECK (priority BETWEEN 1 AND 10),
    status              TEXT NOT NULL,
    payload             JSONB NOT NULL,
    result              JSONB,
    error               TEXT,
    error_kind          TEXT,
    attempts            INTEGER NOT NULL DEFAULT 0,
    max_attempts        INTEGER NOT NULL,
    scheduled_at        TIMESTAMPTZ NOT NULL,
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    next_retry_at       TIMESTAMPTZ,
    processing_time_ms  BIGINT,
    tags                TEXT[] NOT NULL DEFAULT '{}',
    caller_id           TEXT,
    correlation_id      UUID,
    worker_id           TEXT,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    CHECK (attempts <= max_attempts)
);
CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (status, priority, scheduled_at);
CREATE INDEX IF NOT EXISTS jobs_caller_idx ON jobs (caller_id);
"#;

const COLUMNS: &str = "id, kind, priority, status, payload, result, error, error_kind, attempts, \
     max_attempts, scheduled_at, started_at, completed_at, next_retry_at, processing_time_ms, \
     tags, caller_id, correlation_id, worker_id, created_at, updated_at";

/// Durable job store on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>, JobStoreError> {
        rows.iter()
            .map(|row| {
                JobRow::from_row(row)
                    .map_err(|e| JobStoreError::Decode(format!("failed to read job row: {e}")))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.kind.as_str())
        .bind(i16::from(job.priority))
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.error_kind.map(ErrorKind::as_str))
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.next_retry_at)
        .bind(job.processing_time_ms.map(|ms| ms as i64))
        .bind(&job.tags)
        .bind(job.metadata.caller_id.as_ref().map(CallerId::as_str))
        .bind(job.metadata.correlation_id.map(|c| *c.as_uuid()))
        .bind(&job.worker_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                JobStoreError::AlreadyExists(job.id)
            }
            other => map_sqlx_error("insert", other),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        Ok(Self::decode_rows(rows)?.pop())
    }

    #[instrument(skip(self, kinds), fields(worker = worker_id), err)]
    async fn claim_next(
        &self,
        worker_id: &str,
        kinds: Option<&[JobKind]>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let kinds: Option<Vec<&str>> = kinds.map(|ks| ks.iter().map(|k| k.as_str()).collect());

        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = $1,
                completed_at = NULL,
                worker_id = $2,
                updated_at = $1
            WHERE id = (
                SELECT id FROM jobs
                WHERE attempts < max_attempts
                  AND ((status = 'pending' AND scheduled_at <= $1)
                    OR (status = 'retrying' AND (next_retry_at IS NULL OR next_retry_at <= $1)))
                  AND ($3::TEXT[] IS NULL OR kind = ANY($3))
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .bind(worker_id)
        .bind(kinds)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        Ok(Self::decode_rows(rows)?.pop())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update_if(&self, job: &Job, expected: JobVersion) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $3,
                result = $4,
                error = $5,
                error_kind = $6,
                attempts = $7,
                started_at = $8,
                completed_at = $9,
                next_retry_at = $10,
                processing_time_ms = $11,
                worker_id = $12,
                updated_at = $13
            WHERE id = $1 AND status = $2 AND attempts = $14
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(expected.status.as_str())
        .bind(job.status.as_str())
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.error_kind.map(ErrorKind::as_str))
        .bind(job.attempts as i32)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.next_retry_at)
        .bind(job.processing_time_ms.map(|ms| ms as i64))
        .bind(&job.worker_id)
        .bind(job.updated_at)
        .bind(expected.attempts as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_if", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get(job.id).await?.is_none() {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(false)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE ($1::TEXT IS NULL OR kind = $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
              AND ($3::TEXT IS NULL OR caller_id = $3)
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(filter.kind.map(JobKind::as_str))
        .bind(statuses)
        .bind(filter.caller_id.as_ref().map(CallerId::as_str))
        .bind(filter.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status = 'processing' AND (started_at IS NULL OR started_at < $1) \
             ORDER BY started_at ASC"
        ))
        .bind(started_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stuck", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs \
             WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_terminal_before", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Decode(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Decode(format!("failed to read count: {e}")))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: super::types::UnknownVariant| JobStoreError::Decode(e.to_string()))?;
            stats.record(status, total.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {} (code {}): {}",
            operation,
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    kind: String,
    priority: i16,
    status: String,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    error_kind: Option<String>,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    processing_time_ms: Option<i64>,
    tags: Vec<String>,
    caller_id: Option<String>,
    correlation_id: Option<uuid::Uuid>,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            error_kind: row.try_get("error_kind")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            processing_time_ms: row.try_get("processing_time_ms")?,
            tags: row.try_get("tags")?,
            caller_id: row.try_get("caller_id")?,
            correlation_id: row.try_get("correlation_id")?,
            worker_id: row.try_get("worker_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let decode = |e: super::types::UnknownVariant| JobStoreError::Decode(e.to_string());
        let error_kind = row
            .error_kind
            .map(|k| {
                serde_json::from_value::<ErrorKind>(serde_json::Value::String(k))
                    .map_err(|e| JobStoreError::Decode(format!("bad error kind: {e}")))
            })
            .transpose()?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            kind: row.kind.parse().map_err(decode)?,
            priority: u8::try_from(row.priority)
                .map_err(|_| JobStoreError::Decode(format!("bad priority: {}", row.priority)))?,
            status: row.status.parse().map_err(decode)?,
            payload: row.payload,
            result: row.result,
            error: row.error,
            error_kind,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            next_retry_at: row.next_retry_at,
            processing_time_ms: row.processing_time_ms.map(|ms| ms.max(0) as u64),
            tags: row.tags,
            metadata: JobMetadata {
                caller_id: row.caller_id.map(CallerId::new),
                correlation_id: row.correlation_id.map(CorrelationId::from_uuid),
            },
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
