//! Postgres-backed quota store.
//!
//! Records are stored as JSONB, one row per caller. `upsert_with` runs in a
//! transaction that inserts the default row if missing and then locks it with
//! `SELECT ... FOR UPDATE`, so concurrent admissions for the same caller
//! serialise on the row lock.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use bulwark_core::CallerId;

use super::store::{QuotaStore, QuotaStoreError, RecordMutation};
use super::types::{DenyReason, QuotaRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quota_records (
    caller_id   TEXT PRIMARY KEY,
    record      JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresQuotaStore {
    pool: Arc<PgPool>,
}

impl PostgresQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), QuotaStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn encode(record: &QuotaRecord) -> Result<serde_json::Value, QuotaStoreError> {
    serde_json::to_value(record).map_err(|e| QuotaStoreError::Decode(format!("failed to encode record: {e}")))
}

fn decode(value: serde_json::Value) -> Result<QuotaRecord, QuotaStoreError> {
    serde_json::from_value(value).map_err(|e| QuotaStoreError::Decode(e.to_string()))
}

#[async_trait]
impl QuotaStore for PostgresQuotaStore {
    #[instrument(skip(self), fields(caller_id = %caller), err)]
    async fn get(&self, caller: &CallerId) -> Result<Option<QuotaRecord>, QuotaStoreError> {
        let row = sqlx::query("SELECT record FROM quota_records WHERE caller_id = $1")
            .bind(caller.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            let value: serde_json::Value = row
                .try_get("record")
                .map_err(|e| QuotaStoreError::Decode(e.to_string()))?;
            decode(value)
        })
        .transpose()
    }

    #[instrument(skip(self, create, mutate), fields(caller_id = %caller), err)]
    async fn upsert_with(
        &self,
        caller: &CallerId,
        create: QuotaRecord,
        mutate: RecordMutation,
    ) -> Result<(QuotaRecord, Option<DenyReason>), QuotaStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query(
            "INSERT INTO quota_records (caller_id, record) VALUES ($1, $2) ON CONFLICT (caller_id) DO NOTHING",
        )
        .bind(caller.as_str())
        .bind(encode(&create)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_default", e))?;

        let row = sqlx::query("SELECT record FROM quota_records WHERE caller_id = $1 FOR UPDATE")
            .bind(caller.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_record", e))?;
        let value: serde_json::Value = row
            .try_get("record")
            .map_err(|e| QuotaStoreError::Decode(e.to_string()))?;

        let mut record = decode(value)?;
        let verdict = mutate(&mut record);

        sqlx::query("UPDATE quota_records SET record = $2, updated_at = NOW() WHERE caller_id = $1")
            .bind(caller.as_str())
            .bind(encode(&record)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_record", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok((record, verdict))
    }

    #[instrument(skip(self), err)]
    async fn list_callers(&self) -> Result<Vec<CallerId>, QuotaStoreError> {
        let rows = sqlx::query("SELECT caller_id FROM quota_records ORDER BY caller_id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_callers", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("caller_id")
                    .map(CallerId::new)
                    .map_err(|e| QuotaStoreError::Decode(e.to_string()))
            })
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QuotaStoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            QuotaStoreError::Unavailable(format!("{} in {}", err, operation))
        }
        _ => QuotaStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
