//! Postgres-backed job store.
//!
//! ## Conditional writes
//!
//! Every update is a single `UPDATE ... WHERE id = $1 AND version = $n AND status NOT IN
//! ('done', 'dead') RETURNING ...`. When no row comes back the record is re-read to
//! tell the caller why:
//!
//! | Stored record | JobStoreError |
//! |---------------|---------------|
//! | missing | `NotFound` |
//! | `done` / `dead` | `TerminalLocked` |
//! | other version | `Conflict` |
//!
//! Deletes are symmetric: only terminal rows at the expected version are removed.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use drainq_core::{ExpectedVersion, JobId, OwnerId};
use drainq_extract::FieldSet;

use super::store::{BatchResult, BatchWrite, DEFAULT_BATCH_LIMIT, JobQuery, JobStore, JobStoreError};
use super::types::{Job, JobPayload, JobStatus, Outcome};

/// Table and indexes. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS drainq_jobs (
    id            UUID PRIMARY KEY,
    owner         TEXT NOT NULL,
    text          TEXT NOT NULL,
    fields        JSONB NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('queued', 'claimed', 'done', 'dead')),
    enqueued_at   TIMESTAMPTZ NOT NULL,
    claimed_at    TIMESTAMPTZ,
    attempt       INTEGER NOT NULL DEFAULT 0 CHECK (attempt >= 0),
    completed_at  TIMESTAMPTZ,
    outcome       JSONB,
    last_error    TEXT,
    version       BIGINT NOT NULL CHECK (version > 0)
);

CREATE INDEX IF NOT EXISTS drainq_jobs_owner_status_order
    ON drainq_jobs (owner, status, enqueued_at, id);

CREATE INDEX IF NOT EXISTS drainq_jobs_retention
    ON drainq_jobs (completed_at, id)
    WHERE status IN ('done', 'dead');
"#;

const COLUMNS: &str = "id, owner, text, fields, status, enqueued_at, claimed_at, attempt, \
                       completed_at, outcome, last_error, version";

/// Postgres-backed job store.
///
/// Uses the SQLx pool directly; the adapter itself holds no state besides the pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    batch_limit: usize,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// Create the jobs table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn update_in(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        expected: ExpectedVersion,
    ) -> Result<Job, JobStoreError> {
        let outcome = encode_outcome(job.outcome.as_ref())?;
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE drainq_jobs
            SET status = $2,
                claimed_at = $3,
                attempt = $4,
                completed_at = $5,
                outcome = $6,
                last_error = $7,
                version = version + 1
            WHERE id = $1
              AND ($8::BIGINT IS NULL OR version = $8)
              AND status NOT IN ('done', 'dead')
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.claimed_at)
        .bind(job.attempt as i32)
        .bind(job.completed_at)
        .bind(outcome)
        .bind(job.last_error.as_deref())
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_set", e))?;

        match row {
            Some(row) => JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
                .try_into(),
            None => Err(Self::explain_miss(tx, job.id, expected).await),
        }
    }

    async fn delete_in(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        expected: ExpectedVersion,
    ) -> Result<(), JobStoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let result = sqlx::query(
            r#"
            DELETE FROM drainq_jobs
            WHERE id = $1
              AND ($2::BIGINT IS NULL OR version = $2)
              AND status IN ('done', 'dead')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(expected_version)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match Self::current_version(tx, job_id).await {
            Ok(Some((_, actual))) => Err(JobStoreError::Conflict {
                job_id,
                expected,
                actual,
            }),
            Ok(None) => Err(JobStoreError::NotFound(job_id)),
            Err(e) => Err(e),
        }
    }

    /// Why a conditional update matched no row.
    async fn explain_miss(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        expected: ExpectedVersion,
    ) -> JobStoreError {
        match Self::current_version(tx, job_id).await {
            Ok(None) => JobStoreError::NotFound(job_id),
            Ok(Some((status, _))) if status.is_terminal() => JobStoreError::TerminalLocked(job_id),
            Ok(Some((_, actual))) => JobStoreError::Conflict {
                job_id,
                expected,
                actual,
            },
            Err(e) => e,
        }
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<(JobStatus, u64)>, JobStoreError> {
        let row = sqlx::query("SELECT status, version FROM drainq_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("current_version", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row
            .try_get("status")
            .map_err(|e| map_sqlx_error("current_version", e))?;
        let version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("current_version", e))?;
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(Some((status, version as u64)))
    }

    fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>, JobStoreError> {
        rows.iter()
            .map(|row| {
                JobRow::from_row(row)
                    .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
                    .try_into()
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, owner = %job.owner), err)]
    async fn insert(&self, mut job: Job) -> Result<Job, JobStoreError> {
        job.version = 1;
        let fields = serde_json::to_value(&job.payload.fields)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode fields: {e}")))?;
        let outcome = encode_outcome(job.outcome.as_ref())?;

        sqlx::query(
            r#"
            INSERT INTO drainq_jobs (
                id, owner, text, fields, status, enqueued_at, claimed_at,
                attempt, completed_at, outcome, last_error, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner.as_str())
        .bind(&job.payload.text)
        .bind(fields)
        .bind(job.status.as_str())
        .bind(job.enqueued_at)
        .bind(job.claimed_at)
        .bind(job.attempt as i32)
        .bind(job.completed_at)
        .bind(outcome)
        .bind(job.last_error.as_deref())
        .bind(job.version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM drainq_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            JobRow::from_row(&row)
                .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?
                .try_into()
        })
        .transpose()
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, status = %job.status, expected = ?expected),
        err
    )]
    async fn compare_and_set(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let result = Self::update_in(&mut tx, job, expected).await;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        result
    }

    #[instrument(
        skip(self, query),
        fields(owner = %query.owner, status = ?query.status, row_count = tracing::field::Empty),
        err
    )]
    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM drainq_jobs
            WHERE owner = $1
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY enqueued_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(query.owner.as_str())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query", e))?;

        let jobs = Self::decode_rows(rows)?;
        Span::current().record("row_count", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn list_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM drainq_jobs
            WHERE status IN ('done', 'dead')
              AND completed_at < $1
            ORDER BY completed_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_terminal_before", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self, writes), fields(batch_size = writes.len()), err)]
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<BatchResult, JobStoreError> {
        if writes.len() > self.batch_limit {
            return Err(JobStoreError::BatchTooLarge {
                size: writes.len(),
                limit: self.batch_limit,
            });
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut results = Vec::with_capacity(writes.len());
        for write in &writes {
            let outcome = match write {
                BatchWrite::Update { job, expected } => Self::update_in(&mut tx, job, *expected).await.map(|_| ()),
                BatchWrite::Delete { job_id, expected } => Self::delete_in(&mut tx, *job_id, *expected).await,
            };
            // A database-level failure aborts the transaction; nothing after it can land.
            if let Err(JobStoreError::Storage(msg)) = &outcome {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(JobStoreError::Storage(msg.clone()));
            }
            results.push(outcome);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(results)
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

fn encode_outcome(outcome: Option<&Outcome>) -> Result<Option<serde_json::Value>, JobStoreError> {
    outcome
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("failed to encode outcome: {e}")))
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => JobStoreError::Timeout {
            operation: "acquire_connection",
            millis: 0,
        },
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Raw row (decoded by column name).
#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    owner: String,
    text: String,
    fields: serde_json::Value,
    status: String,
    enqueued_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    attempt: i32,
    completed_at: Option<DateTime<Utc>>,
    outcome: Option<serde_json::Value>,
    last_error: Option<String>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            text: row.try_get("text")?,
            fields: row.try_get("fields")?,
            status: row.try_get("status")?,
            enqueued_at: row.try_get("enqueued_at")?,
            claimed_at: row.try_get("claimed_at")?,
            attempt: row.try_get("attempt")?,
            completed_at: row.try_get("completed_at")?,
            outcome: row.try_get("outcome")?,
            last_error: row.try_get("last_error")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            JobStoreError::Storage(format!("corrupt job row {}: {what}: {e}", row.id))
        };

        let owner = OwnerId::parse(row.owner.clone()).map_err(|e| corrupt("owner", &e))?;
        let fields: FieldSet = serde_json::from_value(row.fields.clone()).map_err(|e| corrupt("fields", &e))?;
        let status = row.status.parse::<JobStatus>().map_err(|e| corrupt("status", &e))?;
        let outcome = row
            .outcome
            .clone()
            .map(serde_json::from_value::<Outcome>)
            .transpose()
            .map_err(|e| corrupt("outcome", &e))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            owner,
            payload: JobPayload::new(row.text, fields),
            status,
            enqueued_at: row.enqueued_at,
            claimed_at: row.claimed_at,
            attempt: row.attempt.max(0) as u32,
            completed_at: row.completed_at,
            outcome,
            last_error: row.last_error,
            version: row.version.max(0) as u64,
        })
    }
}
