//! Postgres-backed job store.
//!
//! One row per job in `jobforge_jobs`. The pending index is the `pending`
//! flag plus a partial index on `(priority DESC, scheduled_time, id)`
//! restricted to pending rows, so a row and its index entry are always
//! written by the same statement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`. The `JobStore` trait is synchronous
//! and worker threads run outside any async context, so the store owns a
//! multi-threaded tokio runtime and drives each query to completion on it.

use std::sync::Arc;

use sqlx::postgres::{PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{Executor, FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::instrument;

use jobforge_core::{JobId, JobStatus, StoreError};

use super::job::{FieldUpdate, FieldValue, Job, JobField};
use super::store::{
    Expect, JobStats, JobStore, transitioned, validate_field_write, validate_transition,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobforge_jobs (
        id              TEXT PRIMARY KEY,
        type_name       TEXT NOT NULL,
        priority        BIGINT NOT NULL,
        scheduled_time  BIGINT NOT NULL CHECK (scheduled_time >= 0),
        freq            BIGINT NOT NULL DEFAULT 0 CHECK (freq >= 0),
        data            BYTEA NOT NULL,
        status          TEXT NOT NULL,
        retries_left    BIGINT NOT NULL CHECK (retries_left >= 0),
        last_error      TEXT,
        claim           TEXT,
        started         BIGINT,
        finished        BIGINT,
        pending         BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobforge_jobs_pending_rank
        ON jobforge_jobs (priority DESC, scheduled_time ASC, id COLLATE "C" ASC)
        WHERE pending
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobforge_jobs_status
        ON jobforge_jobs (status, scheduled_time)
    "#,
];

const SELECT_JOB: &str = r#"
    SELECT id, type_name, priority, scheduled_time, freq, data, status,
           retries_left, last_error, claim, started, finished
    FROM jobforge_jobs
"#;

/// Postgres job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Arc<Runtime>,
}

impl PostgresJobStore {
    /// Wrap an existing pool; queries are driven on `runtime`.
    pub fn new(pool: PgPool, runtime: Arc<Runtime>) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Connect with a dedicated runtime.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobforge-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::backend(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Arc::new(runtime)))
    }

    /// Create the table and indexes if they do not exist.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.runtime.block_on(self.apply_schema())
    }

    #[instrument(skip(self), err)]
    async fn apply_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.type_name), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobforge_jobs (
                id, type_name, priority, scheduled_time, freq, data, status,
                retries_left, last_error, claim, started, finished, pending
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.type_name)
        .bind(job.priority)
        .bind(job.time)
        .bind(job.freq)
        .bind(&job.data)
        .bind(job.status.as_str())
        .bind(i64::from(job.retries_left))
        .bind(&job.last_error)
        .bind(job.claim.map(|c| c.to_string()))
        .bind(job.started)
        .bind(job.finished)
        .bind(job.status == JobStatus::Queued)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn fetch(&self, id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("{SELECT_JOB} WHERE id = $1"))
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?
            .ok_or(StoreError::NotFound(id))?;
        decode_row(&row)
    }

    #[instrument(skip(self, value), fields(field = field.as_str()), err)]
    async fn update_field(
        &self,
        id: JobId,
        field: JobField,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        let result = write_field(&*self.pool, id, field, value).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, value), fields(field = field.as_str(), expected = %status), err)]
    async fn update_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        if job.status != status {
            return Err(StoreError::Conflict {
                id,
                actual: job.status,
            });
        }
        job.apply(field, value.clone())?;
        write_field(&mut *tx, id, field, value).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self, updates), fields(expected = %expect.status, new = %new), err)]
    async fn transition(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        let mut tx = self.begin().await?;
        let current = lock_job(&mut tx, id).await?;

        // Dropping the transaction on an early return rolls it back.
        let next = transitioned(&current, &expect, new, updates)?;
        write_row(&mut tx, &next).await?;

        commit(tx).await?;
        Ok(next)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    #[instrument(skip(self), err)]
    async fn eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobforge_jobs
            WHERE pending AND scheduled_time <= $1
            ORDER BY priority DESC, scheduled_time ASC, id COLLATE "C" ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_eligible", e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| StoreError::corrupt(format!("failed to read id: {e}")))?;
                id.parse::<JobId>()
                    .map_err(|e| StoreError::corrupt(format!("{e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn unindex(&self, id: JobId) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobforge_jobs SET pending = FALSE WHERE id = $1")
            .bind(id.to_string())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_from_index", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobforge_jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let current = lock_job(&mut tx, id).await?;
        if current.status == refused {
            return Err(StoreError::Conflict {
                id,
                actual: current.status,
            });
        }
        sqlx::query("DELETE FROM jobforge_jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        commit(tx).await
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"{SELECT_JOB} WHERE status = $1 ORDER BY scheduled_time ASC, id COLLATE "C" ASC LIMIT $2"#
        ))
        .bind(status.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobforge_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::corrupt(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| StoreError::corrupt(format!("failed to read count: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::corrupt(format!("{e}")))?;
            stats.record(status, usize::try_from(total).unwrap_or(0));
        }
        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.runtime.block_on(self.insert(job))
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.runtime.block_on(self.fetch(id))
    }

    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        validate_field_write(field, &value)?;
        self.runtime.block_on(self.update_field(id, field, value))
    }

    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        validate_field_write(field, &value)?;
        self.runtime
            .block_on(self.update_field_if(id, status, field, value))
    }

    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        validate_transition(&expect, new, updates)?;
        self.runtime.block_on(self.transition(id, expect, new, updates))
    }

    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        self.runtime.block_on(self.eligible(now, limit))
    }

    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError> {
        self.runtime.block_on(self.unindex(id))
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.runtime.block_on(self.remove(id))
    }

    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        self.runtime.block_on(self.remove_unless(id, refused))
    }

    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.runtime.block_on(self.list_by_status(status, limit))
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.runtime.block_on(self.count_by_status())
    }
}

/// Load and row-lock a job inside `tx`.
async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: JobId) -> Result<Job, StoreError> {
    let row = sqlx::query(&format!("{SELECT_JOB} WHERE id = $1 FOR UPDATE"))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or(StoreError::NotFound(id))?;
    decode_row(&row)
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Write one column. The `pending` flag is left alone, so field writes
/// never re-index a job.
async fn write_field<'c, E>(
    executor: E,
    id: JobId,
    field: JobField,
    value: FieldValue,
) -> Result<PgQueryResult, StoreError>
where
    E: Executor<'c, Database = Postgres>,
{
    let column = column(field);
    let sql = match &value {
        FieldValue::Null => format!("UPDATE jobforge_jobs SET {column} = NULL WHERE id = $1"),
        _ => format!("UPDATE jobforge_jobs SET {column} = $2 WHERE id = $1"),
    };
    let query = sqlx::query(&sql).bind(id.to_string());
    let query = match value {
        FieldValue::Null => query,
        FieldValue::Int(n) => query.bind(n),
        FieldValue::Text(s) => query.bind(s),
        FieldValue::Bytes(b) => query.bind(b),
    };
    query
        .execute(executor)
        .await
        .map_err(|e| map_sqlx_error("set_field", e))
}

/// Persist every mutable column of a locked row.
async fn write_row(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE jobforge_jobs SET
            type_name = $2, priority = $3, scheduled_time = $4, freq = $5, data = $6,
            status = $7, retries_left = $8, last_error = $9, claim = $10,
            started = $11, finished = $12, pending = $13
        WHERE id = $1
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.type_name)
    .bind(job.priority)
    .bind(job.time)
    .bind(job.freq)
    .bind(&job.data)
    .bind(job.status.as_str())
    .bind(i64::from(job.retries_left))
    .bind(&job.last_error)
    .bind(job.claim.map(|c| c.to_string()))
    .bind(job.started)
    .bind(job.finished)
    .bind(job.status == JobStatus::Queued)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

fn column(field: JobField) -> &'static str {
    match field {
        JobField::Time => "scheduled_time",
        other => other.as_str(),
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

struct JobRow {
    id: String,
    type_name: String,
    priority: i64,
    scheduled_time: i64,
    freq: i64,
    data: Vec<u8>,
    status: String,
    retries_left: i64,
    last_error: Option<String>,
    claim: Option<String>,
    started: Option<i64>,
    finished: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            type_name: row.try_get("type_name")?,
            priority: row.try_get("priority")?,
            scheduled_time: row.try_get("scheduled_time")?,
            freq: row.try_get("freq")?,
            data: row.try_get("data")?,
            status: row.try_get("status")?,
            retries_left: row.try_get("retries_left")?,
            last_error: row.try_get("last_error")?,
            claim: row.try_get("claim")?,
            started: row.try_get("started")?,
            finished: row.try_get("finished")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id: JobId = row
            .id
            .parse::<JobId>()
            .map_err(|e| StoreError::corrupt(format!("{e}")))?;
        let mut fields = vec![
            (JobField::TypeName, FieldValue::Text(row.type_name)),
            (JobField::Priority, FieldValue::Int(row.priority)),
            (JobField::Time, FieldValue::Int(row.scheduled_time)),
            (JobField::Freq, FieldValue::Int(row.freq)),
            (JobField::Data, FieldValue::Bytes(row.data)),
            (JobField::Status, FieldValue::Text(row.status)),
            (JobField::RetriesLeft, FieldValue::Int(row.retries_left)),
        ];
        let optional = [
            (JobField::LastError, row.last_error.map(FieldValue::Text)),
            (JobField::Claim, row.claim.map(FieldValue::Text)),
            (JobField::Started, row.started.map(FieldValue::Int)),
            (JobField::Finished, row.finished.map(FieldValue::Int)),
        ];
        fields.extend(
            optional
                .into_iter()
                .map(|(field, value)| (field, value.unwrap_or(FieldValue::Null))),
        );
        Job::from_fields(id, fields).map_err(|e| match e {
            StoreError::InvalidField(msg) => StoreError::Corrupt(msg),
            other => other,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::corrupt(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code == "23505"),
        _ => false,
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::backend(format!("connection pool closed in {operation}"))
        }
        other => StoreError::backend(format!("sqlx error in {operation}: {other}")),
    }
}
