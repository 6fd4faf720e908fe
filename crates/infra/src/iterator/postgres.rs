//! Postgres-backed iterator store.
//!
//! ## Schema
//!
//! `migrations/0001_repo_iterator.sql`, applied with
//! [`PostgresIteratorStore::ensure_schema`]. One row per iterator in
//! `repo_iterator`, one row per failing repo in `repo_iterator_errors`.
//! `runtime_duration` is kept in nanoseconds.
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | StoreError |
//! |------------|------|------------|
//! | Database (foreign key violation) | `23503` | `Storage` (iterator row gone) |
//! | Database (check violation) | `23514` | `CorruptRow` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / RowNotFound / other | N/A | `Storage` |
//!
//! Column values that do not fit the in-memory types are reported as
//! `StoreError::CorruptRow`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use repoiter_core::{ErrorRowId, IteratorId, RepoId};

use super::store::{IteratorStore, IteratorTransaction, StoreError};
use super::types::{CounterDelta, IterationError, IteratorRecord, ProgressCounters};

const SCHEMA: &str = include_str!("../../migrations/0001_repo_iterator.sql");

/// Iterator store over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresIteratorStore {
    pool: Arc<PgPool>,
}

impl PostgresIteratorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the iterator tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl IteratorStore for PostgresIteratorStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction { tx })
    }

    #[instrument(skip(self, repos), fields(total_count = repos.len()), err)]
    async fn create_iterator(
        &self,
        repos: &[RepoId],
        created_at: DateTime<Utc>,
    ) -> Result<IteratorId, StoreError> {
        let repo_ids: Vec<i32> = repos.iter().map(|id| id.get()).collect();
        let row = sqlx::query(
            r#"
            INSERT INTO repo_iterator (created_at, total_count, repos)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(created_at)
        .bind(to_db_count(repos.len())?)
        .bind(&repo_ids)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_iterator", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::CorruptRow(format!("failed to read iterator id: {e}")))?;
        Ok(IteratorId::new(id))
    }

    #[instrument(skip(self), fields(iterator_id = %id), err)]
    async fn load_iterator_row(&self, id: IteratorId) -> Result<Option<IteratorRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                repos,
                total_count,
                repo_cursor,
                success_count,
                percent_complete,
                created_at,
                started_at,
                completed_at,
                runtime_duration
            FROM repo_iterator
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_iterator_row", e))?;

        match row {
            Some(row) => {
                let row = IteratorRow::from_row(&row).map_err(|e| {
                    StoreError::CorruptRow(format!("failed to decode iterator row: {e}"))
                })?;
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(iterator_id = %id), err)]
    async fn load_error_rows(&self, id: IteratorId) -> Result<Vec<IterationError>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, repo_id, failure_count, error_message
            FROM repo_iterator_errors
            WHERE repo_iterator_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_error_rows", e))?;

        rows.iter().map(decode_error_row).collect()
    }
}

/// Open transaction on the iterator tables. Rolled back on drop.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    /// Connection of the open transaction. Terminal hooks write through it
    /// so their rows commit or roll back with the finish.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

#[async_trait]
impl IteratorTransaction for PostgresTransaction {
    async fn stamp_started_at(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE repo_iterator SET started_at = $2 WHERE id = $1")
            .bind(id.get())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("stamp_started_at", e))?;
        expect_iterator_row(result.rows_affected(), id)
    }

    async fn update_iterator_counters(
        &mut self,
        id: IteratorId,
        delta: CounterDelta,
    ) -> Result<ProgressCounters, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE repo_iterator
            SET
                success_count = success_count + $2,
                repo_cursor = repo_cursor + $3,
                runtime_duration = runtime_duration + $4,
                percent_complete = CASE
                    WHEN total_count = 0 THEN 0
                    ELSE (success_count + $2)::DOUBLE PRECISION / total_count
                END
            WHERE id = $1
            RETURNING percent_complete, success_count, repo_cursor, runtime_duration
            "#,
        )
        .bind(id.get())
        .bind(to_db_count(delta.success)?)
        .bind(to_db_count(delta.cursor)?)
        .bind(to_nanos(delta.runtime)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_iterator_counters", e))?
        .ok_or(StoreError::IteratorNotFound(id))?;

        let counters = CountersRow::from_row(&row)
            .map_err(|e| StoreError::CorruptRow(format!("failed to decode counters: {e}")))?;
        Ok(ProgressCounters {
            percent_complete: counters.percent_complete,
            success_count: from_db_count("success_count", counters.success_count)?,
            cursor: from_db_count("repo_cursor", counters.repo_cursor)?,
            runtime_duration: from_nanos(counters.runtime_duration)?,
        })
    }

    async fn upsert_error_row(
        &mut self,
        iterator_id: IteratorId,
        repo_id: RepoId,
        message: &str,
    ) -> Result<IterationError, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO repo_iterator_errors (repo_iterator_id, repo_id, error_message, failure_count)
            VALUES ($1, $2, ARRAY[$3::TEXT], 1)
            ON CONFLICT (repo_iterator_id, repo_id) DO UPDATE
            SET
                failure_count = repo_iterator_errors.failure_count + 1,
                error_message = array_append(repo_iterator_errors.error_message, $3::TEXT)
            RETURNING id, repo_id, failure_count, error_message
            "#,
        )
        .bind(iterator_id.get())
        .bind(repo_id.get())
        .bind(message)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_error_row", e))?;

        decode_error_row(&row)
    }

    async fn delete_error_row(&mut self, error_id: ErrorRowId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM repo_iterator_errors WHERE id = $1")
            .bind(error_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_error_row", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ErrorRowNotFound(error_id));
        }
        Ok(())
    }

    async fn mark_complete(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE repo_iterator SET completed_at = $2, percent_complete = 1 WHERE id = $1",
        )
        .bind(id.get())
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_complete", e))?;
        expect_iterator_row(result.rows_affected(), id)
    }

    async fn restart(&mut self, id: IteratorId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE repo_iterator
            SET
                started_at = NULL,
                completed_at = NULL,
                runtime_duration = 0,
                percent_complete = 0,
                success_count = 0,
                repo_cursor = 0
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("restart", e))?;
        expect_iterator_row(result.rows_affected(), id)?;

        sqlx::query("DELETE FROM repo_iterator_errors WHERE repo_iterator_id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("restart_errors", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn expect_iterator_row(rows_affected: u64, id: IteratorId) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::IteratorNotFound(id))
    } else {
        Ok(())
    }
}

fn decode_error_row(row: &sqlx::postgres::PgRow) -> Result<IterationError, StoreError> {
    ErrorRow::from_row(row)
        .map_err(|e| StoreError::CorruptRow(format!("failed to decode error row: {e}")))?
        .try_into()
}

/// Raw `repo_iterator` row.
#[derive(Debug)]
struct IteratorRow {
    id: i64,
    repos: Vec<i32>,
    total_count: i32,
    repo_cursor: i32,
    success_count: i32,
    percent_complete: f64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    runtime_duration: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for IteratorRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(IteratorRow {
            id: row.try_get("id")?,
            repos: row.try_get("repos")?,
            total_count: row.try_get("total_count")?,
            repo_cursor: row.try_get("repo_cursor")?,
            success_count: row.try_get("success_count")?,
            percent_complete: row.try_get("percent_complete")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            runtime_duration: row.try_get("runtime_duration")?,
        })
    }
}

impl TryFrom<IteratorRow> for IteratorRecord {
    type Error = StoreError;

    fn try_from(row: IteratorRow) -> Result<Self, Self::Error> {
        Ok(IteratorRecord {
            id: IteratorId::new(row.id),
            repos: row.repos.into_iter().map(RepoId::new).collect(),
            total_count: from_db_count("total_count", row.total_count)?,
            cursor: from_db_count("repo_cursor", row.repo_cursor)?,
            success_count: from_db_count("success_count", row.success_count)?,
            percent_complete: row.percent_complete,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            runtime_duration: from_nanos(row.runtime_duration)?,
        })
    }
}

/// Columns returned by the counter update.
#[derive(Debug)]
struct CountersRow {
    percent_complete: f64,
    success_count: i32,
    repo_cursor: i32,
    runtime_duration: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CountersRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CountersRow {
            percent_complete: row.try_get("percent_complete")?,
            success_count: row.try_get("success_count")?,
            repo_cursor: row.try_get("repo_cursor")?,
            runtime_duration: row.try_get("runtime_duration")?,
        })
    }
}

/// Raw `repo_iterator_errors` row.
#[derive(Debug)]
struct ErrorRow {
    id: i64,
    repo_id: i32,
    failure_count: i32,
    error_message: Vec<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ErrorRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ErrorRow {
            id: row.try_get("id")?,
            repo_id: row.try_get("repo_id")?,
            failure_count: row.try_get("failure_count")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<ErrorRow> for IterationError {
    type Error = StoreError;

    fn try_from(row: ErrorRow) -> Result<Self, Self::Error> {
        let failure_count = u32::try_from(row.failure_count).map_err(|_| {
            StoreError::CorruptRow(format!(
                "error row {} has negative failure_count {}",
                row.id, row.failure_count
            ))
        })?;
        Ok(IterationError {
            id: ErrorRowId::new(row.id),
            repo_id: RepoId::new(row.repo_id),
            failure_count,
            error_messages: row.error_message,
        })
    }
}

fn to_db_count(value: usize) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Storage(format!("count {value} does not fit an INT column")))
}

fn from_db_count(column: &str, value: i32) -> Result<usize, StoreError> {
    usize::try_from(value)
        .map_err(|_| StoreError::CorruptRow(format!("{column} is negative: {value}")))
}

fn to_nanos(duration: Duration) -> Result<i64, StoreError> {
    i64::try_from(duration.as_nanos())
        .map_err(|_| StoreError::Storage(format!("duration {duration:?} overflows BIGINT nanoseconds")))
}

fn from_nanos(nanos: i64) -> Result<Duration, StoreError> {
    u64::try_from(nanos)
        .map(Duration::from_nanos)
        .map_err(|_| StoreError::CorruptRow(format!("runtime_duration is negative: {nanos}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // check constraint violation (cursor past total_count)
                Some("23514") => StoreError::CorruptRow(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
