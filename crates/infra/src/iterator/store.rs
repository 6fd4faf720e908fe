//! Persistence boundary for iterators and their error rows.
//!
//! The engine never talks to a database directly. Everything it persists goes
//! through an [`IteratorTransaction`] opened from an [`IteratorStore`], so a
//! finish either lands completely or not at all.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use repoiter_core::{ErrorRowId, IteratorId, RepoId};

use super::types::{CounterDelta, IterationError, IteratorRecord, ProgressCounters};

/// Persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("iterator not found: {0}")]
    IteratorNotFound(IteratorId),
    #[error("error row not found: {0}")]
    ErrorRowNotFound(ErrorRowId),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Store of iterator rows and per-repo error rows.
#[async_trait]
pub trait IteratorStore: Send + Sync {
    type Tx: IteratorTransaction;

    /// Open a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Insert a new iterator row with zeroed progress.
    async fn create_iterator(
        &self,
        repos: &[RepoId],
        created_at: DateTime<Utc>,
    ) -> Result<IteratorId, StoreError>;

    async fn load_iterator_row(&self, id: IteratorId) -> Result<Option<IteratorRecord>, StoreError>;

    /// All error rows of an iterator, ordered by row id (insertion order).
    async fn load_error_rows(&self, id: IteratorId) -> Result<Vec<IterationError>, StoreError>;
}

/// Writes that must land atomically.
#[async_trait]
pub trait IteratorTransaction: Send {
    async fn stamp_started_at(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Apply `delta` and return the resulting counters.
    ///
    /// `percent_complete` is recomputed from the new success count, 0 when the
    /// iterator has no repos.
    async fn update_iterator_counters(
        &mut self,
        id: IteratorId,
        delta: CounterDelta,
    ) -> Result<ProgressCounters, StoreError>;

    /// Insert a row with `failure_count = 1`, or bump the count and append the
    /// message to an existing row.
    async fn upsert_error_row(
        &mut self,
        iterator_id: IteratorId,
        repo_id: RepoId,
        message: &str,
    ) -> Result<IterationError, StoreError>;

    async fn delete_error_row(&mut self, error_id: ErrorRowId) -> Result<(), StoreError>;

    /// Set `completed_at` and force `percent_complete` to 1.
    async fn mark_complete(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Zero all progress and delete every error row of the iterator.
    async fn restart(&mut self, id: IteratorId) -> Result<(), StoreError>;

    /// Persist every staged write. Dropping the transaction instead rolls it
    /// back.
    async fn commit(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> IteratorStore for Arc<S>
where
    S: IteratorStore + ?Sized,
{
    type Tx = S::Tx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }

    async fn create_iterator(
        &self,
        repos: &[RepoId],
        created_at: DateTime<Utc>,
    ) -> Result<IteratorId, StoreError> {
        (**self).create_iterator(repos, created_at).await
    }

    async fn load_iterator_row(&self, id: IteratorId) -> Result<Option<IteratorRecord>, StoreError> {
        (**self).load_iterator_row(id).await
    }

    async fn load_error_rows(&self, id: IteratorId) -> Result<Vec<IterationError>, StoreError> {
        (**self).load_error_rows(id).await
    }
}
