//! In-memory iterator store.
//!
//! Intended for tests/dev. A transaction holds the store lock for its whole
//! lifetime and mutates a staged copy; commit swaps the copy in, drop throws it
//! away.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use repoiter_core::{ErrorRowId, IteratorId, RepoId};

use super::store::{IteratorStore, IteratorTransaction, StoreError};
use super::types::{
    percent_complete, CounterDelta, IterationError, IteratorRecord, ProgressCounters,
};

/// Operations that can be armed to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    UpdateCounters,
    UpsertErrorRow,
    DeleteErrorRow,
    Commit,
}

#[derive(Debug, Clone)]
struct ErrorRow {
    iterator_id: IteratorId,
    error: IterationError,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    last_iterator_id: i64,
    last_error_id: i64,
    iterators: BTreeMap<IteratorId, IteratorRecord>,
    errors: BTreeMap<ErrorRowId, ErrorRow>,
}

impl MemState {
    fn iterator_mut(&mut self, id: IteratorId) -> Result<&mut IteratorRecord, StoreError> {
        self.iterators
            .get_mut(&id)
            .ok_or(StoreError::IteratorNotFound(id))
    }
}

#[derive(Debug, Default)]
struct Faults {
    armed: Mutex<Vec<FailPoint>>,
}

impl Faults {
    fn arm(&self, point: FailPoint) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.push(point);
        }
    }

    fn trip(&self, point: FailPoint) -> Result<(), StoreError> {
        let mut armed = self
            .armed
            .lock()
            .map_err(|_| StoreError::Storage("fault injector lock poisoned".to_string()))?;
        match armed.iter().position(|p| *p == point) {
            Some(idx) => {
                armed.remove(idx);
                Err(StoreError::Storage(format!("injected failure at {point:?}")))
            }
            None => Ok(()),
        }
    }
}

/// In-memory iterator store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIteratorStore {
    state: Arc<tokio::sync::Mutex<MemState>>,
    faults: Arc<Faults>,
}

impl InMemoryIteratorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `point` operation fail with a storage error.
    pub fn fail_next(&self, point: FailPoint) {
        self.faults.arm(point);
    }

    /// Number of error rows across all iterators.
    pub async fn error_row_count(&self) -> usize {
        self.state.lock().await.errors.len()
    }
}

#[async_trait]
impl IteratorStore for InMemoryIteratorStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.faults.trip(FailPoint::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTransaction {
            guard,
            staged,
            faults: self.faults.clone(),
        })
    }

    async fn create_iterator(
        &self,
        repos: &[RepoId],
        created_at: DateTime<Utc>,
    ) -> Result<IteratorId, StoreError> {
        let mut state = self.state.lock().await;
        state.last_iterator_id += 1;
        let id = IteratorId::new(state.last_iterator_id);
        state
            .iterators
            .insert(id, IteratorRecord::new(id, repos.to_vec(), created_at));
        Ok(id)
    }

    async fn load_iterator_row(&self, id: IteratorId) -> Result<Option<IteratorRecord>, StoreError> {
        Ok(self.state.lock().await.iterators.get(&id).cloned())
    }

    async fn load_error_rows(&self, id: IteratorId) -> Result<Vec<IterationError>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .errors
            .values()
            .filter(|row| row.iterator_id == id)
            .map(|row| row.error.clone())
            .collect())
    }
}

/// Transaction over [`InMemoryIteratorStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<MemState>,
    staged: MemState,
    faults: Arc<Faults>,
}

#[async_trait]
impl IteratorTransaction for InMemoryTransaction {
    async fn stamp_started_at(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.staged.iterator_mut(id)?.started_at = Some(at);
        Ok(())
    }

    async fn update_iterator_counters(
        &mut self,
        id: IteratorId,
        delta: CounterDelta,
    ) -> Result<ProgressCounters, StoreError> {
        self.faults.trip(FailPoint::UpdateCounters)?;
        let row = self.staged.iterator_mut(id)?;
        row.success_count += delta.success;
        row.cursor += delta.cursor;
        row.runtime_duration += delta.runtime;
        row.percent_complete = percent_complete(row.success_count, row.total_count);
        Ok(ProgressCounters {
            percent_complete: row.percent_complete,
            success_count: row.success_count,
            cursor: row.cursor,
            runtime_duration: row.runtime_duration,
        })
    }

    async fn upsert_error_row(
        &mut self,
        iterator_id: IteratorId,
        repo_id: RepoId,
        message: &str,
    ) -> Result<IterationError, StoreError> {
        self.faults.trip(FailPoint::UpsertErrorRow)?;
        if !self.staged.iterators.contains_key(&iterator_id) {
            return Err(StoreError::IteratorNotFound(iterator_id));
        }

        let existing = self
            .staged
            .errors
            .values_mut()
            .find(|row| row.iterator_id == iterator_id && row.error.repo_id == repo_id);
        if let Some(row) = existing {
            row.error.failure_count += 1;
            row.error.error_messages.push(message.to_string());
            return Ok(row.error.clone());
        }

        self.staged.last_error_id += 1;
        let error = IterationError {
            id: ErrorRowId::new(self.staged.last_error_id),
            repo_id,
            failure_count: 1,
            error_messages: vec![message.to_string()],
        };
        self.staged.errors.insert(
            error.id,
            ErrorRow {
                iterator_id,
                error: error.clone(),
            },
        );
        Ok(error)
    }

    async fn delete_error_row(&mut self, error_id: ErrorRowId) -> Result<(), StoreError> {
        self.faults.trip(FailPoint::DeleteErrorRow)?;
        self.staged
            .errors
            .remove(&error_id)
            .map(|_| ())
            .ok_or(StoreError::ErrorRowNotFound(error_id))
    }

    async fn mark_complete(&mut self, id: IteratorId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let row = self.staged.iterator_mut(id)?;
        row.completed_at = Some(at);
        row.percent_complete = 1.0;
        Ok(())
    }

    async fn restart(&mut self, id: IteratorId) -> Result<(), StoreError> {
        self.staged.iterator_mut(id)?.reset_progress();
        self.staged.errors.retain(|_, row| row.iterator_id != id);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.faults.trip(FailPoint::Commit)?;
        *self.guard = self.staged;
        Ok(())
    }
}
