//! In-memory mirror of the error table.
//!
//! Two insertion-ordered collections: repos that are still retryable (`active`)
//! and repos that crossed the failure ceiling (`terminal`). Iteration order is
//! the order in which a repo first failed, so retry passes are reproducible.

use std::collections::HashMap;

use repoiter_core::RepoId;

use super::types::IterationError;

#[derive(Debug, Clone, Default, PartialEq)]
struct OrderedErrors {
    order: Vec<RepoId>,
    entries: HashMap<RepoId, IterationError>,
}

impl OrderedErrors {
    fn get(&self, repo_id: RepoId) -> Option<&IterationError> {
        self.entries.get(&repo_id)
    }

    fn contains(&self, repo_id: RepoId) -> bool {
        self.entries.contains_key(&repo_id)
    }

    /// Replace in place, or append at the end.
    fn upsert(&mut self, error: IterationError) {
        let repo_id = error.repo_id;
        if self.entries.insert(repo_id, error).is_none() {
            self.order.push(repo_id);
        }
    }

    fn remove(&mut self, repo_id: RepoId) -> Option<IterationError> {
        let removed = self.entries.remove(&repo_id)?;
        self.order.retain(|id| *id != repo_id);
        Some(removed)
    }

    fn iter(&self) -> impl Iterator<Item = &IterationError> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Per-repo failure state of one iterator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorLedger {
    active: OrderedErrors,
    terminal: OrderedErrors,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows. Every row starts out active.
    pub fn from_rows(rows: impl IntoIterator<Item = IterationError>) -> Self {
        let mut ledger = Self::new();
        for row in rows {
            ledger.record(row);
        }
        ledger
    }

    /// Store the latest version of a failing repo's row, in whichever
    /// collection currently holds it (active for new repos).
    pub fn record(&mut self, error: IterationError) {
        if self.terminal.contains(error.repo_id) {
            self.terminal.upsert(error);
        } else {
            self.active.upsert(error);
        }
    }

    /// Drop a repo that is no longer failing.
    pub fn resolve(&mut self, repo_id: RepoId) -> Option<IterationError> {
        self.active
            .remove(repo_id)
            .or_else(|| self.terminal.remove(repo_id))
    }

    /// Move a repo from active to terminal. No-op if it is not active.
    pub fn escalate(&mut self, repo_id: RepoId) -> bool {
        match self.active.remove(repo_id) {
            Some(error) => {
                self.terminal.upsert(error);
                true
            }
            None => false,
        }
    }

    pub fn active(&self, repo_id: RepoId) -> Option<&IterationError> {
        self.active.get(repo_id)
    }

    pub fn terminal(&self, repo_id: RepoId) -> Option<&IterationError> {
        self.terminal.get(repo_id)
    }

    /// Active or terminal entry for a repo.
    pub fn get(&self, repo_id: RepoId) -> Option<&IterationError> {
        self.active(repo_id).or_else(|| self.terminal(repo_id))
    }

    pub fn is_terminal(&self, repo_id: RepoId) -> bool {
        self.terminal.contains(repo_id)
    }

    pub fn has_active(&self) -> bool {
        self.active.len() > 0
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal.len() > 0
    }

    /// Number of repos still eligible for retry.
    pub fn errored_repos(&self) -> usize {
        self.active.len()
    }

    /// Sum of failure counts over both collections.
    pub fn total_failures(&self) -> u64 {
        self.active
            .iter()
            .chain(self.terminal.iter())
            .map(|e| u64::from(e.failure_count))
            .sum()
    }

    /// Active repos in first-failure order.
    pub fn active_repo_ids(&self) -> Vec<RepoId> {
        self.active.order.clone()
    }

    pub fn active_entries(&self) -> Vec<IterationError> {
        self.active.iter().cloned().collect()
    }

    pub fn terminal_entries(&self) -> Vec<IterationError> {
        self.terminal.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.terminal.clear();
    }
}
