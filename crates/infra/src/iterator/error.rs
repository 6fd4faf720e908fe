//! Engine error.

use repoiter_core::{DomainError, RepoId};

use super::store::StoreError;

/// Error returned by [`PersistentRepoIterator`](super::PersistentRepoIterator)
/// operations.
///
/// Per-repo failures reported through finish are *not* errors at this level;
/// they go to the error ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IteratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("terminal hook failed for repo {repo_id}: {reason}")]
    TerminalHook { repo_id: RepoId, reason: String },
}

impl IteratorError {
    pub(crate) fn terminal_hook(repo_id: RepoId, err: anyhow::Error) -> Self {
        Self::TerminalHook {
            repo_id,
            reason: format!("{err:#}"),
        }
    }
}
