//! Retry pass over failing repos.
//!
//! A pass is a snapshot of the active error entries taken when the previous
//! pass ran dry. Repos that fail again during a pass are picked up by the
//! next one, not the current one.

use tracing::debug;

use super::engine::{PersistentRepoIterator, escalate_with_hook};
use super::error::IteratorError;
use super::store::{IteratorStore, IteratorTransaction};
use super::types::{Checkout, IterationConfig, Pass};

impl<S: IteratorStore> PersistentRepoIterator<S> {
    /// Check out the next failing repo for another attempt.
    ///
    /// Returns `Ok(None)` once the current pass is exhausted; the following
    /// call starts a fresh pass. Entries found at or past the failure ceiling
    /// are moved to terminal instead of being handed out. If `on_terminal` is
    /// set it runs in its own transaction; when it fails the error is
    /// returned, nothing is committed, and the same entry is examined again
    /// on the next call.
    ///
    /// Only the most recent retry checkout can be finished.
    pub async fn next_retry(
        &mut self,
        config: &IterationConfig<S::Tx>,
    ) -> Result<Option<Checkout>, IteratorError> {
        if self.retry.repos.is_empty() {
            self.rebuild_retry_pass(config);
        }
        self.retry.outstanding = None;

        loop {
            let Some(&repo_id) = self.retry.repos.get(self.retry.cursor) else {
                self.retry.end();
                return Ok(None);
            };

            let exhausted = self
                .ledger
                .active(repo_id)
                .map(|entry| config.is_exhausted(entry.failure_count));
            match exhausted {
                Some(true) if config.on_terminal.is_some() => {
                    let mut ledger = self.ledger.clone();
                    let mut tx = self.store.begin().await?;
                    escalate_with_hook(&mut tx, &mut ledger, repo_id, config).await?;
                    tx.commit().await?;
                    self.ledger = ledger;
                }
                Some(true) => {
                    self.ledger.escalate(repo_id);
                }
                Some(false) => {
                    self.retry.cursor += 1;
                    let ticket = self.retry.issue();
                    return Ok(Some(Checkout {
                        repos: vec![repo_id],
                        started_at: self.clock.now(),
                        pass: Pass::Retry,
                        position: ticket,
                    }));
                }
                // resolved or escalated since the pass was built
                None => {}
            }
            self.retry.cursor += 1;
        }
    }

    /// Snapshot the retryable entries. Entries already at the ceiling go
    /// straight to terminal without firing the hook.
    fn rebuild_retry_pass(&mut self, config: &IterationConfig<S::Tx>) {
        let mut repos = Vec::new();
        for repo_id in self.ledger.active_repo_ids() {
            let exhausted = self
                .ledger
                .active(repo_id)
                .is_some_and(|entry| config.is_exhausted(entry.failure_count));
            if exhausted {
                self.ledger.escalate(repo_id);
            } else {
                repos.push(repo_id);
            }
        }
        debug!(
            iterator_id = %self.record.id,
            retryable = repos.len(),
            terminal = self.ledger.terminal_entries().len(),
            "built retry pass"
        );
        self.retry.repos = repos;
        self.retry.cursor = 0;
    }
}
