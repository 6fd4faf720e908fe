//! The persistent repo iterator.
//!
//! Callers alternate between a checkout (`next`, `next_page`, `next_retry`) and
//! a finish. Checkouts never change state; a finish persists every effect of
//! the reported outcomes in one transaction and only then updates the cached
//! record and ledger. A crash between the two leaves the cursor where it was,
//! so the same repos are handed out again after `load` (at-least-once).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use repoiter_core::{Clock, DomainError, IteratorId, RepoId, SystemClock};

use super::error::IteratorError;
use super::ledger::ErrorLedger;
use super::store::{IteratorStore, IteratorTransaction};
use super::types::{
    Checkout, CounterDelta, IterationConfig, IterationError, IteratorRecord, Pass,
};

/// Ephemeral snapshot of retryable repos and a cursor into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct RetryPass {
    pub(super) repos: Vec<RepoId>,
    pub(super) cursor: usize,
    /// Ticket of the retry checkout awaiting a finish, if any.
    pub(super) outstanding: Option<usize>,
    /// Last ticket handed out. Never reset, so tickets stay unique for the
    /// lifetime of the iterator value.
    pub(super) tickets: usize,
}

impl RetryPass {
    /// Issue a ticket for a new retry checkout, superseding any earlier one.
    pub(super) fn issue(&mut self) -> usize {
        self.tickets += 1;
        self.outstanding = Some(self.tickets);
        self.tickets
    }

    /// Drop the snapshot and any outstanding checkout.
    pub(super) fn end(&mut self) {
        self.repos.clear();
        self.cursor = 0;
        self.outstanding = None;
    }
}

/// Durable, resumable walk over a fixed list of repositories.
///
/// Exactly one consumer may drive a given iterator id at a time; nothing here
/// locks against a second one.
#[derive(Debug)]
pub struct PersistentRepoIterator<S> {
    pub(super) store: S,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) record: IteratorRecord,
    pub(super) ledger: ErrorLedger,
    pub(super) retry: RetryPass,
}

impl<S: IteratorStore> PersistentRepoIterator<S> {
    /// Persist a new iterator over `repos` and load it back.
    pub async fn create(store: S, repos: Vec<RepoId>) -> Result<Self, IteratorError> {
        Self::create_with_clock(store, Arc::new(SystemClock), repos).await
    }

    #[instrument(skip_all, fields(total_count = repos.len()), err)]
    pub async fn create_with_clock(
        store: S,
        clock: Arc<dyn Clock>,
        repos: Vec<RepoId>,
    ) -> Result<Self, IteratorError> {
        let id = store.create_iterator(&repos, clock.now()).await?;
        info!(iterator_id = %id, total_count = repos.len(), "created repo iterator");
        Self::load_with_clock(store, id, clock).await
    }

    pub async fn load(store: S, id: IteratorId) -> Result<Self, IteratorError> {
        Self::load_with_clock(store, id, Arc::new(SystemClock)).await
    }

    /// Rebuild an iterator from its row and error rows.
    ///
    /// Fails with `DomainError::InvalidState` if the row is inconsistent
    /// (cursor past the end of the repo list).
    #[instrument(skip_all, fields(iterator_id = %id), err)]
    pub async fn load_with_clock(
        store: S,
        id: IteratorId,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IteratorError> {
        let record = store
            .load_iterator_row(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("iterator {id}")))?;
        record.validate()?;

        let rows = store.load_error_rows(id).await?;
        debug!(cursor = record.cursor, errors = rows.len(), "loaded repo iterator");

        Ok(Self {
            store,
            clock,
            record,
            ledger: ErrorLedger::from_rows(rows),
            retry: RetryPass::default(),
        })
    }

    /// Check out the repo under the cursor, or `None` when the main pass is
    /// over (cursor at the end, or force-completed).
    pub fn next(&self) -> Option<Checkout> {
        self.next_page(1)
    }

    /// Check out up to `page_size` contiguous repos starting at the cursor.
    /// A `page_size` of 0 is treated as 1.
    pub fn next_page(&self, page_size: usize) -> Option<Checkout> {
        if !self.has_more() {
            return None;
        }
        let start = self.record.cursor;
        let end = start
            .saturating_add(page_size.max(1))
            .min(self.record.total_count);
        let repos = self.record.repos.get(start..end)?.to_vec();

        debug!(
            iterator_id = %self.record.id,
            cursor = start,
            count = repos.len(),
            "checked out repos"
        );
        Some(Checkout {
            repos,
            started_at: self.clock.now(),
            pass: Pass::Main,
            position: start,
        })
    }

    /// Report a single outcome for every repo in `checkout`.
    pub async fn finish(
        &mut self,
        checkout: Checkout,
        outcome: anyhow::Result<()>,
        config: &IterationConfig<S::Tx>,
    ) -> Result<(), IteratorError> {
        let message = outcome.err().map(|err| format!("{err:#}"));
        let outcomes = checkout
            .repos
            .iter()
            .map(|repo_id| (*repo_id, message.clone()))
            .collect();
        self.commit_outcomes(checkout, outcomes, config).await
    }

    /// Report per-repo failures for a page; repos without an entry succeeded.
    pub async fn finish_page(
        &mut self,
        checkout: Checkout,
        failures: HashMap<RepoId, anyhow::Error>,
        config: &IterationConfig<S::Tx>,
    ) -> Result<(), IteratorError> {
        for repo_id in failures.keys().filter(|id| !checkout.repos.contains(*id)) {
            warn!(
                iterator_id = %self.record.id,
                repo_id = %repo_id,
                "ignoring outcome for repo outside the checkout"
            );
        }
        let outcomes = checkout
            .repos
            .iter()
            .map(|repo_id| (*repo_id, failures.get(repo_id).map(|err| format!("{err:#}"))))
            .collect();
        self.commit_outcomes(checkout, outcomes, config).await
    }

    /// The finish transaction shared by every pass.
    #[instrument(
        skip_all,
        fields(
            iterator_id = %self.record.id,
            pass = ?checkout.pass,
            items = checkout.repos.len()
        ),
        err
    )]
    async fn commit_outcomes(
        &mut self,
        checkout: Checkout,
        outcomes: Vec<(RepoId, Option<String>)>,
        config: &IterationConfig<S::Tx>,
    ) -> Result<(), IteratorError> {
        let is_retry = checkout.pass == Pass::Retry;
        if is_retry {
            self.check_retry_checkout(&checkout)?;
        } else {
            self.check_main_checkout(&checkout)?;
        }

        let elapsed = (self.clock.now() - checkout.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let item_count = outcomes.len();
        let failed_count = outcomes.iter().filter(|(_, failure)| failure.is_some()).count();
        let delta = CounterDelta {
            success: item_count.saturating_sub(failed_count),
            cursor: if is_retry { 0 } else { item_count },
            runtime: elapsed,
        };

        let id = self.record.id;
        let mut record = self.record.clone();
        let mut ledger = self.ledger.clone();

        let mut tx = self.store.begin().await?;
        if record.started_at.is_none() {
            tx.stamp_started_at(id, checkout.started_at).await?;
            record.started_at = Some(checkout.started_at);
        }

        let counters = tx.update_iterator_counters(id, delta).await?;
        record.apply_counters(counters);

        for (repo_id, failure) in outcomes {
            match failure {
                Some(message) => {
                    let row = tx.upsert_error_row(id, repo_id, &message).await?;
                    let failure_count = row.failure_count;
                    ledger.record(row);
                    if config.is_exhausted(failure_count) {
                        escalate_with_hook(&mut tx, &mut ledger, repo_id, config).await?;
                    }
                }
                None if is_retry => {
                    if let Some(resolved) = ledger.resolve(repo_id) {
                        tx.delete_error_row(resolved.id).await?;
                    }
                }
                None => {}
            }
        }

        tx.commit().await?;

        debug!(
            cursor = record.cursor,
            success_count = record.success_count,
            failed = failed_count,
            "finish committed"
        );
        self.record = record;
        self.ledger = ledger;
        if is_retry {
            self.retry.outstanding = None;
        }
        Ok(())
    }

    fn check_main_checkout(&self, checkout: &Checkout) -> Result<(), DomainError> {
        let start = checkout.position;
        let end = start + checkout.repos.len();
        if checkout.repos.is_empty() {
            return Err(DomainError::invariant("empty checkout"));
        }
        if start != self.record.cursor {
            return Err(DomainError::invariant(format!(
                "stale checkout at position {start}; cursor is at {}",
                self.record.cursor
            )));
        }
        if end > self.record.total_count {
            return Err(DomainError::invariant(format!(
                "finishing {} repos at {start} would move the cursor past {}",
                checkout.repos.len(),
                self.record.total_count
            )));
        }
        match self.record.repos.get(start..end) {
            Some(expected) if expected == checkout.repos.as_slice() => Ok(()),
            _ => Err(DomainError::invariant(format!(
                "checkout at position {start} does not match the iterator's repos"
            ))),
        }
    }

    fn check_retry_checkout(&self, checkout: &Checkout) -> Result<(), DomainError> {
        if checkout.repos.is_empty() {
            return Err(DomainError::invariant("empty checkout"));
        }
        if self.retry.outstanding != Some(checkout.position) {
            return Err(DomainError::invariant(format!(
                "stale retry checkout {}; outstanding is {:?}",
                checkout.position, self.retry.outstanding
            )));
        }
        match checkout.repos.iter().find(|id| self.ledger.get(**id).is_none()) {
            Some(repo_id) => Err(DomainError::invariant(format!(
                "retry checkout for repo {repo_id} which is no longer failing"
            ))),
            None => Ok(()),
        }
    }

    /// Stamp `completed_at` and force progress to 100%, whatever the cursor.
    #[instrument(skip_all, fields(iterator_id = %self.record.id), err)]
    pub async fn mark_complete(&mut self) -> Result<(), IteratorError> {
        let at = self.clock.now();
        let mut tx = self.store.begin().await?;
        tx.mark_complete(self.record.id, at).await?;
        tx.commit().await?;

        self.record.completed_at = Some(at);
        self.record.percent_complete = 1.0;
        info!(cursor = self.record.cursor, "repo iterator marked complete");
        Ok(())
    }

    /// Zero all progress and drop every error row. Identity and repos stay.
    #[instrument(skip_all, fields(iterator_id = %self.record.id), err)]
    pub async fn restart(&mut self) -> Result<(), IteratorError> {
        let mut tx = self.store.begin().await?;
        tx.restart(self.record.id).await?;
        tx.commit().await?;

        self.record.reset_progress();
        self.ledger.clear();
        self.retry.end();
        info!("repo iterator restarted");
        Ok(())
    }
}

/// Fire the hook inside `tx` and move `repo_id` to terminal. Without a hook
/// the repo stays active until the next retry pass sweeps it.
pub(super) async fn escalate_with_hook<T: IteratorTransaction>(
    tx: &mut T,
    ledger: &mut ErrorLedger,
    repo_id: RepoId,
    config: &IterationConfig<T>,
) -> Result<(), IteratorError> {
    let Some(hook) = &config.on_terminal else {
        return Ok(());
    };
    let Some(entry) = ledger.active(repo_id).cloned() else {
        return Ok(());
    };
    hook.on_terminal(tx, repo_id, &entry)
        .await
        .map_err(|err| IteratorError::terminal_hook(repo_id, err))?;
    warn!(
        repo_id = %repo_id,
        failure_count = entry.failure_count,
        "repo exceeded max failures; no further retries"
    );
    ledger.escalate(repo_id);
    Ok(())
}

impl<S> PersistentRepoIterator<S> {
    pub fn id(&self) -> IteratorId {
        self.record.id
    }

    pub fn record(&self) -> &IteratorRecord {
        &self.record
    }

    pub fn repos(&self) -> &[RepoId] {
        &self.record.repos
    }

    pub fn cursor(&self) -> usize {
        self.record.cursor
    }

    pub fn total_count(&self) -> usize {
        self.record.total_count
    }

    pub fn success_count(&self) -> usize {
        self.record.success_count
    }

    pub fn percent_complete(&self) -> f64 {
        self.record.percent_complete
    }

    pub fn runtime_duration(&self) -> Duration {
        self.record.runtime_duration
    }

    /// Whether the main pass has repos left.
    pub fn has_more(&self) -> bool {
        self.record.completed_at.is_none() && self.record.cursor < self.record.total_count
    }

    pub fn has_errors(&self) -> bool {
        self.ledger.has_active()
    }

    pub fn has_terminal_errors(&self) -> bool {
        self.ledger.has_terminal()
    }

    /// Number of repos currently failing and still retryable.
    pub fn errored_repos(&self) -> usize {
        self.ledger.errored_repos()
    }

    /// Sum of failure counts, terminal repos included.
    pub fn total_errors(&self) -> u64 {
        self.ledger.total_failures()
    }

    /// Retryable failures, in first-failure order.
    pub fn errors(&self) -> Vec<IterationError> {
        self.ledger.active_entries()
    }

    pub fn terminal_errors(&self) -> Vec<IterationError> {
        self.ledger.terminal_entries()
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    /// Repos of the current retry pass (empty between passes).
    pub fn retry_queue(&self) -> &[RepoId] {
        &self.retry.repos
    }
}
