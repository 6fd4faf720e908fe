//! Iterator rows, ledger entries, checkout tokens, and per-call configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use repoiter_core::{DomainError, DomainResult, ErrorRowId, IteratorId, RepoId};

/// Durable iterator row.
///
/// `repos` and `total_count` are fixed at creation. Everything else moves only
/// through committed finish transactions and administrative operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorRecord {
    pub id: IteratorId,
    pub repos: Vec<RepoId>,
    pub total_count: usize,
    /// Number of repos finished by the main pass; index of the next one.
    pub cursor: usize,
    pub success_count: usize,
    pub percent_complete: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runtime_duration: Duration,
}

impl IteratorRecord {
    /// A freshly created row: nothing finished yet.
    pub fn new(id: IteratorId, repos: Vec<RepoId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            total_count: repos.len(),
            repos,
            cursor: 0,
            success_count: 0,
            percent_complete: 0.0,
            created_at,
            started_at: None,
            completed_at: None,
            runtime_duration: Duration::ZERO,
        }
    }

    /// Reject rows that cannot have been produced by this engine.
    pub fn validate(&self) -> DomainResult<()> {
        if self.total_count != self.repos.len() {
            return Err(DomainError::invalid_state(format!(
                "iterator {}: total_count {} does not match {} repos",
                self.id,
                self.total_count,
                self.repos.len()
            )));
        }
        if self.cursor > self.repos.len() {
            return Err(DomainError::invalid_state(format!(
                "iterator {}: cursor {} is beyond the end of {} repos",
                self.id,
                self.cursor,
                self.repos.len()
            )));
        }
        Ok(())
    }

    pub fn apply_counters(&mut self, counters: ProgressCounters) {
        self.percent_complete = counters.percent_complete;
        self.success_count = counters.success_count;
        self.cursor = counters.cursor;
        self.runtime_duration = counters.runtime_duration;
    }

    /// Zero all progress, keeping identity and the repo list.
    pub fn reset_progress(&mut self) {
        self.cursor = 0;
        self.success_count = 0;
        self.percent_complete = 0.0;
        self.started_at = None;
        self.completed_at = None;
        self.runtime_duration = Duration::ZERO;
    }
}

/// `success / total`, or 0 for an empty iterator.
pub fn percent_complete(success_count: usize, total_count: usize) -> f64 {
    if total_count == 0 {
        0.0
    } else {
        success_count as f64 / total_count as f64
    }
}

/// Increments applied by a single finish transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDelta {
    pub success: usize,
    pub cursor: usize,
    pub runtime: Duration,
}

/// Counter values after an update, as persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressCounters {
    pub percent_complete: f64,
    pub success_count: usize,
    pub cursor: usize,
    pub runtime_duration: Duration,
}

/// A repository that is currently failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub id: ErrorRowId,
    pub repo_id: RepoId,
    pub failure_count: u32,
    /// Oldest first.
    pub error_messages: Vec<String>,
}

/// Which walk a checkout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Main,
    Retry,
}

/// Work handed out by the iterator, redeemed later with a finish call.
///
/// Obtaining a checkout never changes iterator state; only finishing it does.
/// The engine never hands out an empty checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub(crate) repos: Vec<RepoId>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) pass: Pass,
    /// Main cursor at checkout time, or the retry ticket for retry checkouts.
    pub(crate) position: usize,
}

impl Checkout {
    /// First (for single checkouts, only) repo.
    pub fn repo_id(&self) -> Option<RepoId> {
        self.repos.first().copied()
    }

    pub fn repos(&self) -> &[RepoId] {
        &self.repos
    }

    pub fn pass(&self) -> Pass {
        self.pass
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

/// Callback fired once when a repo crosses the failure ceiling.
///
/// The hook runs inside the transaction that escalates the repo and gets a
/// handle to it, so its own writes commit or roll back together with the
/// escalation. Returning an error aborts that transaction.
#[async_trait]
pub trait TerminalHook<Tx: Send>: Send + Sync {
    async fn on_terminal(
        &self,
        tx: &mut Tx,
        repo_id: RepoId,
        error: &IterationError,
    ) -> anyhow::Result<()>;
}

/// Per-call retry configuration, typed by the store's transaction.
pub struct IterationConfig<Tx: Send> {
    /// 0 means unlimited retries.
    pub max_failures: u32,
    pub on_terminal: Option<Arc<dyn TerminalHook<Tx>>>,
}

impl<Tx: Send> IterationConfig<Tx> {
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn on_terminal<H>(mut self, hook: H) -> Self
    where
        H: TerminalHook<Tx> + 'static,
    {
        self.on_terminal = Some(Arc::new(hook));
        self
    }

    /// Whether `failure_count` is at or past the ceiling.
    pub fn is_exhausted(&self, failure_count: u32) -> bool {
        self.max_failures > 0 && failure_count >= self.max_failures
    }
}

impl<Tx: Send> Default for IterationConfig<Tx> {
    fn default() -> Self {
        Self {
            max_failures: 0,
            on_terminal: None,
        }
    }
}

impl<Tx: Send> Clone for IterationConfig<Tx> {
    fn clone(&self) -> Self {
        Self {
            max_failures: self.max_failures,
            on_terminal: self.on_terminal.clone(),
        }
    }
}

impl<Tx: Send> fmt::Debug for IterationConfig<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationConfig")
            .field("max_failures", &self.max_failures)
            .field("on_terminal", &self.on_terminal.is_some())
            .finish()
    }
}
