//! Subcommands, independent of the concrete store.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use repoiter_core::{IteratorId, RepoId};
use repoiter_infra::iterator::{IterationConfig, IteratorStore, PersistentRepoIterator};

#[derive(Parser, Debug)]
#[command(name = "repoiter")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Failure ceiling used to classify errors as terminal (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_failures: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create the iterator tables
    Migrate,

    /// Create an iterator over the given repos and print its id
    Create {
        /// Repo ids, in iteration order
        repos: Vec<RepoId>,
    },

    /// Show progress and error summary
    Status { id: IteratorId },

    /// List failing repos
    Errors {
        id: IteratorId,

        /// Report entries with at least this many failures as terminal
        /// (defaults to --max-failures)
        #[arg(long)]
        terminal_at: Option<u32>,
    },

    /// Force the iterator to complete
    Complete { id: IteratorId },

    /// Reset all progress and errors
    Restart { id: IteratorId },
}

/// Run a store-level subcommand and return its JSON report.
pub async fn run<S: IteratorStore>(command: Command, store: S, max_failures: u32) -> Result<Value> {
    match command {
        Command::Migrate => bail!("migrate is only available against Postgres"),
        Command::Create { repos } => {
            let itr = PersistentRepoIterator::create(store, repos)
                .await
                .context("failed to create iterator")?;
            Ok(json!({ "id": itr.id(), "total_count": itr.total_count() }))
        }
        Command::Status { id } => {
            let itr = load(store, id).await?;
            Ok(json!({
                "record": itr.record(),
                "has_more": itr.has_more(),
                "errored_repos": itr.errored_repos(),
                "total_errors": itr.total_errors(),
            }))
        }
        Command::Errors { id, terminal_at } => {
            let itr = load(store, id).await?;
            let config = IterationConfig::<S::Tx>::default()
                .with_max_failures(terminal_at.unwrap_or(max_failures));
            let (terminal, active): (Vec<_>, Vec<_>) = itr
                .errors()
                .into_iter()
                .partition(|entry| config.is_exhausted(entry.failure_count));
            Ok(json!({ "active": active, "terminal": terminal }))
        }
        Command::Complete { id } => {
            let mut itr = load(store, id).await?;
            itr.mark_complete()
                .await
                .context("failed to mark iterator complete")?;
            Ok(json!({ "id": id, "completed_at": itr.record().completed_at }))
        }
        Command::Restart { id } => {
            let mut itr = load(store, id).await?;
            itr.restart().await.context("failed to restart iterator")?;
            Ok(json!({ "id": id, "restarted": true }))
        }
    }
}

async fn load<S: IteratorStore>(store: S, id: IteratorId) -> Result<PersistentRepoIterator<S>> {
    PersistentRepoIterator::load(store, id)
        .await
        .with_context(|| format!("failed to load iterator {id}"))
}
