//! Durable, resumable iteration over a fixed list of repositories.
//!
//! An iterator persists its cursor, counters and per-repo failures so a
//! long-running job can be interrupted and resumed where it stopped. Failed
//! repos are retried in separate passes until they succeed or hit the
//! configured failure ceiling.
//!
//! - `engine`: `PersistentRepoIterator`, main pass, finish transaction, admin ops
//! - `retry`: retry passes
//! - `ledger`: active vs terminal failure bookkeeping
//! - `store`: persistence traits
//! - `in_memory` / `postgres`: store implementations

pub mod engine;
pub mod error;
pub mod in_memory;
pub mod ledger;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod types;

pub use engine::PersistentRepoIterator;
pub use error::IteratorError;
pub use in_memory::{FailPoint, InMemoryIteratorStore, InMemoryTransaction};
pub use ledger::ErrorLedger;
pub use postgres::{PostgresIteratorStore, PostgresTransaction};
pub use store::{IteratorStore, IteratorTransaction, StoreError};
pub use types::{
    Checkout, CounterDelta, IterationConfig, IterationError, IteratorRecord, Pass,
    ProgressCounters, TerminalHook, percent_complete,
};
