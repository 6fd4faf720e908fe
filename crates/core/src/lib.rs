//! Identifiers, structural errors, and the clock shared by the iteration
//! engine and its stores.
//!
//! This crate performs no I/O.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, MockClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{ErrorRowId, IteratorId, RepoId};
