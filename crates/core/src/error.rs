//! Structural error model.

use thiserror::Error;

/// Result type used for structural checks.
pub type DomainResult<T> = Result<T, DomainError>;

/// Structural error raised by the iteration engine.
///
/// These never describe a per-repository failure (those live in the error
/// ledger). They describe state that the engine refuses to act on: corrupt
/// persisted rows, stale checkout tokens, malformed identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Persisted state is malformed (e.g. cursor beyond the repo list).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A runtime bounds check failed (e.g. a checkout that no longer lines
    /// up with the cursor).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The requested iterator does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DomainError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}
