//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a persistent repo iterator (database serial).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IteratorId(i64);

/// Identifier of a per-repository error row (database serial).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorRowId(i64);

/// Identifier of a repository being iterated over.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(i32);

macro_rules! impl_int_newtype {
    ($t:ty, $raw:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: $raw) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $raw {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$raw> for $t {
            fn from(value: $raw) -> Self {
                Self(value)
            }
        }

        impl From<$t> for $raw {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .trim()
                    .parse::<$raw>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(raw))
            }
        }
    };
}

impl_int_newtype!(IteratorId, i64, "IteratorId");
impl_int_newtype!(ErrorRowId, i64, "ErrorRowId");
impl_int_newtype!(RepoId, i32, "RepoId");
