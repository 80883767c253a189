//! Strongly-typed identifiers for Capstan entities.
//!
//! Identifiers in Capstan are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **String-backed**: Task IDs may be caller-supplied stable strings; when
//!   generated, they are ULIDs and sort lexicographically by creation time
//!
//! # Example
//!
//! ```rust
//! use capstan_core::id::{OwnerId, TaskId};
//!
//! let generated = TaskId::generate();
//! let supplied = TaskId::new("billing:invoice-rollup");
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskId = OwnerId::generate();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a task document.
///
/// Tasks carry stable identities across reschedules: callers may supply
/// their own ID (for example a key derived from the scheduled work) or let
/// the scheduler mint one. Generated IDs are ULIDs, which sort
/// lexicographically by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID from a caller-supplied string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new unique task ID.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "task ID must not be empty".to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A unique identifier for a scheduler instance.
///
/// Each running instance claims task ownership under its own `OwnerId`;
/// the ID therefore appears in persisted task documents and must be unique
/// across the fleet for lease accounting to hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner ID from a caller-supplied string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new unique owner ID for this instance.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("capstan-{}", Ulid::new()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "owner ID must not be empty".to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }
}
