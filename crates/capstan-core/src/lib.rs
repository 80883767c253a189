//! # capstan-core
//!
//! Core abstractions for the Capstan distributed task scheduler.
//!
//! This crate provides the foundational types used across all Capstan
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks and scheduler instances
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `capstan-core` is the **only** crate allowed to define shared primitives.
//! All cross-component interaction happens via types defined here.
//!
//! ## Example
//!
//! ```rust
//! use capstan_core::prelude::*;
//!
//! // Identify this scheduler instance
//! let owner = OwnerId::generate();
//!
//! // Mint a task ID when the caller did not supply one
//! let task_id = TaskId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use capstan_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{OwnerId, TaskId};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{OwnerId, TaskId};
pub use observability::{init_logging, LogFormat};
