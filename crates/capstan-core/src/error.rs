//! Error types and result aliases shared across Capstan components.
//!
//! Errors are structured for programmatic handling and include context for
//! debugging. Domain-specific errors live in the crates that raise them;
//! this module only defines failures of the shared primitives.

/// The result type used throughout capstan-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "must not be empty".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn internal_helper() {
        let err = Error::internal("watch channel closed");
        assert!(err.to_string().contains("watch channel closed"));
    }
}
