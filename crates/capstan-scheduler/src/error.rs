//! Error types for the scheduling domain.

use std::time::Duration;

use capstan_core::TaskId;

/// The result type used throughout capstan-scheduler.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An optimistic write lost against a concurrent modification.
    ///
    /// At the protocol level this is silent: the losing side drops its
    /// write and the lifecycle event stream carries the `Err`.
    #[error("version conflict: task {task_id} was modified concurrently")]
    VersionConflict {
        /// The task whose version token was stale.
        task_id: TaskId,
    },

    /// The task does not exist in the store.
    #[error("task {task_id} does not exist")]
    TaskNotFound {
        /// The task ID that was looked up.
        task_id: TaskId,
    },

    /// A run-now request raced with an in-flight execution.
    #[error("task {task_id} is currently running")]
    CurrentlyRunning {
        /// The task that is already executing.
        task_id: TaskId,
    },

    /// A claimed document names a task type with no registered definition.
    ///
    /// The task is marked `failed` terminally; it is not retried.
    #[error("unknown task type: {task_type}")]
    UnknownTaskType {
        /// The unresolvable type name.
        task_type: String,
    },

    /// A claim cycle could not claim an explicitly requested task.
    #[error("failed to claim task {task_id}")]
    ClaimFailed {
        /// The task that was requested but not claimed.
        task_id: TaskId,
    },

    /// The task executor returned or raised an error.
    #[error("task executor failed: {message}")]
    ExecutorFailed {
        /// The executor's error description.
        message: String,
    },

    /// The executor exceeded the task type's timeout.
    #[error("task {task_id} timed out after {timeout:?}")]
    ExecutorTimedOut {
        /// The task that was aborted.
        task_id: TaskId,
        /// The configured execution timeout.
        timeout: Duration,
    },

    /// The poller's explicit-request buffer is full.
    #[error("run-now request capacity reached for task {task_id}")]
    RequestCapacityReached {
        /// The request that was refused.
        task_id: TaskId,
    },

    /// A work phase exceeded the poller's timeout.
    ///
    /// Tasks already handed to the pool continue to run.
    #[error("poller work phase exceeded {timeout:?}")]
    PollerWorkTimeout {
        /// The elapsed work-phase budget.
        timeout: Duration,
    },

    /// An operation was invoked before the scheduler was started.
    #[error("scheduler has not been started")]
    NotInitialized,

    /// A setup-phase operation was invoked after the scheduler started.
    #[error("scheduler already started: {message}")]
    AlreadyStarted {
        /// What was attempted too late.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the invalid option.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from capstan-core.
    #[error("core error: {0}")]
    Core(#[from] capstan_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an executor failure from any displayable error.
    #[must_use]
    pub fn executor_failed(message: impl Into<String>) -> Self {
        Self::ExecutorFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// Returns true if this error means the task is absent from the store.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_display() {
        let err = Error::VersionConflict {
            task_id: TaskId::new("abc"),
        };
        assert!(err.to_string().contains("version conflict"));
        assert!(err.is_version_conflict());
    }

    #[test]
    fn not_found_display_names_task() {
        let err = Error::TaskNotFound {
            task_id: TaskId::new("missing"),
        };
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("does not exist"));
        assert!(err.is_not_found());
    }

    #[test]
    fn currently_running_display() {
        let err = Error::CurrentlyRunning {
            task_id: TaskId::new("busy"),
        };
        assert!(err.to_string().contains("currently running"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out");
        let err = Error::storage_with_source("bulk update failed", source);
        assert!(err.to_string().contains("storage error"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
