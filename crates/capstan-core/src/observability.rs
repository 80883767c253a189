//! Observability infrastructure for Capstan.
//!
//! Structured logging with consistent spans across all scheduler
//! components. This module provides initialization helpers and span
//! constructors so that every instance logs claim cycles and task runs
//! with the same field names.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `capstan_scheduler=debug`)
///
/// # Example
///
/// ```rust
/// use capstan_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for scheduler-level operations with standard fields.
///
/// # Example
///
/// ```rust
/// use capstan_core::observability::scheduler_span;
///
/// let span = scheduler_span("poll_for_work", "capstan-01J9");
/// let _guard = span.enter();
/// // ... claim and dispatch
/// ```
#[must_use]
pub fn scheduler_span(operation: &str, owner: &str) -> Span {
    tracing::info_span!(
        "scheduler",
        op = operation,
        owner = owner,
    )
}

/// Creates a span for per-task operations.
///
/// # Example
///
/// ```rust
/// use capstan_core::observability::task_span;
///
/// let span = task_span("mark_running", "01J9ABC", "reindex");
/// let _guard = span.enter();
/// // ... drive the task lifecycle
/// ```
#[must_use]
pub fn task_span(operation: &str, task_id: &str, task_type: &str) -> Span {
    tracing::info_span!(
        "task",
        op = operation,
        task_id = task_id,
        task_type = task_type,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn test_scheduler_span_creates_span() {
        let span = scheduler_span("poll_for_work", "capstan-test");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn test_task_span_creates_span() {
        let span = task_span("mark_running", "task-1", "sample");
        let _guard = span.enter();
        tracing::info!("task message");
    }
}
