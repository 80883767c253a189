//! Scheduling middleware.
//!
//! Middleware transforms task instances before they are persisted, in
//! registration order. Hosts use this to stamp tenancy fields, inject
//! defaults, or validate parameters without touching the scheduler core.

use async_trait::async_trait;

use crate::document::TaskInstance;
use crate::error::Result;

/// Pre-save transform applied by `schedule` and `ensure_scheduled`.
#[async_trait]
pub trait SchedulingMiddleware: Send + Sync {
    /// Transforms the instance before persistence.
    ///
    /// An `Err` aborts the scheduling call and is surfaced to the caller.
    async fn before_save(&self, instance: TaskInstance) -> Result<TaskInstance>;
}
