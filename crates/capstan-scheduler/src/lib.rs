//! # capstan-scheduler
//!
//! Store-coordinated distributed task scheduler.
//!
//! A fleet of peer instances runs background work items ("tasks") using a
//! shared document store as the coordination medium. Each instance
//! periodically polls the store, atomically claims a bounded batch of due
//! tasks with optimistic concurrency, runs them in a local worker pool,
//! and writes back the outcome (reschedule, retry with backoff, or
//! removal).
//!
//! ## Core Concepts
//!
//! - **Claim / lease**: an optimistic, time-bounded assertion of ownership
//!   recorded in the store; stale leases are reclaimed by any instance
//! - **Cycle**: one poller iteration: emit → claim → pool-run
//! - **Runner**: in-memory driver of a single task's lifecycle from claim
//!   to persisted outcome
//! - **Event stream**: in-process multicast of typed lifecycle events,
//!   consumed by `run_now` and observers
//!
//! ## Guarantees
//!
//! - **At-least-once**: an instance that loses its lease also loses write
//!   authority, so another instance can safely re-run the task
//! - **Mutual exclusion per version**: every mutation carries the
//!   document's revision token and loses cleanly against concurrent writes
//! - **Backpressure**: observed store overload shrinks the worker ceiling
//!   and stretches the poll interval until the signal clears
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use capstan_scheduler::config::SchedulerConfig;
//! use capstan_scheduler::dictionary::{
//!     ExecutionContext, ExecutorOutcome, TaskDefinition, TaskExecutor,
//! };
//! use capstan_scheduler::document::TaskInstance;
//! use capstan_scheduler::error::Result;
//! use capstan_scheduler::scheduler::TaskScheduler;
//! use capstan_scheduler::store::memory::InMemoryTaskStore;
//!
//! struct PingExecutor;
//!
//! #[async_trait::async_trait]
//! impl TaskExecutor for PingExecutor {
//!     async fn run(&self, _ctx: ExecutionContext) -> Result<ExecutorOutcome> {
//!         Ok(ExecutorOutcome::new(serde_json::json!({ "pinged": true })))
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let store = Arc::new(InMemoryTaskStore::new());
//! let scheduler = TaskScheduler::new(SchedulerConfig::default(), store)?;
//!
//! scheduler.register_task_definition(
//!     "ping",
//!     TaskDefinition::new(
//!         "ping",
//!         Arc::new(|_doc| Arc::new(PingExecutor) as Arc<dyn TaskExecutor>),
//!     ),
//! )?;
//! scheduler.start()?;
//!
//! let doc = scheduler.schedule(TaskInstance::new("ping")).await?;
//! let reply = scheduler.run_now(&doc.id).await?;
//! assert_eq!(reply.id, doc.id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod config;
pub mod dictionary;
pub mod document;
pub mod error;
pub mod events;
pub mod health;
pub mod managed;
pub mod metrics;
pub mod middleware;
pub mod monitor;
pub mod pool;
pub mod poller;
pub mod runner;
pub mod scheduler;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backoff::RetryBackoff;
    pub use crate::config::SchedulerConfig;
    pub use crate::dictionary::{
        ExecutionContext, ExecutorOutcome, TaskDefinition, TaskExecutor, TaskTypeDictionary,
    };
    pub use crate::document::{TaskDocument, TaskInstance, TaskSchedule, TaskStatus};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, EventOutcome, TaskEvent, TaskEventKind};
    pub use crate::health::{HealthStatus, MonitoredStats};
    pub use crate::middleware::SchedulingMiddleware;
    pub use crate::scheduler::{RunNowResult, TaskScheduler};
    pub use crate::store::memory::InMemoryTaskStore;
    pub use crate::store::{ClaimRequest, ClaimResult, FetchResult, SearchOpts, TaskStore};
    pub use capstan_core::{OwnerId, TaskId};
}
