//! Lifecycle events and the in-process event stream.
//!
//! The runner publishes lifecycle events on a shared multicast stream
//! rather than invoking callbacks, so that `run_now` can synchronize with
//! the asynchronous task lifecycle without coupling the pool to the facade.
//! Subscribers filter by task ID and unsubscribe on the first terminal
//! event.

use std::sync::Arc;

use tokio::sync::broadcast;

use capstan_core::TaskId;

use crate::document::TaskDocument;
use crate::error::Error;

/// Default broadcast capacity; slow subscribers lag rather than block.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Lifecycle phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEventKind {
    /// The task was (or failed to be) claimed in a poll cycle.
    Claim,
    /// The claiming instance marked the task running.
    MarkRunning,
    /// The task's execution finished and its outcome was persisted.
    Run,
    /// An explicit run-now request was accepted or refused.
    RunRequest,
}

impl TaskEventKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::MarkRunning => "mark_running",
            Self::Run => "run",
            Self::RunRequest => "run_request",
        }
    }
}

/// Outcome payload of a lifecycle event.
///
/// Errors are shared behind `Arc` because one event fans out to every
/// subscriber of the broadcast stream.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// The phase completed; carries the document snapshot where one exists.
    Ok(Option<TaskDocument>),
    /// The phase failed.
    Err(Arc<Error>),
}

impl EventOutcome {
    /// Returns true if the outcome is `Ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns the error, if any.
    #[must_use]
    pub fn err(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Ok(_) => None,
            Self::Err(err) => Some(err),
        }
    }
}

/// A typed lifecycle event for a single task.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// The task the event refers to.
    pub task_id: TaskId,
    /// Lifecycle phase.
    pub kind: TaskEventKind,
    /// Phase outcome.
    pub outcome: EventOutcome,
}

impl TaskEvent {
    /// Creates a successful event with an optional document snapshot.
    #[must_use]
    pub fn ok(kind: TaskEventKind, task_id: TaskId, document: Option<TaskDocument>) -> Self {
        Self {
            task_id,
            kind,
            outcome: EventOutcome::Ok(document),
        }
    }

    /// Creates a failed event.
    #[must_use]
    pub fn err(kind: TaskEventKind, task_id: TaskId, error: Arc<Error>) -> Self {
        Self {
            task_id,
            kind,
            outcome: EventOutcome::Err(error),
        }
    }

    /// Returns true if this event settles a waiting `run_now` caller.
    ///
    /// Terminal events are `Run(Ok)` and any `Err` at the claim,
    /// run-request, or run phase. `MarkRunning` events are informational:
    /// a mark-running conflict only means another instance reclaimed the
    /// task, whose own lifecycle will produce the terminal event.
    #[must_use]
    pub fn is_terminal_for_run_now(&self) -> bool {
        match self.kind {
            TaskEventKind::Run => true,
            TaskEventKind::Claim | TaskEventKind::RunRequest => !self.outcome.is_ok(),
            TaskEventKind::MarkRunning => false,
        }
    }
}

/// Multicast stream of task lifecycle events.
///
/// Thin wrapper over [`tokio::sync::broadcast`]: publishing never blocks
/// and is a no-op when nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to the stream and returns a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}
