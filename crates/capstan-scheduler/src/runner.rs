//! Per-task lifecycle driver.
//!
//! A runner owns one claimed document and drives it from claim to
//! persisted outcome:
//!
//! ```text
//! claiming ──mark_running──► running ──execute──► {success, failure}
//!                                 │                  │
//!                                 │                  └─► persist ──► removed | rescheduled | failed
//!                                 └─► timeout ──► failure
//! ```
//!
//! Runners never propagate executor errors upward; every outcome becomes a
//! store write and a lifecycle event. An optimistic-write loss anywhere
//! means another instance reclaimed the task after lease expiry, and the
//! runner drops its outcome silently.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capstan_core::TaskId;

use crate::backoff::RetryBackoff;
use crate::dictionary::{ExecutionContext, ExecutorOutcome, TaskDefinition, TaskTypeDictionary};
use crate::document::{TaskDocument, TaskStatus};
use crate::error::Error;
use crate::events::{EventBus, TaskEvent, TaskEventKind};
use crate::metrics::SchedulerMetrics;
use crate::store::buffered::BufferedStore;

/// Drives a single claimed task to its persisted outcome.
pub struct TaskRunner {
    doc: TaskDocument,
    definition: Option<Arc<TaskDefinition>>,
    store: BufferedStore,
    events: EventBus,
    backoff: RetryBackoff,
    default_max_attempts: u32,
    metrics: SchedulerMetrics,
}

impl TaskRunner {
    /// Wraps a claimed document, resolving its type definition.
    #[must_use]
    pub fn new(
        doc: TaskDocument,
        dictionary: &TaskTypeDictionary,
        store: BufferedStore,
        events: EventBus,
        backoff: RetryBackoff,
        default_max_attempts: u32,
    ) -> Self {
        let definition = dictionary.get(&doc.task_type);
        Self {
            doc,
            definition,
            store,
            events,
            backoff,
            default_max_attempts,
            metrics: SchedulerMetrics::new(),
        }
    }

    /// The task this runner drives.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.doc.id
    }

    /// The task's type name.
    #[must_use]
    pub fn task_type(&self) -> &str {
        &self.doc.task_type
    }

    /// Runs the full lifecycle: mark running, execute, persist.
    pub(crate) async fn process(mut self, abort: CancellationToken) {
        if !self.mark_running().await {
            return;
        }
        self.execute_and_persist(abort).await;
    }

    /// Optimistically transitions the document to `running`.
    ///
    /// Returns false when the write lost: another instance reclaimed the
    /// task after lease expiry, so this runner has no authority left.
    async fn mark_running(&mut self) -> bool {
        let mut doc = self.doc.clone();
        doc.status = TaskStatus::Running;
        doc.started_at = Some(Utc::now());

        match self.store.update(doc).await {
            Ok(updated) => {
                self.doc = updated;
                self.events.publish(TaskEvent::ok(
                    TaskEventKind::MarkRunning,
                    self.doc.id.clone(),
                    Some(self.doc.clone()),
                ));
                true
            }
            Err(err) => {
                if err.is_version_conflict() {
                    debug!(task_id = %self.doc.id, "task reclaimed before mark-running");
                } else {
                    warn!(task_id = %self.doc.id, error = %err, "mark-running failed");
                }
                self.events.publish(TaskEvent::err(
                    TaskEventKind::MarkRunning,
                    self.doc.id.clone(),
                    Arc::new(err),
                ));
                false
            }
        }
    }

    /// Executes the task with its type timeout and persists the outcome.
    async fn execute_and_persist(self, abort: CancellationToken) {
        let Some(definition) = self.definition.clone() else {
            let task_type = self.doc.task_type.clone();
            self.fail_terminally(Error::UnknownTaskType { task_type }).await;
            return;
        };

        let started = Instant::now();
        let executor = definition.create_executor(&self.doc);
        let ctx = ExecutionContext {
            task: self.doc.clone(),
            abort: abort.clone(),
        };

        let result = match tokio::time::timeout(definition.timeout, executor.run(ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                // Fire the abort signal so a cooperative executor stops
                // doing work it has no authority to persist.
                abort.cancel();
                Err(Error::ExecutorTimedOut {
                    task_id: self.doc.id.clone(),
                    timeout: definition.timeout,
                })
            }
        };

        let elapsed = started.elapsed();
        match result {
            Ok(outcome) => {
                self.metrics
                    .record_task_run(&definition.title, "success", elapsed);
                self.persist_success(outcome).await;
            }
            Err(err) => {
                let label = if matches!(err, Error::ExecutorTimedOut { .. }) {
                    "timeout"
                } else {
                    "failure"
                };
                self.metrics.record_task_run(&definition.title, label, elapsed);
                self.persist_failure(&definition, err).await;
            }
        }
    }

    /// Persists a successful run: removal for one-shot tasks, reschedule
    /// for recurring ones.
    async fn persist_success(self, outcome: ExecutorOutcome) {
        let now = Utc::now();
        let id = self.doc.id.clone();

        let Some(schedule) = self.doc.schedule else {
            match self.store.remove(&id).await {
                Ok(()) => {
                    self.events
                        .publish(TaskEvent::ok(TaskEventKind::Run, id, None));
                }
                Err(err) => {
                    warn!(task_id = %id, error = %err, "failed to remove completed task");
                    self.events
                        .publish(TaskEvent::err(TaskEventKind::Run, id, Arc::new(err)));
                }
            }
            return;
        };

        let mut doc = self.doc.clone();
        doc.status = TaskStatus::Idle;
        doc.attempts = 0;
        doc.state = outcome.state;
        // An executor-supplied run_at overrides the interval for the next
        // run only; nothing is written back into the schedule.
        doc.run_at = outcome.next_run_at.unwrap_or_else(|| schedule.next_run_at(now));
        doc.scheduled_at = now;
        doc.owner_id = None;
        doc.retry_at = None;

        self.write_outcome(doc, None).await;
    }

    /// Persists a failed run: backoff reschedule while attempts remain,
    /// terminal failure (one-shot) or interval reset (recurring) after.
    async fn persist_failure(self, definition: &TaskDefinition, err: Error) {
        let now = Utc::now();
        let max_attempts = definition.resolved_max_attempts(self.default_max_attempts);

        // The claim already advanced `attempts`; this failure IS that
        // attempt, so the count carries over unchanged.
        let mut doc = self.doc.clone();
        doc.owner_id = None;
        doc.retry_at = None;

        if doc.attempts < max_attempts {
            doc.status = TaskStatus::Idle;
            doc.run_at = self.backoff.next_run_at(now, doc.attempts);
        } else if let Some(schedule) = doc.schedule {
            // Recurring tasks never reach terminal failure: exhausted
            // attempts reset to the regular cadence.
            doc.status = TaskStatus::Idle;
            doc.attempts = 0;
            doc.run_at = schedule.next_run_at(now);
        } else {
            doc.status = TaskStatus::Failed;
        }
        doc.scheduled_at = now;

        self.write_outcome(doc, Some(Arc::new(err))).await;
    }

    /// Marks the task terminally failed without executing it.
    async fn fail_terminally(self, err: Error) {
        warn!(task_id = %self.doc.id, error = %err, "failing task terminally");
        let mut doc = self.doc.clone();
        doc.status = TaskStatus::Failed;
        doc.owner_id = None;
        doc.retry_at = None;

        self.write_outcome(doc, Some(Arc::new(err))).await;
    }

    /// Writes the outcome document and publishes the `Run` event.
    ///
    /// A version conflict here means the lease expired mid-run and another
    /// instance took over; the outcome is dropped silently.
    async fn write_outcome(self, doc: TaskDocument, run_error: Option<Arc<Error>>) {
        let id = doc.id.clone();
        match self.store.update(doc).await {
            Ok(updated) => match run_error {
                None => self
                    .events
                    .publish(TaskEvent::ok(TaskEventKind::Run, id, Some(updated))),
                Some(err) => self
                    .events
                    .publish(TaskEvent::err(TaskEventKind::Run, id, err)),
            },
            Err(write_err) => {
                if write_err.is_version_conflict() {
                    debug!(task_id = %id, "task reclaimed mid-run, dropping outcome");
                } else {
                    warn!(task_id = %id, error = %write_err, "failed to persist task outcome");
                }
                self.events
                    .publish(TaskEvent::err(TaskEventKind::Run, id, Arc::new(write_err)));
            }
        }
    }
}
