//! Persisted task documents and their lifecycle states.
//!
//! This module provides:
//! - `TaskStatus`: The coarse persistence state of a task document
//! - `TaskDocument`: The document shared through the task store
//! - `TaskSchedule`: Recurrence specification for repeating tasks
//! - `TaskInstance`: Caller-facing payload for creating tasks

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use capstan_core::{OwnerId, TaskId};

/// Persistence state of a task document.
///
/// Unlike an in-process state machine, this status is shared through the
/// store and advanced with optimistic writes; any instance in the fleet may
/// observe (and, on lease expiry, overwrite) it:
///
/// ```text
/// ┌──────┐  claim   ┌──────────┐ mark-running ┌─────────┐
/// │ IDLE │─────────►│ CLAIMING │─────────────►│ RUNNING │
/// └──────┘          └──────────┘              └─────────┘
///     ▲                   │ lease expiry           │
///     │                   ▼ (reclaimed)            │ outcome
///     │              ┌──────────┐                  │
///     └──────────────│ (reclaim)│◄─────────────────┤ retry / reschedule
///                    └──────────┘                  ▼
///                                            ┌────────┐   removed on
///                                            │ FAILED │   non-recurring
///                                            └────────┘   success
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its `run_at` to arrive.
    Idle,
    /// Claimed by an instance; not yet marked running.
    Claiming,
    /// Actively executing on the claiming instance.
    Running,
    /// Terminally failed; retained for inspection, never reclaimed.
    Failed,
}

impl TaskStatus {
    /// Claim ordering priority: tasks whose lease has expired are
    /// reclaimed ahead of fresh work.
    ///
    /// Lower sorts first: `claiming < idle < running < failed`.
    #[must_use]
    pub const fn claim_priority(&self) -> u8 {
        match self {
            Self::Claiming => 0,
            Self::Idle => 1,
            Self::Running => 2,
            Self::Failed => 3,
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Recurrence specification for a repeating task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSchedule {
    /// Interval between successive runs.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl TaskSchedule {
    /// Creates a schedule with the given interval.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Computes the next eligibility time from `now`.
    #[must_use]
    pub fn next_run_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.interval).unwrap_or(chrono::Duration::MAX)
    }
}

/// A task document as persisted in the task store.
///
/// Documents are the only shared mutable resource between instances.
/// Every mutation carries the `version` read from the store and is rejected
/// on stale reads, which is what makes lease reclamation safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    /// Stable identifier, caller-supplied or generated.
    pub id: TaskId,
    /// Task type; must resolve in the type dictionary at claim time.
    pub task_type: String,
    /// Opaque caller payload, passed to the executor unchanged.
    #[serde(default)]
    pub params: JsonValue,
    /// Execution state, overwritten by each successful run.
    #[serde(default)]
    pub state: JsonValue,
    /// Persistence status.
    pub status: TaskStatus,
    /// Earliest moment the task is eligible to run.
    pub run_at: DateTime<Utc>,
    /// When the task was last scheduled or rescheduled.
    pub scheduled_at: DateTime<Utc>,
    /// When the task last entered `running` (or was claimed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Upper bound of the current claim lease.
    ///
    /// Set at claim time to `claim_ownership_until`; a claiming/running
    /// task whose `retry_at` has passed may be reclaimed by any instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts; reset to 0 after a successful run.
    #[serde(default)]
    pub attempts: u32,
    /// Instance holding the current claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    /// Recurrence specification; `None` for one-shot tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<TaskSchedule>,
    /// Revision token for optimistic concurrency.
    ///
    /// The value is dictated by the store; everything else treats it as
    /// opaque and passes it back unchanged on updates.
    #[serde(default)]
    pub version: u64,
}

impl TaskDocument {
    /// Returns true if this task repeats on a schedule.
    #[must_use]
    pub const fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }

    /// Returns true if the document is eligible to be claimed at `now`.
    ///
    /// A task is claimable iff its status is idle, claiming, or running,
    /// its `run_at` has arrived, and (unless idle) its lease (`retry_at`)
    /// has expired. The lease clause is what reclaims work abandoned by a
    /// crashed or partitioned instance.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Failed => false,
            TaskStatus::Idle => self.run_at <= now,
            TaskStatus::Claiming | TaskStatus::Running => {
                self.run_at <= now && self.retry_at.is_none_or(|retry_at| retry_at <= now)
            }
        }
    }

    /// Sort key for claim ordering: expired leases first, then FIFO by
    /// eligibility time.
    #[must_use]
    pub fn claim_sort_key(&self) -> (u8, DateTime<Utc>) {
        (self.status.claim_priority(), self.run_at)
    }
}

/// Caller-facing payload for creating (or ensuring) a task.
///
/// Everything the store manages (status, lease fields, attempts, version)
/// is absent here; `into_document_at` materializes a fresh idle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    /// Stable identifier; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    /// Task type name.
    pub task_type: String,
    /// Opaque caller payload.
    #[serde(default)]
    pub params: JsonValue,
    /// Initial execution state.
    #[serde(default)]
    pub state: JsonValue,
    /// Recurrence specification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<TaskSchedule>,
    /// First eligibility time; defaults to now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    /// Creates an instance of the given task type with empty payloads.
    #[must_use]
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            params: JsonValue::Null,
            state: JsonValue::Null,
            schedule: None,
            run_at: None,
        }
    }

    /// Sets a caller-supplied stable ID.
    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the opaque parameter payload.
    #[must_use]
    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Sets the initial execution state.
    #[must_use]
    pub fn with_state(mut self, state: JsonValue) -> Self {
        self.state = state;
        self
    }

    /// Makes the task recurring with the given interval.
    #[must_use]
    pub fn with_schedule(mut self, schedule: TaskSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Sets the first eligibility time.
    #[must_use]
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Materializes a fresh idle document at `now`.
    #[must_use]
    pub fn into_document_at(self, now: DateTime<Utc>) -> TaskDocument {
        TaskDocument {
            id: self.id.unwrap_or_else(TaskId::generate),
            task_type: self.task_type,
            params: self.params,
            state: self.state,
            status: TaskStatus::Idle,
            run_at: self.run_at.unwrap_or(now),
            scheduled_at: now,
            started_at: None,
            retry_at: None,
            attempts: 0,
            owner_id: None,
            schedule: self.schedule,
            version: 0,
        }
    }
}
