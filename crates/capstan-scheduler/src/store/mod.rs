//! Pluggable storage for task documents.
//!
//! The `TaskStore` trait defines the coordination medium shared by the
//! fleet: every instance claims, updates, and removes documents through it.
//!
//! ## Design Principles
//!
//! - **Optimistic concurrency**: every mutation carries the document's
//!   `version` and is rejected on stale reads
//! - **Single-round-trip claims**: `claim_available` selects and marks a
//!   batch of eligible documents atomically
//! - **Testability**: in-memory implementation for tests, a document
//!   database for production

pub mod buffered;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use capstan_core::{OwnerId, TaskId};

use crate::document::{TaskDocument, TaskStatus};
use crate::error::Result;

/// A request to claim a batch of eligible tasks.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Maximum number of documents to claim.
    pub size: usize,
    /// Lease bound recorded as each claimed document's `retry_at`.
    pub claim_ownership_until: DateTime<Utc>,
    /// Explicitly requested task IDs, claimed ahead of regular work.
    ///
    /// Explicit requests waive the `run_at` check: a run-now call claims
    /// the task even when its eligibility time is in the future.
    pub claim_tasks_by_id: Vec<TaskId>,
}

impl ClaimRequest {
    /// Creates a claim request with no explicit IDs.
    #[must_use]
    pub fn new(size: usize, claim_ownership_until: DateTime<Utc>) -> Self {
        Self {
            size,
            claim_ownership_until,
            claim_tasks_by_id: Vec::new(),
        }
    }

    /// Adds explicitly requested task IDs.
    #[must_use]
    pub fn with_tasks_by_id(mut self, ids: Vec<TaskId>) -> Self {
        self.claim_tasks_by_id = ids;
        self
    }
}

/// Result of a claim round trip.
#[derive(Debug, Clone)]
pub struct ClaimResult {
    /// Materialized documents of the rows that were actually updated.
    pub docs: Vec<TaskDocument>,
    /// The store's reported update count. When this disagrees with
    /// `docs.len()` the caller logs a warning and proceeds with `docs`.
    pub claimed_count: usize,
}

/// Read-only listing options.
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    /// Restrict to one task type.
    pub task_type: Option<String>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
    /// Page size; 0 means the store's default.
    pub size: usize,
    /// Resume after this task ID (exclusive).
    pub search_after: Option<TaskId>,
}

/// One page of a read-only listing.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Matching documents, ordered by task ID.
    pub docs: Vec<TaskDocument>,
    /// Cursor for the next page, absent on the last page.
    pub search_after: Option<TaskId>,
}

/// Classification of a raised store error.
///
/// The managed configuration sheds load on `Overload`; `Fatal` errors are
/// logged and the cycle is skipped; `Other` passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The store is stressed: timeouts, request rejection, cluster block.
    Overload,
    /// A configuration problem retrying cannot fix, e.g. the store refuses
    /// the inline scripts the claim update relies on.
    Fatal,
    /// Anything else.
    Other,
}

impl StoreErrorKind {
    /// Classifies an error by its diagnostic message.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("inline") && lower.contains("script") {
            return Self::Fatal;
        }
        if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("too many requests")
            || lower.contains("429")
            || lower.contains("cluster_block")
        {
            return Self::Overload;
        }
        Self::Other
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Overload => "overload",
            Self::Fatal => "fatal",
            Self::Other => "other",
        }
    }
}

/// A store error surfaced on the error stream.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Error classification.
    pub kind: StoreErrorKind,
    /// Diagnostic message.
    pub message: String,
}

impl StoreEvent {
    /// Creates an event, classifying the message.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: StoreErrorKind::classify(&message),
            message,
        }
    }
}

/// Storage abstraction for task documents.
///
/// ## Claim Semantics
///
/// `claim_available` is the core primitive for distributed correctness:
/// in a single round trip it selects up to `size` eligible documents,
/// ordered by `(status claim-priority, run_at)` so expired leases are
/// reclaimed ahead of fresh work and explicitly requested IDs come first,
/// and atomically sets `status = claiming`, `owner_id = self`,
/// `retry_at = claim_ownership_until`, `started_at = now`, and increments
/// `attempts`, advancing each document's version.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// poller, runners, and external callers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// The owner identity this store claims under.
    fn owner_id(&self) -> &OwnerId;

    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` when a document with the same ID exists.
    async fn create(&self, doc: TaskDocument) -> Result<TaskDocument>;

    /// Claims a batch of eligible tasks in one round trip.
    async fn claim_available(&self, request: ClaimRequest) -> Result<ClaimResult>;

    /// Optimistically updates a document against its `version`.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` when the version token is stale.
    async fn update(&self, doc: TaskDocument) -> Result<TaskDocument>;

    /// Updates a batch of documents, returning a per-document result.
    ///
    /// No cross-document ordering is promised; each document's own write
    /// order is preserved.
    async fn bulk_update(&self, docs: Vec<TaskDocument>) -> Result<Vec<Result<TaskDocument>>>;

    /// Removes a document. Idempotent: removing an absent ID succeeds.
    async fn remove(&self, id: &TaskId) -> Result<()>;

    /// Gets a document by ID.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` when the document does not exist.
    async fn get(&self, id: &TaskId) -> Result<TaskDocument>;

    /// Read-only listing.
    async fn fetch(&self, opts: SearchOpts) -> Result<FetchResult>;

    /// Returns the status of a document, or `None` when it is absent.
    async fn get_lifecycle(&self, id: &TaskId) -> Result<Option<TaskStatus>>;

    /// Subscribes to raised store errors.
    ///
    /// The managed configuration consumes this stream to shed load when
    /// the coordinating store is stressed.
    fn error_stream(&self) -> broadcast::Receiver<StoreEvent>;
}
