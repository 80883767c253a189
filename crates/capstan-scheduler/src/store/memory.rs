//! In-memory task store implementation for testing.
//!
//! This module provides [`InMemoryTaskStore`], a simple in-memory
//! implementation of the [`TaskStore`] trait suitable for testing and
//! development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All documents are lost when the process exits

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use capstan_core::{OwnerId, TaskId};

use super::{
    ClaimRequest, ClaimResult, FetchResult, SearchOpts, StoreEvent, TaskStore,
};
use crate::document::{TaskDocument, TaskStatus};
use crate::error::{Error, Result};

/// Default page size for `fetch` when the caller passes 0.
const DEFAULT_FETCH_SIZE: usize = 100;

/// Capacity of the error broadcast channel.
const ERROR_STREAM_CAPACITY: usize = 64;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task store lock poisoned")
}

/// In-memory task store for testing.
///
/// Provides a thread-safe implementation of the [`TaskStore`] trait using
/// `RwLock` for synchronization and a monotonic counter for version tokens.
///
/// ## Example
///
/// ```rust
/// use capstan_scheduler::store::memory::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug)]
pub struct InMemoryTaskStore {
    owner: OwnerId,
    tasks: RwLock<HashMap<TaskId, TaskDocument>>,
    next_version: AtomicU64,
    errors: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// Creates a new in-memory store with a generated owner identity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_owner(OwnerId::generate())
    }

    /// Creates a store claiming under the given owner identity.
    #[must_use]
    pub fn with_owner(owner: OwnerId) -> Self {
        let (errors, _rx) = broadcast::channel(ERROR_STREAM_CAPACITY);
        Self {
            owner,
            tasks: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            errors,
        }
    }

    /// Returns the number of documents currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let count = {
            let tasks = self.tasks.read().map_err(poison_err)?;
            tasks.len()
        };
        Ok(count)
    }

    /// Publishes a synthetic error on the error stream.
    ///
    /// Test hook: the in-memory store never fails on its own, so tests of
    /// the managed configuration inject overload signals through this.
    pub fn inject_error(&self, message: impl Into<String>) {
        let _ = self.errors.send(StoreEvent::from_message(message));
    }

    fn advance_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn owner_id(&self) -> &OwnerId {
        &self.owner
    }

    async fn create(&self, mut doc: TaskDocument) -> Result<TaskDocument> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;

        if tasks.contains_key(&doc.id) {
            return Err(Error::VersionConflict {
                task_id: doc.id.clone(),
            });
        }

        doc.version = self.advance_version();
        tasks.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn claim_available(&self, request: ClaimRequest) -> Result<ClaimResult> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().map_err(poison_err)?;

        // Explicit requests first: eligible by status/lease alone, the
        // run_at check is waived so run-now can preempt a future schedule.
        let mut selected: Vec<TaskId> = Vec::new();
        for id in &request.claim_tasks_by_id {
            if selected.len() >= request.size {
                break;
            }
            let Some(doc) = tasks.get(id) else { continue };
            let lease_expired = doc.retry_at.is_none_or(|retry_at| retry_at <= now);
            let eligible = match doc.status {
                TaskStatus::Idle => true,
                TaskStatus::Claiming | TaskStatus::Running => lease_expired,
                TaskStatus::Failed => false,
            };
            if eligible {
                selected.push(id.clone());
            }
        }

        // Fill the remainder with regular eligible work, expired leases
        // first, then FIFO by run_at.
        let mut regular: Vec<&TaskDocument> = tasks
            .values()
            .filter(|doc| doc.is_claimable_at(now) && !selected.contains(&doc.id))
            .collect();
        regular.sort_by_key(|doc| doc.claim_sort_key());
        selected.extend(
            regular
                .iter()
                .take(request.size.saturating_sub(selected.len()))
                .map(|doc| doc.id.clone()),
        );

        let mut docs = Vec::with_capacity(selected.len());
        for id in selected {
            let Some(doc) = tasks.get_mut(&id) else { continue };
            doc.status = TaskStatus::Claiming;
            doc.owner_id = Some(self.owner.clone());
            doc.retry_at = Some(request.claim_ownership_until);
            doc.started_at = Some(now);
            doc.attempts += 1;
            doc.version = self.advance_version();
            docs.push(doc.clone());
        }

        let claimed_count = docs.len();
        Ok(ClaimResult {
            docs,
            claimed_count,
        })
    }

    async fn update(&self, mut doc: TaskDocument) -> Result<TaskDocument> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;

        let Some(stored) = tasks.get_mut(&doc.id) else {
            return Err(Error::TaskNotFound {
                task_id: doc.id.clone(),
            });
        };

        if stored.version != doc.version {
            return Err(Error::VersionConflict {
                task_id: doc.id.clone(),
            });
        }

        doc.version = self.advance_version();
        *stored = doc.clone();
        Ok(doc)
    }

    async fn bulk_update(&self, docs: Vec<TaskDocument>) -> Result<Vec<Result<TaskDocument>>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            results.push(self.update(doc).await);
        }
        Ok(results)
    }

    async fn remove(&self, id: &TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        tasks.remove(id);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<TaskDocument> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        tasks.get(id).cloned().ok_or_else(|| Error::TaskNotFound {
            task_id: id.clone(),
        })
    }

    async fn fetch(&self, opts: SearchOpts) -> Result<FetchResult> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        let size = if opts.size == 0 {
            DEFAULT_FETCH_SIZE
        } else {
            opts.size
        };

        let mut matching: Vec<&TaskDocument> = tasks
            .values()
            .filter(|doc| {
                opts.task_type
                    .as_deref()
                    .is_none_or(|task_type| doc.task_type == task_type)
                    && opts.status.is_none_or(|status| doc.status == status)
            })
            .filter(|doc| {
                opts.search_after
                    .as_ref()
                    .is_none_or(|after| doc.id > *after)
            })
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let page: Vec<TaskDocument> = matching.iter().take(size).map(|doc| (*doc).clone()).collect();
        let search_after = if matching.len() > size {
            page.last().map(|doc| doc.id.clone())
        } else {
            None
        };

        Ok(FetchResult {
            docs: page,
            search_after,
        })
    }

    async fn get_lifecycle(&self, id: &TaskId) -> Result<Option<TaskStatus>> {
        let tasks = self.tasks.read().map_err(poison_err)?;
        Ok(tasks.get(id).map(|doc| doc.status))
    }

    fn error_stream(&self) -> broadcast::Receiver<StoreEvent> {
        self.errors.subscribe()
    }
}
