//! Write buffering over a task store.
//!
//! When several runners finish near-simultaneously, each wants a
//! single-document optimistic update. [`BufferedStore`] coalesces those
//! concurrent updates into bulk calls against the underlying store, sized
//! by the live worker ceiling, while every caller still observes its own
//! per-document result (success or version conflict).
//!
//! No cross-document ordering is promised; each document's own write order
//! is preserved because a caller only issues its next update after the
//! previous one resolved.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use capstan_core::TaskId;

use super::TaskStore;
use crate::document::TaskDocument;
use crate::error::{Error, Result};

/// One buffered write and the channel its result is routed back on.
struct BufferedUpdate {
    doc: TaskDocument,
    reply: oneshot::Sender<Result<TaskDocument>>,
}

/// Coalesces concurrent single-document updates into bulk store calls.
#[derive(Clone)]
pub struct BufferedStore {
    store: Arc<dyn TaskStore>,
    tx: mpsc::UnboundedSender<BufferedUpdate>,
}

impl BufferedStore {
    /// Wraps a store, spawning the background flush task.
    ///
    /// `max_batch` follows the live worker ceiling: there is never a
    /// reason to batch more writes than there are workers to produce them.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, max_batch: watch::Receiver<usize>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(flush_loop(Arc::clone(&store), rx, max_batch));
        Self { store, tx }
    }

    /// Optimistically updates a document through the buffer.
    ///
    /// # Errors
    ///
    /// Returns the per-document store result, `VersionConflict` included.
    pub async fn update(&self, doc: TaskDocument) -> Result<TaskDocument> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BufferedUpdate { doc, reply })
            .map_err(|_| Error::storage("buffered store flush task is gone"))?;
        response
            .await
            .map_err(|_| Error::storage("buffered store dropped a pending update"))?
    }

    /// Removes a document, bypassing the buffer (removals are idempotent
    /// and carry no version to coalesce).
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying store fails.
    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        self.store.remove(id).await
    }

    /// The wrapped store.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }
}

/// Drains buffered updates into bulk calls.
async fn flush_loop(
    store: Arc<dyn TaskStore>,
    mut rx: mpsc::UnboundedReceiver<BufferedUpdate>,
    max_batch: watch::Receiver<usize>,
) {
    while let Some(first) = rx.recv().await {
        let batch_size = (*max_batch.borrow()).max(1);
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(update) => batch.push(update),
                Err(_) => break,
            }
        }

        debug!(writes = batch.len(), "flushing buffered task updates");

        let (docs, replies): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|update| (update.doc, update.reply))
            .unzip();

        match store.bulk_update(docs).await {
            Ok(results) => {
                for (result, reply) in results.into_iter().zip(replies) {
                    let _ = reply.send(result);
                }
            }
            Err(err) => {
                // The round trip itself failed; every caller sees the same
                // storage diagnostic.
                let message = err.to_string();
                for reply in replies {
                    let _ = reply.send(Err(Error::storage(message.clone())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TaskInstance;
    use crate::store::memory::InMemoryTaskStore;
    use chrono::Utc;

    fn worker_watch(n: usize) -> (watch::Sender<usize>, watch::Receiver<usize>) {
        watch::channel(n)
    }

    async fn seeded_store(ids: &[&str]) -> Arc<InMemoryTaskStore> {
        let store = Arc::new(InMemoryTaskStore::new());
        let now = Utc::now();
        for id in ids {
            let doc = TaskInstance::new("sample")
                .with_id(TaskId::new(*id))
                .into_document_at(now);
            store.create(doc).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn update_resolves_per_caller() {
        let store = seeded_store(&["a", "b"]).await;
        let (_workers, workers_rx) = worker_watch(10);
        let buffered = BufferedStore::new(store.clone() as Arc<dyn TaskStore>, workers_rx);

        let mut doc_a = store.get(&TaskId::new("a")).await.unwrap();
        doc_a.attempts = 1;
        let mut doc_b = store.get(&TaskId::new("b")).await.unwrap();
        doc_b.attempts = 2;

        let (res_a, res_b) = tokio::join!(buffered.update(doc_a), buffered.update(doc_b));
        assert_eq!(res_a.unwrap().attempts, 1);
        assert_eq!(res_b.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn stale_write_surfaces_conflict_to_its_caller_only() {
        let store = seeded_store(&["a", "b"]).await;
        let (_workers, workers_rx) = worker_watch(10);
        let buffered = BufferedStore::new(store.clone() as Arc<dyn TaskStore>, workers_rx);

        let fresh = store.get(&TaskId::new("a")).await.unwrap();
        let stale = fresh.clone();
        store.update(fresh).await.unwrap();

        let good = store.get(&TaskId::new("b")).await.unwrap();

        let (res_stale, res_good) = tokio::join!(buffered.update(stale), buffered.update(good));
        assert!(res_stale.unwrap_err().is_version_conflict());
        assert!(res_good.is_ok());
    }

    #[tokio::test]
    async fn remove_passes_through() {
        let store = seeded_store(&["a"]).await;
        let (_workers, workers_rx) = worker_watch(10);
        let buffered = BufferedStore::new(store.clone() as Arc<dyn TaskStore>, workers_rx);

        buffered.remove(&TaskId::new("a")).await.unwrap();
        assert!(store.get(&TaskId::new("a")).await.is_err());
    }

    #[tokio::test]
    async fn many_concurrent_updates_all_resolve() {
        let ids: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let store = seeded_store(&id_refs).await;
        let (_workers, workers_rx) = worker_watch(4);
        let buffered = BufferedStore::new(store.clone() as Arc<dyn TaskStore>, workers_rx);

        let mut handles = Vec::new();
        for id in &ids {
            let buffered = buffered.clone();
            let store = store.clone();
            let id = TaskId::new(id.clone());
            handles.push(tokio::spawn(async move {
                let mut doc = store.get(&id).await.unwrap();
                doc.attempts = 5;
                buffered.update(doc).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
