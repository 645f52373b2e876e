// ABOUTME: Transactional task queue with batch peek-lock dequeue on top of the hash queue.
// ABOUTME: A dequeued batch stays invisible until its QueueTransaction commits, or reappears on abort.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eventrelay_core::{ContentHash, Hashed};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use ulid::Ulid;

use crate::engine::WriteTxn;
use crate::queue::{HashQueue, QueueError, QueueInfo, QueueOptions, QueueStats};

/// A deduplicating durable queue whose consumers take whole batches under
/// one write transaction.
pub struct TaskQueue<T> {
    inner: HashQueue<T>,
}

impl<T> TaskQueue<T>
where
    T: Hashed + Serialize + DeserializeOwned,
{
    pub fn open(path: &Path, options: QueueOptions) -> Result<Self, QueueError> {
        Ok(Self {
            inner: HashQueue::open(path, options)?,
        })
    }

    pub fn with_span(self, span: tracing::Span) -> Self {
        Self {
            inner: self.inner.with_span(span),
        }
    }

    pub async fn put(&self, item: &T) -> Result<bool, QueueError> {
        self.inner.put(item).await
    }

    /// Dequeue up to `max_items` head items as one batch.
    ///
    /// The returned transaction holds this queue's writer lock: commit or
    /// abort it within the unit of work that requested it.
    pub async fn get(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
        max_items: usize,
    ) -> Result<QueueTransaction<T>, QueueError> {
        let core = self.inner.core();
        let (txn, entries) = core
            .wait_until(blocking, timeout, move |wait| self.inner.take(max_items, wait))
            .await?;

        let (hashes, items) = entries.into_iter().unzip();
        let transaction = QueueTransaction {
            id: Ulid::new(),
            txn: Some(txn),
            items,
            hashes,
            notify: Arc::clone(&core.notify),
            span: core.span.clone(),
        };
        tracing::debug!(
            parent: &transaction.span,
            "transaction {} took {} items",
            transaction.id,
            transaction.len()
        );
        Ok(transaction)
    }

    /// Up to `max_items` head items, left in place. Empty when the queue is.
    pub fn peek(&self, max_items: usize) -> Result<Vec<T>, QueueError> {
        Ok(self
            .inner
            .peek_entries(max_items)?
            .into_iter()
            .map(|(_, item)| item)
            .collect())
    }

    pub fn peek_entries(&self, max_items: usize) -> Result<Vec<(ContentHash, T)>, QueueError> {
        self.inner.peek_entries(max_items)
    }

    pub fn peek_by_hash(&self, hash: &ContentHash) -> Result<Option<T>, QueueError> {
        self.inner.peek_by_hash(hash)
    }

    pub async fn unqueue_by_hash(&self, hash: &ContentHash) -> Result<bool, QueueError> {
        self.inner.unqueue_by_hash(hash).await
    }

    /// Discard every pending item, keeping the backing file.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        self.inner.purge().await
    }

    pub fn qsize(&self) -> Result<u64, QueueError> {
        self.inner.qsize()
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        self.inner.stats()
    }

    pub fn info(&self) -> Result<QueueInfo, QueueError> {
        self.inner.info()
    }

    pub fn options(&self) -> &QueueOptions {
        self.inner.options()
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

/// A batch removed from a `TaskQueue` but not yet settled.
///
/// Dropping it without calling `commit` or `abort` aborts.
pub struct QueueTransaction<T> {
    id: Ulid,
    txn: Option<WriteTxn>,
    items: Vec<T>,
    hashes: Vec<ContentHash>,
    notify: Arc<Notify>,
    span: tracing::Span,
}

impl<T> QueueTransaction<T> {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn hashes(&self) -> &[ContentHash] {
        &self.hashes
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Make the removal permanent.
    pub fn commit(mut self) -> Result<(), QueueError> {
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
            tracing::debug!(parent: &self.span, "transaction {} committed", self.id);
        }
        Ok(())
    }

    /// Put every item back where it was.
    pub fn abort(mut self) -> Result<(), QueueError> {
        if let Some(txn) = self.txn.take() {
            let result = txn.abort();
            self.notify.notify_waiters();
            result?;
            tracing::debug!(parent: &self.span, "transaction {} aborted", self.id);
        }
        Ok(())
    }
}

impl<T> Drop for QueueTransaction<T> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            tracing::warn!(
                parent: &self.span,
                "transaction {} dropped without commit or abort, aborting",
                self.id
            );
            if let Err(e) = txn.abort() {
                tracing::error!(parent: &self.span, "abort of transaction {} failed: {}", self.id, e);
            }
            self.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay_core::StatusUpdate;
    use tempfile::TempDir;

    fn open_queue(dir: &TempDir) -> TaskQueue<StatusUpdate> {
        TaskQueue::open(&dir.path().join("tasks.db"), QueueOptions::default()).unwrap()
    }

    async fn fill(queue: &TaskQueue<StatusUpdate>, ids: &[&str]) {
        for id in ids {
            queue.put(&StatusUpdate::new(*id, "New")).await.unwrap();
        }
    }

    fn snapshot(queue: &TaskQueue<StatusUpdate>) -> Vec<(ContentHash, StatusUpdate)> {
        queue.peek_entries(usize::MAX).unwrap()
    }

    #[tokio::test]
    async fn batch_get_takes_head_items() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B", "C"]).await;

        let txn = queue.get(false, None, 2).await.unwrap();
        let ids: Vec<&str> = txn.items().iter().map(|u| u.event_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(txn.hashes()[0], StatusUpdate::new("A", "").content_hash());
        txn.commit().unwrap();

        assert_eq!(queue.qsize().unwrap(), 1);
        assert_eq!(queue.peek(10).unwrap()[0].event_id, "C");
        assert!(queue.stats().unwrap().consistent());
    }

    #[tokio::test]
    async fn abort_restores_exact_content() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B", "C", "D"]).await;
        queue.put(&StatusUpdate::new("B", "Resolved")).await.unwrap();

        let before = snapshot(&queue);
        let txn = queue.get(false, None, 3).await.unwrap();
        assert_eq!(txn.len(), 3);
        txn.abort().unwrap();

        assert_eq!(snapshot(&queue), before);
        assert!(queue.stats().unwrap().consistent());
    }

    #[tokio::test]
    async fn dropped_transaction_aborts() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B"]).await;

        let before = snapshot(&queue);
        {
            let _txn = queue.get(false, None, 10).await.unwrap();
        }
        assert_eq!(snapshot(&queue), before);
    }

    #[tokio::test]
    async fn empty_queue_behaviour() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);

        assert!(matches!(
            queue.get(false, None, 5).await,
            Err(QueueError::Empty)
        ));
        assert!(queue.peek(5).unwrap().is_empty());
        assert!(matches!(
            queue.get(true, Some(Duration::from_millis(50)), 5).await,
            Err(QueueError::Empty)
        ));
    }

    #[tokio::test]
    async fn readers_see_queue_while_batch_is_open() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B"]).await;

        let txn = queue.get(false, None, 1).await.unwrap();
        // Snapshot readers still see the committed state.
        assert_eq!(queue.qsize().unwrap(), 2);
        assert_eq!(queue.peek(10).unwrap().len(), 2);
        txn.commit().unwrap();
        assert_eq!(queue.qsize().unwrap(), 1);
    }

    #[tokio::test]
    async fn abort_wakes_blocked_getter() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open_queue(&dir));
        fill(&queue, &["A"]).await;

        let txn = queue.get(false, None, 1).await.unwrap();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let txn = queue
                    .get(true, Some(Duration::from_secs(5)), 1)
                    .await
                    .unwrap();
                let id = txn.items()[0].event_id.clone();
                txn.commit().unwrap();
                id
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        txn.abort().unwrap();
        assert_eq!(waiter.await.unwrap(), "A");
        assert_eq!(queue.qsize().unwrap(), 0);
    }

    #[tokio::test]
    async fn non_blocking_get_returns_at_once_while_batch_is_open() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B"]).await;

        let held = queue.get(false, None, 1).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), queue.get(false, None, 1))
            .await
            .expect("non-blocking get must not wait for the open batch");
        assert!(matches!(second, Err(QueueError::Empty)));

        held.commit().unwrap();
        let txn = queue.get(false, None, 1).await.unwrap();
        assert_eq!(txn.items()[0].event_id, "B");
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn blocking_get_timeout_covers_open_batch() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open_queue(&dir));
        fill(&queue, &["A", "B"]).await;

        let held = queue.get(false, None, 1).await.unwrap();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                let result = queue.get(true, Some(Duration::from_millis(100)), 1).await;
                (result.is_err(), started.elapsed())
            })
        };

        let (timed_out, elapsed) = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("getter must give up after its own timeout")
            .unwrap();
        assert!(timed_out);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));

        held.commit().unwrap();
        assert_eq!(queue.qsize().unwrap(), 1);
    }

    #[tokio::test]
    async fn blocking_get_without_timeout_waits_for_put() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(open_queue(&dir));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let txn = queue.get(true, None, 10).await.unwrap();
                let ids: Vec<String> = txn.items().iter().map(|u| u.event_id.clone()).collect();
                txn.commit().unwrap();
                ids
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        queue.put(&StatusUpdate::new("late", "New")).await.unwrap();

        let ids = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ids, vec!["late"]);
        assert_eq!(queue.qsize().unwrap(), 0);
    }

    #[tokio::test]
    async fn max_items_zero_takes_one() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B"]).await;

        let txn = queue.get(false, None, 0).await.unwrap();
        assert_eq!(txn.len(), 1);
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn corrupt_payload_is_removed_on_get() {
        let dir = TempDir::new().unwrap();
        let queue = open_queue(&dir);
        fill(&queue, &["A", "B"]).await;

        let bad = StatusUpdate::new("A", "").content_hash();
        {
            let core = queue.inner.core();
            let mut txn = core.engine.begin_write().await.unwrap();
            txn.upsert(crate::queue::HASHES.name, bad.as_bytes(), b"{not json")
                .unwrap();
            txn.commit().unwrap();
        }

        assert_eq!(queue.peek(10).unwrap().len(), 1);
        let txn = queue.get(false, None, 10).await.unwrap();
        assert_eq!(txn.items()[0].event_id, "B");
        txn.commit().unwrap();
        assert_eq!(queue.qsize().unwrap(), 0);
        assert!(queue.stats().unwrap().consistent());
    }
}
