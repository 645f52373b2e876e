// ABOUTME: Durable FIFO queues on the engine binding: a plain queue and a hash-deduplicating queue.
// ABOUTME: Re-enqueuing an item with a known content hash replaces its payload without moving it.

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eventrelay_core::{ContentHash, HashError, Hashed};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::{Codec, CodecError, Sequence, decode_serial, encode_serial};
use crate::engine::{Engine, EngineError, KvRead, TableDef, WriteTxn};

/// serial -> payload (plain queue) or serial -> content hash (hash queue).
pub(crate) const QUEUE: TableDef = TableDef::single("queue");
/// content hash -> payload.
pub(crate) const HASHES: TableDef = TableDef::single("hashes");

pub const DEFAULT_QUEUE_NAME: &str = "queue";
pub const DEFAULT_QUEUE_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot open queue at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,

    #[error("queue is empty")]
    Empty,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("stored hash is invalid: {0}")]
    Hash(#[from] HashError),

    #[error("engine error: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for QueueError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Open { path, source } => Self::Open { path, source },
            EngineError::Full => Self::Full,
            EngineError::Closed => Self::Closed,
            other => Self::Engine(other),
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub name: String,
    /// Hard cap of the backing file, in bytes.
    pub max_size: u64,
    pub compression: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            max_size: DEFAULT_QUEUE_MAX_SIZE,
            compression: false,
        }
    }
}

/// Descriptive summary returned by `GET /queue?info=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub queue_name: String,
    pub queue_path: String,
    pub max_disk_size: u64,
    pub compression: bool,
    pub entries: u64,
}

/// Row counts of both queue tables. They are equal unless an index is damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_entries: u64,
    pub hash_entries: u64,
}

impl QueueStats {
    pub fn consistent(&self) -> bool {
        self.queue_entries == self.hash_entries
    }
}

/// State shared by every queue flavour: the engine, the serial counter, and
/// the wake-up signal for blocked getters.
pub(crate) struct QueueCore {
    pub(crate) engine: Engine,
    pub(crate) codec: Codec,
    pub(crate) sequence: Sequence,
    pub(crate) notify: Arc<Notify>,
    pub(crate) options: QueueOptions,
    pub(crate) span: tracing::Span,
}

impl QueueCore {
    fn open(path: &Path, options: QueueOptions, tables: &[TableDef]) -> Result<Self, QueueError> {
        let engine = Engine::open(path, options.max_size, tables)?;
        let last_key = {
            let read = engine.begin_read()?;
            read.last_key(QUEUE.name)?
        };
        let sequence = Sequence::starting_after(last_key.as_deref())?;

        Ok(Self {
            engine,
            codec: Codec::new(options.compression),
            sequence,
            notify: Arc::new(Notify::new()),
            options,
            span: tracing::Span::none(),
        })
    }

    /// Run `attempt` until it yields something other than `Empty`.
    ///
    /// Non-blocking callers get exactly one attempt, which must not wait for
    /// the writer lock (`attempt(false)`). Blocking callers sleep on the
    /// put/abort notification between attempts, until `timeout` elapses
    /// (forever when `timeout` is None); the deadline also bounds the wait
    /// for the writer lock inside each attempt.
    pub(crate) async fn wait_until<R, F, Fut>(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
        mut attempt: F,
    ) -> Result<R, QueueError>
    where
        F: FnMut(bool) -> Fut,
        Fut: Future<Output = Result<R, QueueError>>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register before looking so a put between the attempt and the
            // wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let result = match (blocking, deadline) {
                (false, _) => attempt(false).await,
                (true, None) => attempt(true).await,
                (true, Some(deadline)) => {
                    match tokio::time::timeout_at(deadline, attempt(true)).await {
                        Ok(result) => result,
                        Err(_) => return Err(QueueError::Empty),
                    }
                }
            };
            match result {
                Err(QueueError::Empty) if blocking => {}
                other => return other,
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(QueueError::Empty);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Writer transaction for a dequeue. Without `wait`, a writer held by
    /// someone else (usually an open batch, whose items are invisible anyway)
    /// reads as an empty queue.
    async fn begin_write(&self, wait: bool) -> Result<WriteTxn, QueueError> {
        if wait {
            return Ok(self.engine.begin_write().await?);
        }
        match self.engine.try_begin_write()? {
            Some(txn) => Ok(txn),
            None => Err(QueueError::Empty),
        }
    }

    fn qsize(&self) -> Result<u64, QueueError> {
        let read = self.engine.begin_read()?;
        Ok(read.entries(QUEUE.name)?)
    }

    fn info(&self) -> Result<QueueInfo, QueueError> {
        Ok(QueueInfo {
            queue_name: self.options.name.clone(),
            queue_path: self.engine.path().display().to_string(),
            max_disk_size: self.options.max_size,
            compression: self.options.compression,
            entries: self.qsize()?,
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.engine.close().await?;
        self.notify.notify_waiters();
        tracing::debug!(parent: &self.span, "queue {} closed", self.options.name);
        Ok(())
    }
}

/// A durable FIFO queue without deduplication.
pub struct PlainQueue<T> {
    core: QueueCore,
    _item: PhantomData<fn() -> T>,
}

impl<T> PlainQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open(path: &Path, options: QueueOptions) -> Result<Self, QueueError> {
        Ok(Self {
            core: QueueCore::open(path, options, &[QUEUE])?,
            _item: PhantomData,
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.core.span = span;
        self
    }

    /// Append `item` at the tail.
    pub async fn put(&self, item: &T) -> Result<(), QueueError> {
        let bytes = self.core.codec.encode(item)?;
        let mut txn = self.core.engine.begin_write().await?;
        let serial = self.core.sequence.next();
        txn.insert(QUEUE.name, &encode_serial(serial), &bytes)?;
        txn.commit()?;

        self.core.notify.notify_waiters();
        tracing::trace!(parent: &self.core.span, "queued item {}", serial);
        Ok(())
    }

    /// Remove and return the head item. See `QueueCore::wait_until` for the
    /// blocking rules.
    pub async fn get(&self, blocking: bool, timeout: Option<Duration>) -> Result<T, QueueError> {
        self.core
            .wait_until(blocking, timeout, move |wait| self.try_get(wait))
            .await
    }

    /// The head item, left in place.
    pub fn peek(&self) -> Result<T, QueueError> {
        let read = self.core.engine.begin_read()?;
        let (_, bytes) = read
            .scan(QUEUE.name, 1)?
            .into_iter()
            .next()
            .ok_or(QueueError::Empty)?;
        Ok(self.core.codec.decode(&bytes)?)
    }

    /// Live entry count, read from the engine.
    pub fn qsize(&self) -> Result<u64, QueueError> {
        self.core.qsize()
    }

    pub fn info(&self) -> Result<QueueInfo, QueueError> {
        self.core.info()
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.core.close().await
    }

    async fn try_get(&self, wait: bool) -> Result<T, QueueError> {
        let mut txn = self.core.begin_write(wait).await?;
        loop {
            let Some((key, bytes)) = txn.scan(QUEUE.name, 1)?.into_iter().next() else {
                txn.commit()?;
                return Err(QueueError::Empty);
            };
            txn.delete(QUEUE.name, &key)?;
            match self.core.codec.decode(&bytes) {
                Ok(item) => {
                    txn.commit()?;
                    return Ok(item);
                }
                Err(e) => tracing::warn!(
                    parent: &self.core.span,
                    "dropping undecodable item {}: {}",
                    decode_serial(&key).unwrap_or_default(),
                    e
                ),
            }
        }
    }
}

/// A durable FIFO queue that deduplicates by content hash.
///
/// Two tables back it: `queue` orders content hashes by serial and `hashes`
/// holds the latest payload per hash. Both always hold the same set of hashes.
pub struct HashQueue<T> {
    core: QueueCore,
    _item: PhantomData<fn() -> T>,
}

impl<T> HashQueue<T>
where
    T: Hashed + Serialize + DeserializeOwned,
{
    pub fn open(path: &Path, options: QueueOptions) -> Result<Self, QueueError> {
        Ok(Self {
            core: QueueCore::open(path, options, &[QUEUE, HASHES])?,
            _item: PhantomData,
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.core.span = span;
        self
    }

    pub(crate) fn core(&self) -> &QueueCore {
        &self.core
    }

    /// Enqueue `item`. If an item with the same hash is pending, its payload
    /// is replaced in place and keeps its position. Returns true in that case.
    pub async fn put(&self, item: &T) -> Result<bool, QueueError> {
        let hash = item.content_hash();
        let bytes = self.core.codec.encode(item)?;

        let mut txn = self.core.engine.begin_write().await?;
        let coalesced = txn.replace(HASHES.name, hash.as_bytes(), &bytes)?;
        if !coalesced {
            let serial = self.core.sequence.next();
            txn.insert(QUEUE.name, &encode_serial(serial), hash.as_bytes())?;
        }
        txn.commit()?;

        self.core.notify.notify_waiters();
        if coalesced {
            tracing::debug!(parent: &self.core.span, "updated pending item {}", hash);
        } else {
            tracing::trace!(parent: &self.core.span, "queued item {}", hash);
        }
        Ok(coalesced)
    }

    /// Remove and return the head item.
    pub async fn get(&self, blocking: bool, timeout: Option<Duration>) -> Result<T, QueueError> {
        let (txn, mut items) = self
            .core
            .wait_until(blocking, timeout, move |wait| self.take(1, wait))
            .await?;
        txn.commit()?;
        items.pop().map(|(_, item)| item).ok_or(QueueError::Empty)
    }

    /// The head item, left in place.
    pub fn peek(&self) -> Result<T, QueueError> {
        self.peek_entries(1)?
            .into_iter()
            .next()
            .map(|(_, item)| item)
            .ok_or(QueueError::Empty)
    }

    /// Up to `max_items` head items with their hashes, left in place.
    /// Undecodable payloads are skipped.
    pub fn peek_entries(&self, max_items: usize) -> Result<Vec<(ContentHash, T)>, QueueError> {
        let read = self.core.engine.begin_read()?;
        let mut entries = Vec::new();
        for (serial_key, hash_bytes) in read.scan(QUEUE.name, max_items)? {
            let serial = decode_serial(&serial_key).unwrap_or_default();
            let hash = match ContentHash::from_slice(&hash_bytes) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(parent: &self.core.span, "serial {} holds a bad hash: {}", serial, e);
                    continue;
                }
            };
            let Some(bytes) = read.get(HASHES.name, &hash_bytes)? else {
                tracing::warn!(parent: &self.core.span, "serial {} points at missing item {}", serial, hash);
                continue;
            };
            match self.core.codec.decode(&bytes) {
                Ok(item) => entries.push((hash, item)),
                Err(e) => tracing::warn!(parent: &self.core.span, "skipping undecodable item {}: {}", hash, e),
            }
        }
        Ok(entries)
    }

    /// Direct lookup of a pending item by hash, regardless of its position.
    pub fn peek_by_hash(&self, hash: &ContentHash) -> Result<Option<T>, QueueError> {
        let read = self.core.engine.begin_read()?;
        match read.get(HASHES.name, hash.as_bytes())? {
            Some(bytes) => Ok(Some(self.core.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a pending item by hash. Returns true only when both of its rows
    /// were removed; a one-sided removal is logged as index damage.
    pub async fn unqueue_by_hash(&self, hash: &ContentHash) -> Result<bool, QueueError> {
        let mut txn = self.core.engine.begin_write().await?;
        let serial_removed = match txn.find_key(QUEUE.name, hash.as_bytes())? {
            Some(serial_key) => txn.delete(QUEUE.name, &serial_key)?,
            None => false,
        };
        let payload_removed = txn.delete(HASHES.name, hash.as_bytes())?;
        txn.commit()?;

        if serial_removed != payload_removed {
            tracing::warn!(
                parent: &self.core.span,
                "queue index mismatch while removing {} (serial removed: {}, payload removed: {})",
                hash,
                serial_removed,
                payload_removed
            );
        }
        Ok(serial_removed && payload_removed)
    }

    /// Empty both tables, keeping the backing file. Returns the number of
    /// queued entries that were discarded.
    pub async fn purge(&self) -> Result<u64, QueueError> {
        let mut txn = self.core.engine.begin_write().await?;
        let removed = txn.clear(QUEUE.name)?;
        txn.clear(HASHES.name)?;
        txn.commit()?;

        tracing::info!(parent: &self.core.span, "purged {} items from {}", removed, self.core.options.name);
        Ok(removed)
    }

    pub fn qsize(&self) -> Result<u64, QueueError> {
        self.core.qsize()
    }

    /// Row counts of both tables from one snapshot. Logs a warning when they differ.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let read = self.core.engine.begin_read()?;
        let stats = QueueStats {
            queue_entries: read.entries(QUEUE.name)?,
            hash_entries: read.entries(HASHES.name)?,
        };
        if !stats.consistent() {
            tracing::warn!(
                parent: &self.core.span,
                "queue {} tables disagree: {} serials, {} payloads",
                self.core.options.name,
                stats.queue_entries,
                stats.hash_entries
            );
        }
        Ok(stats)
    }

    pub fn info(&self) -> Result<QueueInfo, QueueError> {
        self.core.info()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.core.options
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.core.close().await
    }

    /// Open a write transaction and remove up to `max_items` head items inside
    /// it. The caller decides whether the removal sticks. Undecodable payloads
    /// are dropped; if nothing decodable is found the removal is committed and
    /// the scan starts over. Without `wait`, a busy writer counts as empty.
    pub(crate) async fn take(
        &self,
        max_items: usize,
        wait: bool,
    ) -> Result<(WriteTxn, Vec<(ContentHash, T)>), QueueError> {
        loop {
            let mut txn = self.core.begin_write(wait).await?;
            let head = txn.scan(QUEUE.name, max_items.max(1))?;
            if head.is_empty() {
                txn.abort()?;
                return Err(QueueError::Empty);
            }

            let mut items = Vec::with_capacity(head.len());
            for (serial_key, hash_bytes) in head {
                txn.delete(QUEUE.name, &serial_key)?;
                let payload = txn.pop(HASHES.name, &hash_bytes)?;
                let serial = decode_serial(&serial_key).unwrap_or_default();

                let hash = match ContentHash::from_slice(&hash_bytes) {
                    Ok(hash) => hash,
                    Err(e) => {
                        tracing::warn!(parent: &self.core.span, "dropping serial {} with bad hash: {}", serial, e);
                        continue;
                    }
                };
                let Some(payload) = payload else {
                    tracing::warn!(parent: &self.core.span, "dropping serial {} for missing item {}", serial, hash);
                    continue;
                };
                match self.core.codec.decode(&payload) {
                    Ok(item) => items.push((hash, item)),
                    Err(e) => {
                        tracing::warn!(parent: &self.core.span, "dropping undecodable item {}: {}", hash, e)
                    }
                }
            }

            if !items.is_empty() {
                return Ok((txn, items));
            }
            txn.commit()?;
        }
    }
}
