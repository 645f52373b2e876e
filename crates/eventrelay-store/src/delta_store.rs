// ABOUTME: Per-entity append-only delta log reduced on read through a JSON merge schema.
// ABOUTME: Tracks the last-touch time of every entity so stale entities can be found and retired.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use eventrelay_core::MergeSchema;
use serde_json::Value;
use thiserror::Error;

use crate::codec::{Codec, CodecError, Sequence, decode_serial, encode_serial};
use crate::engine::{Engine, EngineError, KvRead, TableDef, WriteTxn};

const DELTAS: TableDef = TableDef::single("deltas");
const INDEX: TableDef = TableDef::dup_sort("index");
const MTIMES: TableDef = TableDef::single("mtimes");

/// Errors that can occur during delta store operations.
#[derive(Debug, Error)]
pub enum DeltaStoreError {
    #[error("cannot open delta store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("delta store is full")]
    Full,

    #[error("delta store is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("engine error: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for DeltaStoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Open { path, source } => Self::Open { path, source },
            EngineError::Full => Self::Full,
            EngineError::Closed => Self::Closed,
            other => Self::Engine(other),
        }
    }
}

/// Source of "now" for last-touch bookkeeping, in milliseconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Append-only delta log for many entities, sharing one backing file.
///
/// Writes (`append`, `delete`, `cleanup`) are serialized by the engine's
/// writer lock; reads run against snapshots and never wait for writers.
pub struct DeltaStore {
    engine: Engine,
    codec: Codec,
    sequence: Sequence,
    schema: MergeSchema,
    clock: Arc<dyn Clock>,
    span: tracing::Span,
}

impl DeltaStore {
    /// Open or create a delta store. The record counter continues after the
    /// highest record already on disk.
    pub fn open(path: &Path, max_size: u64, schema: MergeSchema) -> Result<Self, DeltaStoreError> {
        let engine = Engine::open(path, max_size, &[DELTAS, INDEX, MTIMES])?;
        let last_key = {
            let read = engine.begin_read()?;
            read.last_key(DELTAS.name)?
        };
        let sequence = Sequence::starting_after(last_key.as_deref())?;

        Ok(Self {
            engine,
            codec: Codec::compressed(),
            sequence,
            schema,
            clock: Arc::new(SystemClock),
            span: tracing::Span::none(),
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        self.engine.path()
    }

    pub fn schema(&self) -> &MergeSchema {
        &self.schema
    }

    /// Record one more delta for `entity_id` and refresh its last-touch time.
    /// Returns the serial assigned to the delta.
    pub async fn append(&self, entity_id: &str, delta: &Value) -> Result<u64, DeltaStoreError> {
        let bytes = self.codec.encode(delta)?;

        let mut txn = self.engine.begin_write().await?;
        let serial = self.sequence.next();
        let key = encode_serial(serial);
        txn.insert(DELTAS.name, &key, &bytes)?;
        txn.put_dup(INDEX.name, entity_id.as_bytes(), &key)?;

        let previous = txn
            .get(MTIMES.name, entity_id.as_bytes())?
            .and_then(|raw| decode_serial(&raw).ok())
            .unwrap_or(0);
        let touched = self.clock.now_ms().max(previous);
        txn.upsert(MTIMES.name, entity_id.as_bytes(), &touched.to_be_bytes())?;
        txn.commit()?;

        tracing::debug!(parent: &self.span, "appended delta {} for {}", serial, entity_id);
        Ok(serial)
    }

    /// Current state of `entity_id`: every delta folded through the merge
    /// schema in insertion order. Unknown entities yield an empty object.
    pub fn get_merged(&self, entity_id: &str) -> Result<Value, DeltaStoreError> {
        let read = self.engine.begin_read()?;
        self.merged(&read, entity_id)
    }

    /// Merged documents for every known entity, in entity id order.
    pub fn get_all(&self) -> Result<Vec<Value>, DeltaStoreError> {
        let read = self.engine.begin_read()?;
        let mut docs = Vec::new();
        for id in read.keys(INDEX.name)? {
            docs.push(self.merged(&read, &String::from_utf8_lossy(&id))?);
        }
        Ok(docs)
    }

    /// Every known entity id, in index order.
    pub fn entity_ids(&self) -> Result<Vec<String>, DeltaStoreError> {
        let read = self.engine.begin_read()?;
        let ids = read
            .keys(INDEX.name)?
            .into_iter()
            .map(|id| String::from_utf8_lossy(&id).into_owned())
            .collect();
        Ok(ids)
    }

    /// Merged documents of entities untouched for at least `max_age_secs`.
    pub fn get_untouched(&self, max_age_secs: u64) -> Result<Vec<Value>, DeltaStoreError> {
        Ok(self
            .untouched(max_age_secs)?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect())
    }

    /// Like `get_untouched`, keeping each document paired with its entity id.
    pub fn untouched(&self, max_age_secs: u64) -> Result<Vec<(String, Value)>, DeltaStoreError> {
        let read = self.engine.begin_read()?;
        let mut found = Vec::new();
        for id in self.stale_ids(&read, max_age_secs)? {
            let doc = self.merged(&read, &id)?;
            found.push((id, doc));
        }
        Ok(found)
    }

    /// Remove every trace of `entity_id`. Returns whether anything was removed;
    /// unknown ids are not an error.
    pub async fn delete(&self, entity_id: &str) -> Result<bool, DeltaStoreError> {
        let mut txn = self.engine.begin_write().await?;
        let removed = Self::delete_in(&mut txn, entity_id)?;
        txn.commit()?;

        if removed {
            tracing::debug!(parent: &self.span, "deleted entity {}", entity_id);
        }
        Ok(removed)
    }

    /// Remove `entity_id` only if it is still untouched for at least
    /// `max_age_secs` inside the deleting transaction. Returns false when the
    /// entity was refreshed since it was found stale, or is unknown.
    pub async fn delete_if_untouched(
        &self,
        entity_id: &str,
        max_age_secs: u64,
    ) -> Result<bool, DeltaStoreError> {
        let mut txn = self.engine.begin_write().await?;
        let touched = txn
            .get(MTIMES.name, entity_id.as_bytes())?
            .and_then(|raw| decode_serial(&raw).ok());
        if !touched.is_some_and(|ms| self.is_stale(ms, max_age_secs)) {
            txn.abort()?;
            tracing::debug!(parent: &self.span, "{} is no longer stale, keeping it", entity_id);
            return Ok(false);
        }

        let removed = Self::delete_in(&mut txn, entity_id)?;
        txn.commit()?;
        if removed {
            tracing::debug!(parent: &self.span, "deleted stale entity {}", entity_id);
        }
        Ok(removed)
    }

    /// Delete every entity untouched for at least `max_age_secs`, in one
    /// transaction. Returns how many entities were removed.
    pub async fn cleanup(&self, max_age_secs: u64) -> Result<usize, DeltaStoreError> {
        let mut txn = self.engine.begin_write().await?;
        let stale = self.stale_ids(&txn, max_age_secs)?;
        for id in &stale {
            Self::delete_in(&mut txn, id)?;
        }
        txn.commit()?;

        tracing::info!(
            parent: &self.span,
            "cleanup removed {} entities older than {}s",
            stale.len(),
            max_age_secs
        );
        Ok(stale.len())
    }

    /// Flush and release the backing file.
    pub async fn close(&self) -> Result<(), DeltaStoreError> {
        self.engine.close().await?;
        tracing::debug!(parent: &self.span, "delta store closed");
        Ok(())
    }

    fn merged(&self, read: &impl KvRead, entity_id: &str) -> Result<Value, DeltaStoreError> {
        let keys = read.dups(INDEX.name, entity_id.as_bytes())?;
        let mut deltas = Vec::with_capacity(keys.len());
        for key in keys {
            let serial = decode_serial(&key).unwrap_or_default();
            let Some(bytes) = read.get(DELTAS.name, &key)? else {
                tracing::warn!(
                    parent: &self.span,
                    "entity {} references missing delta {}, skipping",
                    entity_id,
                    serial
                );
                continue;
            };
            match self.codec.decode::<Value>(&bytes) {
                Ok(delta) => deltas.push(delta),
                Err(e) => tracing::warn!(
                    parent: &self.span,
                    "skipping undecodable delta {} of {}: {}",
                    serial,
                    entity_id,
                    e
                ),
            }
        }
        Ok(self.schema.reduce(deltas))
    }

    fn is_stale(&self, touched_ms: u64, max_age_secs: u64) -> bool {
        self.clock.now_ms().saturating_sub(touched_ms) >= max_age_secs.saturating_mul(1000)
    }

    fn stale_ids(&self, read: &impl KvRead, max_age_secs: u64) -> Result<Vec<String>, DeltaStoreError> {
        let mut ids = Vec::new();
        for (id, raw) in read.scan(MTIMES.name, usize::MAX)? {
            let id = String::from_utf8_lossy(&id).into_owned();
            let touched = match decode_serial(&raw) {
                Ok(ms) => ms,
                Err(e) => {
                    tracing::warn!(parent: &self.span, "bad last-touch value for {}: {}", id, e);
                    continue;
                }
            };
            if self.is_stale(touched, max_age_secs) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn delete_in(txn: &mut WriteTxn, entity_id: &str) -> Result<bool, EngineError> {
        let keys = txn.dups(INDEX.name, entity_id.as_bytes())?;
        for key in &keys {
            txn.delete(DELTAS.name, key)?;
        }
        let indexed = txn.delete(INDEX.name, entity_id.as_bytes())?;
        let touched = txn.delete(MTIMES.name, entity_id.as_bytes())?;
        Ok(indexed || touched)
    }
}
