// ABOUTME: Ordered key-value engine binding over a single SQLite file with named tables.
// ABOUTME: Provides single-writer transactions, pooled snapshot readers, dup-sort tables, and a hard size cap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle read connections kept per engine.
const MAX_IDLE_READERS: usize = 16;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store has reached its maximum size")]
    Full,

    #[error("store is closed")]
    Closed,

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        if is_full(&err) {
            Self::Full
        } else {
            Self::Sqlite(err)
        }
    }
}

fn is_full(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull)
}

/// A named table inside the backing file.
#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    /// Allow many values per key, iterated in value order.
    pub dup_sort: bool,
}

impl TableDef {
    pub const fn single(name: &'static str) -> Self {
        Self {
            name,
            dup_sort: false,
        }
    }

    pub const fn dup_sort(name: &'static str) -> Self {
        Self {
            name,
            dup_sort: true,
        }
    }

    fn create_sql(&self) -> String {
        if self.dup_sort {
            format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    k BLOB NOT NULL,
                    v BLOB NOT NULL,
                    PRIMARY KEY (k, v)
                ) WITHOUT ROWID",
                self.name
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    k BLOB PRIMARY KEY NOT NULL,
                    v BLOB NOT NULL
                ) WITHOUT ROWID",
                self.name
            )
        }
    }
}

/// Read operations available inside both read and write transactions.
/// Keys and values are raw bytes compared with memcmp ordering.
pub trait KvRead {
    fn connection(&self) -> Result<&Connection, EngineError>;

    /// Value stored under `key`. For dup-sort tables, the smallest value.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT v FROM \"{table}\" WHERE k = ?1 ORDER BY v LIMIT 1"
        ))?;
        let value = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(value)
    }

    /// Highest key in the table.
    fn last_key(&self, table: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT k FROM \"{table}\" ORDER BY k DESC LIMIT 1"))?;
        let key = stmt.query_row([], |row| row.get(0)).optional()?;
        Ok(key)
    }

    /// Up to `limit` entries from the head of the table, in key order.
    fn scan(&self, table: &str, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let conn = self.connection()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT k, v FROM \"{table}\" ORDER BY k, v LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Every value stored under `key`, in value order.
    fn dups(&self, table: &str, key: &[u8]) -> Result<Vec<Vec<u8>>, EngineError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached(&format!("SELECT v FROM \"{table}\" WHERE k = ?1 ORDER BY v"))?;
        let rows = stmt.query_map(params![key], |row| row.get(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    /// Distinct keys in key order.
    fn keys(&self, table: &str) -> Result<Vec<Vec<u8>>, EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!("SELECT DISTINCT k FROM \"{table}\" ORDER BY k"))?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// First key holding `value`. Linear scan; values are not indexed.
    fn find_key(&self, table: &str, value: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT k FROM \"{table}\" WHERE v = ?1 ORDER BY k LIMIT 1"
        ))?;
        let key = stmt.query_row(params![value], |row| row.get(0)).optional()?;
        Ok(key)
    }

    /// Number of entries, as counted by the engine.
    fn entries(&self, table: &str) -> Result<u64, EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!("SELECT COUNT(*) FROM \"{table}\""))?;
        let count = stmt.query_row([], |row| row.get(0))?;
        Ok(count)
    }
}

/// Idle read-only connections, opened lazily.
struct ReadPool {
    path: PathBuf,
    idle: parking_lot::Mutex<Vec<Connection>>,
}

impl ReadPool {
    fn checkout(&self) -> Result<Connection, EngineError> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }

    fn drain(&self) {
        self.idle.lock().clear();
    }
}

/// A single backing file holding a fixed set of named tables.
///
/// Writers are serialized through one owned async lock, so at most one write
/// transaction is in flight per engine. Readers use their own connections and
/// snapshot transactions and never wait for the writer.
pub struct Engine {
    path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<Connection>>>,
    readers: ReadPool,
    closed: AtomicBool,
}

impl Engine {
    /// Open or create the backing file and declare its tables.
    /// The parent directory must already exist.
    pub fn open(path: &Path, max_size: u64, tables: &[TableDef]) -> Result<Self, EngineError> {
        let open_err = |source| EngineError::Open {
            path: path.to_path_buf(),
            source,
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(open_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(open_err)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(open_err)?;

        // Hard cap: SQLite answers SQLITE_FULL once the page budget is used up.
        let page_size: u64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .map_err(open_err)?;
        let max_pages = (max_size / page_size.max(1)).max(1);
        let _: u64 = conn
            .query_row(&format!("PRAGMA max_page_count = {max_pages}"), [], |row| {
                row.get(0)
            })
            .map_err(open_err)?;

        for table in tables {
            conn.execute_batch(&table.create_sql()).map_err(open_err)?;
        }

        tracing::debug!(
            "opened store {} ({} tables, max {} bytes)",
            path.display(),
            tables.len(),
            max_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            writer: Arc::new(Mutex::new(Some(conn))),
            readers: ReadPool {
                path: path.to_path_buf(),
                idle: parking_lot::Mutex::new(Vec::new()),
            },
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait for the writer lock and open an immediate write transaction.
    /// The lock is held until the returned transaction is committed,
    /// aborted, or dropped.
    pub async fn begin_write(&self) -> Result<WriteTxn, EngineError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let txn = WriteTxn {
            guard,
            finished: false,
        };
        txn.connection()?.execute_batch("BEGIN IMMEDIATE")?;
        Ok(txn)
    }

    /// Like `begin_write`, but returns `None` instead of waiting when another
    /// write transaction is in flight.
    pub fn try_begin_write(&self) -> Result<Option<WriteTxn>, EngineError> {
        let Ok(guard) = Arc::clone(&self.writer).try_lock_owned() else {
            return Ok(None);
        };
        let txn = WriteTxn {
            guard,
            finished: false,
        };
        txn.connection()?.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Some(txn))
    }

    /// Open a snapshot read transaction on a pooled connection.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let conn = self.readers.checkout()?;
        conn.execute_batch("BEGIN")?;
        Ok(ReadTxn {
            engine: self,
            conn: Some(conn),
        })
    }

    /// Flush the write-ahead log into the main file and release every
    /// connection. Later operations fail with `EngineError::Closed`.
    pub async fn close(&self) -> Result<(), EngineError> {
        let mut writer = self.writer.lock().await;
        self.closed.store(true, Ordering::Release);
        self.readers.drain();

        if let Some(conn) = writer.take() {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            conn.close().map_err(|(_, err)| EngineError::from(err))?;
            tracing::debug!("closed store {}", self.path.display());
        }
        Ok(())
    }
}

/// A snapshot read transaction. The snapshot is taken at the first read and
/// released when the transaction is dropped.
pub struct ReadTxn<'a> {
    engine: &'a Engine,
    conn: Option<Connection>,
}

impl KvRead for ReadTxn<'_> {
    fn connection(&self) -> Result<&Connection, EngineError> {
        self.conn.as_ref().ok_or(EngineError::Closed)
    }
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    tracing::debug!("failed to end read snapshot: {}", e);
                    return;
                }
            }
            if !self.engine.is_closed() {
                self.engine.readers.checkin(conn);
            }
        }
    }
}

/// The single in-flight write transaction of an engine. Holds the writer
/// lock; dropping it without `commit` rolls everything back.
pub struct WriteTxn {
    guard: OwnedMutexGuard<Option<Connection>>,
    finished: bool,
}

impl KvRead for WriteTxn {
    fn connection(&self) -> Result<&Connection, EngineError> {
        self.guard.as_ref().ok_or(EngineError::Closed)
    }
}

impl WriteTxn {
    /// Insert a new key. Fails if the key already exists.
    pub fn insert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare_cached(&format!("INSERT INTO \"{table}\" (k, v) VALUES (?1, ?2)"))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    /// Insert or overwrite the value of a single-value key.
    pub fn upsert(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO \"{table}\" (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v"
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    /// Store `value` under `key` and report whether a value was already there.
    pub fn replace(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<bool, EngineError> {
        let conn = self.connection()?;
        let updated = {
            let mut stmt =
                conn.prepare_cached(&format!("UPDATE \"{table}\" SET v = ?2 WHERE k = ?1"))?;
            stmt.execute(params![key, value])?
        };
        if updated > 0 {
            return Ok(true);
        }
        self.insert(table, key, value)?;
        Ok(false)
    }

    /// Add one more value under `key` in a dup-sort table. Identical pairs
    /// are stored once.
    pub fn put_dup(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT OR IGNORE INTO \"{table}\" (k, v) VALUES (?1, ?2)"
        ))?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    /// Remove `key` (every duplicate, for dup-sort tables). Returns whether
    /// anything was removed.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> Result<bool, EngineError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&format!("DELETE FROM \"{table}\" WHERE k = ?1"))?;
        let removed = stmt.execute(params![key])?;
        Ok(removed > 0)
    }

    /// Remove `key` and return its value.
    pub fn pop(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let value = self.get(table, key)?;
        if value.is_some() {
            self.delete(table, key)?;
        }
        Ok(value)
    }

    /// Remove every entry of the table.
    pub fn clear(&mut self, table: &str) -> Result<u64, EngineError> {
        let conn = self.connection()?;
        let removed = conn.execute(&format!("DELETE FROM \"{table}\""), [])?;
        Ok(removed as u64)
    }

    /// Make every change of this transaction durable and release the writer lock.
    pub fn commit(mut self) -> Result<(), EngineError> {
        self.finished = true;
        let conn = self.connection()?;
        if let Err(e) = conn.execute_batch("COMMIT") {
            rollback_quietly(conn);
            return Err(e.into());
        }
        Ok(())
    }

    /// Discard every change of this transaction and release the writer lock.
    pub fn abort(mut self) -> Result<(), EngineError> {
        self.finished = true;
        let conn = self.connection()?;
        // SQLite may already have rolled back on its own (e.g. after SQLITE_FULL).
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(conn) = self.guard.as_ref() {
            rollback_quietly(conn);
        }
    }
}

fn rollback_quietly(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::warn!("rollback failed: {}", e);
    }
}
