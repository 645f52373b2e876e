// ABOUTME: Persistence layer for eventrelay, built on an ordered key-value binding over SQLite.
// ABOUTME: Provides the per-entity delta store, the durable queue family, and the home directory manager.

pub mod codec;
pub mod delta_store;
pub mod engine;
pub mod manager;
pub mod queue;
pub mod task_queue;

pub use codec::{Codec, CodecError, Sequence};
pub use delta_store::{Clock, DeltaStore, DeltaStoreError, SystemClock};
pub use engine::{Engine, EngineError, KvRead, ReadTxn, TableDef, WriteTxn};
pub use manager::{ManagerError, StorageManager};
pub use queue::{HashQueue, PlainQueue, QueueError, QueueInfo, QueueOptions, QueueStats};
pub use task_queue::{QueueTransaction, TaskQueue};
