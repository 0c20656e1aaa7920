//! # mvdb Core
//!
//! MVCC transactional storage core for mvdb.
//!
//! This crate provides:
//! - A versioned record model: every key holds a chain of committed
//!   versions, optionally topped by one transaction's pending write
//! - Copy-on-write B-tree maps persisted in append-only chunk files, with
//!   row or column leaf layouts
//! - Transactions with read-committed and repeatable-read isolation,
//!   row locks, savepoints and undo-log rollback
//! - A redo log that makes commits durable before they become visible
//! - Checkpoints that persist maps, trim the log and reclaim chunks
//! - Cooperative schedulers that park tasks blocked on a row lock
//!
//! ## Example
//!
//! ```rust,ignore
//! use mvdb_core::{Config, TransactionEngine, TransactionOptions};
//! use mvdb_codec::Value;
//!
//! let engine = TransactionEngine::open_in_memory(Config::default())?;
//! let txn = engine.begin(TransactionOptions::default())?;
//! txn.open_map::<Value>("users")?.put(1, Value::from("alice"))?;
//! txn.commit()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
mod checkpoint;
mod config;
mod context;
mod engine;
mod error;
pub mod manifest;
pub mod record;
pub mod redo;
pub mod scheduler;
mod storage;
mod transaction;
mod types;

pub use btree::{BTreeCursor, BTreeMap, CursorParameters, Mutation};
pub use checkpoint::{CheckpointReport, CheckpointService, CheckpointStats, Latch};
pub use config::{Compression, Config, LockWaitPolicy, LogSyncPolicy, MapConfig, StorageConfig};
pub use context::{EngineContext, MemoryPool};
pub use engine::TransactionEngine;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use record::{MapValue, ReadView, TransactionalValue, VersionedValue};
pub use scheduler::{Scheduler, SchedulerPool, Service, Task, TaskStatus};
pub use storage::{PersistOutcome, Storage, VerifyReport};
pub use transaction::{
    Transaction, TransactionCursor, TransactionManager, TransactionMap, TransactionOptions,
    TransactionState,
};
pub use types::{
    CheckpointMark, ChunkId, IsolationLevel, LogPosition, PagePos, PageStorageMode, TransactionId,
};
