//! The transaction engine.
//!
//! [`TransactionEngine`] ties storage, the redo log, the transaction
//! registry, the checkpoint service and the schedulers together. Opening
//! an engine recovers the state of the last checkpoint plus every commit
//! found in the redo log after it; committed changes for a map are applied
//! when the map is first opened.

use crate::btree::BTreeMap;
use crate::checkpoint::{CheckpointReport, CheckpointService, CheckpointStats, Latch};
use crate::config::{Config, LockWaitPolicy, MapConfig};
use crate::context::EngineContext;
use crate::error::{CoreError, CoreResult};
use crate::record::{MapValue, TransactionalValue};
use crate::redo::{self, RedoLog, RedoRecord};
use crate::scheduler::{SchedulerPool, Service, Task, TaskStatus};
use crate::storage::{lock_error, Storage, VerifyReport};
use crate::transaction::{Transaction, TransactionManager, TransactionOptions};
use crate::types::TransactionId;
use mvdb_storage::{DirectoryFs, FileSystem, MemoryFs};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the engine handle, its transactions and its services.
pub(crate) struct EngineShared {
    pub(crate) config: Config,
    pub(crate) storage: Storage,
    pub(crate) redo: RedoLog,
    pub(crate) manager: TransactionManager,
    pub(crate) checkpoint: CheckpointService,
    pub(crate) schedulers: SchedulerPool,
    /// Held shared by commits, exclusively by a checkpoint while it
    /// rotates the log and captures roots.
    pub(crate) commit_gate: RwLock<()>,
    map_open: Mutex<()>,
    closed: AtomicBool,
}

impl EngineShared {
    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs due redo syncs and checkpoints on the committing thread when
    /// no worker threads tick the services.
    pub(crate) fn after_commit(&self) {
        if self.is_closed() || self.schedulers.has_workers() {
            return;
        }
        if let Err(e) = self.redo.sync_if_due() {
            tracing::warn!(error = %e, "periodic redo sync failed");
        }
        self.checkpoint.tick(self);
    }

    /// Wakes everything waiting for rows held by `by`.
    pub(crate) fn rows_released(&self, by: TransactionId) {
        self.manager.rows_released();
        self.schedulers.wake_all(by);
    }

    /// Opens the backing map of a transactional map, first applying
    /// committed changes the redo log still holds for it.
    pub(crate) fn open_map<V: MapValue>(
        &self,
        name: &str,
        config: MapConfig,
    ) -> CoreResult<Arc<BTreeMap<TransactionalValue<V>>>> {
        self.check_open()?;
        let _serial = self.map_open.lock();
        let _gate = self.commit_gate.read();
        let map = self
            .storage
            .open_btree_map::<TransactionalValue<V>>(name, config)?;
        let held = self.redo.take_pending(name);
        if held.is_empty() {
            return Ok(map);
        }
        let applied = redo::decode_pending::<V>(name, &held)
            .and_then(|changes| redo::apply_pending(&map, changes));
        match applied {
            Ok(records) => {
                tracing::info!(map = name, records, "redo records applied");
                Ok(map)
            }
            Err(e) => {
                self.redo.restore_pending(name, held);
                Err(e)
            }
        }
    }

    /// Queues the final checkpoint on scheduler 0. `latch` opens once it
    /// ran; its result lands in `outcome`.
    fn execute_checkpoint_on_close(
        self: &Arc<Self>,
        latch: Arc<Latch>,
        outcome: Arc<Mutex<Option<CoreResult<CheckpointReport>>>>,
    ) {
        let engine = Arc::clone(self);
        self.schedulers.submit(
            0,
            Box::new(move || {
                let result = engine.checkpoint.run(&engine);
                *outcome.lock() = Some(result);
                latch.count_down();
                TaskStatus::Done
            }),
        );
    }
}

struct RedoSync {
    engine: Weak<EngineShared>,
}

impl Service for RedoSync {
    fn name(&self) -> &str {
        "redo-sync"
    }

    fn tick(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.redo.sync_if_due() {
            tracing::warn!(error = %e, "periodic redo sync failed");
        }
    }
}

struct CheckpointTick {
    engine: Weak<EngineShared>,
}

impl Service for CheckpointTick {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn tick(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if !engine.is_closed() {
            engine.checkpoint.tick(&engine);
        }
    }
}

/// An MVCC transactional storage engine.
///
/// # Example
///
/// ```rust,ignore
/// use mvdb_core::{TransactionEngine, TransactionOptions};
/// use mvdb_codec::Value;
///
/// let engine = TransactionEngine::open(Path::new("my_db"))?;
/// let txn = engine.begin(TransactionOptions::default())?;
/// let users = txn.open_map::<Value>("users")?;
/// users.put(1, Value::from("alice"))?;
/// txn.commit()?;
/// engine.close()?;
/// ```
pub struct TransactionEngine {
    shared: Arc<EngineShared>,
}

impl TransactionEngine {
    /// Opens an engine in a directory with default configuration.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another engine owns the directory
    /// - corruption errors if the manifest, a chunk or the redo log is
    ///   damaged
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens an engine in a directory.
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let fs = DirectoryFs::open(path, config.create_if_missing).map_err(lock_error)?;
        Self::open_with_fs(Arc::new(fs), config)
    }

    /// Opens a fresh engine that keeps everything in memory.
    pub fn open_in_memory(config: Config) -> CoreResult<Self> {
        Self::open_with_fs(Arc::new(MemoryFs::new()), config)
    }

    /// Opens an engine on any file system.
    pub fn open_with_fs(fs: Arc<dyn FileSystem>, config: Config) -> CoreResult<Self> {
        let context = Arc::new(EngineContext::new());
        let storage =
            Storage::open_with_context(Arc::clone(&fs), config.storage_config(), context)?;
        let (redo, replay) = RedoLog::open(
            Arc::clone(&fs),
            config.log_sync,
            storage.checkpoint_mark().log_position,
        )?;
        for name in &replay.dropped_maps {
            storage.drop_map_at(name, 0)?;
        }
        let last = storage.last_transaction_id().max(replay.last_transaction_id);

        let lock_timeout = match config.lock_wait {
            LockWaitPolicy::NoWait => Duration::ZERO,
            LockWaitPolicy::Wait { timeout } => timeout,
        };
        let shared = Arc::new(EngineShared {
            manager: TransactionManager::new(last, config.schedulers),
            checkpoint: CheckpointService::new(
                config.checkpoint_interval,
                config.max_redo_log_size,
            ),
            schedulers: SchedulerPool::new(config.schedulers, lock_timeout, config.scheduler_tick),
            commit_gate: RwLock::new(()),
            map_open: Mutex::new(()),
            closed: AtomicBool::new(false),
            config,
            storage,
            redo,
        });

        let host = shared.schedulers.scheduler(0);
        host.add_service(Arc::new(RedoSync {
            engine: Arc::downgrade(&shared),
        }));
        host.add_service(Arc::new(CheckpointTick {
            engine: Arc::downgrade(&shared),
        }));
        if shared.config.background_workers {
            shared.schedulers.start_workers()?;
        }

        tracing::info!(
            last_txn = %last,
            replayed = replay.transactions,
            held_maps = shared.redo.pending_maps().len(),
            "engine opened"
        );
        Ok(Self { shared })
    }

    /// The configuration the engine was opened with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The page storage underneath the engine.
    pub fn storage(&self) -> &Storage {
        &self.shared.storage
    }

    /// Checks if the engine is open.
    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Starts a transaction.
    pub fn begin(&self, options: TransactionOptions) -> CoreResult<Transaction> {
        Transaction::begin(Arc::clone(&self.shared), options)
    }

    /// Runs `f` in a transaction and commits it. On `Locked`,
    /// `LockTimeout` or `WriteConflict` the transaction is rolled back and
    /// `f` retried in a fresh one, up to `Config::transaction_retries`
    /// times with exponential backoff.
    pub fn run_transaction<T>(
        &self,
        options: TransactionOptions,
        mut f: impl FnMut(&Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let retries = self.shared.config.transaction_retries;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            let txn = self.begin(options)?;
            let outcome = match f(&txn) {
                Ok(value) => txn.commit().map(|_| value),
                Err(e) => {
                    txn.rollback()?;
                    Err(e)
                }
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, ?backoff, "retrying transaction");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                other => return other,
            }
        }
    }

    /// Names of all maps, including maps that so far only exist in the
    /// redo log.
    pub fn map_names(&self) -> Vec<String> {
        let mut names = self.shared.storage.map_names();
        names.extend(self.shared.redo.pending_maps());
        names.sort();
        names.dedup();
        names
    }

    /// Drops a map and everything in it. Returns whether it existed.
    ///
    /// The drop is logged, so it survives a crash before the next
    /// checkpoint.
    pub fn drop_map(&self, name: &str) -> CoreResult<bool> {
        let shared = &self.shared;
        shared.check_open()?;
        let _serial = shared.map_open.lock();
        let known = shared.storage.has_map(name)
            || shared.redo.pending_maps().iter().any(|m| m == name);
        if !known {
            return Ok(false);
        }
        {
            let _gate = shared.commit_gate.write();
            let commit_id = shared.manager.begin_commit();
            let logged = shared.redo.append_record(
                RedoRecord::DropMap {
                    txid: commit_id,
                    map: name.to_string(),
                },
                commit_id,
            );
            shared.manager.end_commit(commit_id);
            logged?;
            shared.redo.discard_pending(name);
            shared.storage.drop_map_at(name, shared.manager.next_id())?;
        }
        tracing::info!(map = name, "map dropped");
        Ok(true)
    }

    /// Runs a checkpoint now.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        self.shared.check_open()?;
        self.shared.checkpoint.run(&self.shared)
    }

    /// Requests a checkpoint on the next scheduler tick.
    pub fn execute_checkpoint_async(&self) {
        self.shared.checkpoint.request();
    }

    /// Checkpoint counters.
    pub fn checkpoint_stats(&self) -> CheckpointStats {
        self.shared.checkpoint.stats()
    }

    /// Runs one pass on every scheduler; needed when the engine runs
    /// without background workers. Returns the number of tasks run.
    pub fn run_once(&self) -> usize {
        self.shared.schedulers.run_once()
    }

    /// Queues a task on a scheduler.
    pub fn submit(&self, scheduler: usize, task: Box<dyn Task>) {
        self.shared.schedulers.submit(scheduler, task);
    }

    /// The scheduler pool.
    pub fn schedulers(&self) -> &SchedulerPool {
        &self.shared.schedulers
    }

    /// Number of live transactions.
    pub fn active_transactions(&self) -> usize {
        self.shared.manager.active_count()
    }

    /// Smallest id among live transactions.
    pub fn oldest_active_transaction_id(&self) -> Option<TransactionId> {
        self.shared.manager.oldest_active_transaction_id()
    }

    /// Newest snapshot among live repeatable-read transactions.
    pub fn max_repeatable_read_transaction_id(&self) -> Option<TransactionId> {
        self.shared.manager.max_repeatable_read_transaction_id()
    }

    /// Bytes in live redo log files.
    pub fn redo_log_size(&self) -> u64 {
        self.shared.redo.size()
    }

    /// Bytes of lazily loaded column pages currently in memory.
    pub fn memory_used(&self) -> usize {
        self.shared.storage.context().memory().used()
    }

    /// Checks every persisted page.
    pub fn verify(&self) -> VerifyReport {
        self.shared.storage.verify()
    }

    /// Runs a final checkpoint and closes the engine.
    ///
    /// New transactions are refused from here on. Transactions still open
    /// keep working on their rows but their commits are only in the redo
    /// log.
    pub fn close(&self) -> CoreResult<()> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let latch = Arc::new(Latch::new(1));
        let outcome = Arc::new(Mutex::new(None));
        shared.execute_checkpoint_on_close(Arc::clone(&latch), Arc::clone(&outcome));
        if shared.schedulers.has_workers() {
            latch.wait();
        } else {
            while latch.count() > 0 {
                shared.schedulers.scheduler(0).run_once();
            }
        }
        shared.schedulers.shutdown();

        let result = outcome
            .lock()
            .take()
            .unwrap_or_else(|| Err(CoreError::internal("close checkpoint produced no result")));
        shared.redo.sync()?;
        shared.storage.mark_closed();
        match &result {
            Ok(_) => tracing::info!("engine closed"),
            Err(e) => tracing::warn!(error = %e, "final checkpoint failed; redo log kept"),
        }
        result.map(|_| ())
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        self.shared.schedulers.shutdown();
        if !self.shared.is_closed() {
            tracing::debug!("engine dropped without close; the redo log covers recent commits");
        }
    }
}

impl fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("open", &self.is_open())
            .field("storage", &self.shared.storage)
            .field("manager", &self.shared.manager)
            .field("checkpoint", &self.shared.checkpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IsolationLevel;
    use mvdb_codec::Value;

    fn engine() -> (MemoryFs, TransactionEngine) {
        let fs = MemoryFs::new();
        let config = Config::default().page_size(512);
        let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config).unwrap();
        (fs, engine)
    }

    fn reopen(fs: &MemoryFs) -> TransactionEngine {
        let config = Config::default().page_size(512);
        TransactionEngine::open_with_fs(Arc::new(fs.clone()), config).unwrap()
    }

    fn read(engine: &TransactionEngine, map: &str, key: i64) -> Option<Value> {
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        let value = txn.open_map::<Value>(map).unwrap().get(&Value::Int(key)).unwrap();
        txn.commit().unwrap();
        value
    }

    #[test]
    fn commit_then_read() {
        let (_fs, engine) = engine();
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        let map = txn.open_map::<Value>("t").unwrap();
        assert_eq!(map.put(1, Value::from("one")).unwrap(), None);
        assert_eq!(map.get(&Value::Int(1)).unwrap(), Some(Value::from("one")));
        let commit = txn.commit().unwrap();
        assert!(commit.is_some());
        assert_eq!(read(&engine, "t", 1), Some(Value::from("one")));
        assert_eq!(engine.active_transactions(), 0);
    }

    #[test]
    fn empty_commit_returns_none() {
        let (_fs, engine) = engine();
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        assert_eq!(txn.commit().unwrap(), None);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_fs, engine) = engine();
        {
            let txn = engine.begin(TransactionOptions::default()).unwrap();
            txn.open_map::<Value>("t").unwrap().put(1, Value::from("x")).unwrap();
        }
        assert_eq!(read(&engine, "t", 1), None);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[test]
    fn auto_commit_publishes_each_write() {
        let (_fs, engine) = engine();
        let txn = engine
            .begin(TransactionOptions::default().auto_commit(true))
            .unwrap();
        let map = txn.open_map::<Value>("t").unwrap();
        map.put(1, Value::from("a")).unwrap();
        assert_eq!(txn.undo_len(), 0);
        assert_eq!(read(&engine, "t", 1), Some(Value::from("a")));
        drop(map);
        txn.rollback().unwrap();
        assert_eq!(read(&engine, "t", 1), Some(Value::from("a")));
    }

    #[test]
    fn recovers_from_redo_log_without_checkpoint() {
        let (fs, engine) = engine();
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        let map = txn.open_map::<Value>("t").unwrap();
        map.put(1, Value::from("a")).unwrap();
        map.put(2, Value::from("b")).unwrap();
        drop(map);
        txn.commit().unwrap();
        drop(engine);
        fs.simulate_crash();

        let engine = reopen(&fs);
        assert_eq!(engine.map_names(), vec!["t".to_string()]);
        assert_eq!(read(&engine, "t", 1), Some(Value::from("a")));
        assert_eq!(read(&engine, "t", 2), Some(Value::from("b")));
    }

    #[test]
    fn ids_continue_after_reopen() {
        let (fs, engine) = engine();
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        txn.open_map::<Value>("t").unwrap().put(1, Value::Null).unwrap();
        let commit = txn.commit().unwrap().unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = reopen(&fs);
        let txn = engine.begin(TransactionOptions::default()).unwrap();
        assert!(txn.id() > commit);
    }

    #[test]
    fn checkpoint_trims_redo_log() {
        let (fs, engine) = engine();
        for i in 0..20 {
            engine
                .run_transaction(TransactionOptions::default(), |txn| {
                    txn.open_map::<Value>("t")?.put(i, Value::Int(i * 10))?;
                    Ok(())
                })
                .unwrap();
        }
        let before = engine.redo_log_size();
        let report = engine.checkpoint().unwrap();
        assert!(report.chunk.is_some());
        assert!(report.log_files_removed >= 1);
        assert!(engine.redo_log_size() < before);
        assert_eq!(engine.checkpoint_stats().completed, 1);
        drop(engine);
        fs.simulate_crash();

        let engine = reopen(&fs);
        for i in 0..20 {
            assert_eq!(read(&engine, "t", i), Some(Value::Int(i * 10)));
        }
    }

    #[test]
    fn async_checkpoint_runs_on_tick() {
        let (_fs, engine) = engine();
        engine
            .run_transaction(TransactionOptions::default(), |txn| {
                txn.open_map::<Value>("t")?.put(1, Value::Null)?;
                Ok(())
            })
            .unwrap();
        engine.execute_checkpoint_async();
        assert_eq!(engine.checkpoint_stats().completed, 0);
        engine.run_once();
        assert_eq!(engine.checkpoint_stats().completed, 1);
        assert_eq!(engine.storage().chunk_count(), 1);
    }

    #[test]
    fn drop_map_survives_crash() {
        let (fs, engine) = engine();
        engine
            .run_transaction(TransactionOptions::default(), |txn| {
                txn.open_map::<Value>("gone")?.put(1, Value::Null)?;
                Ok(())
            })
            .unwrap();
        engine.checkpoint().unwrap();
        assert!(engine.drop_map("gone").unwrap());
        assert!(!engine.drop_map("gone").unwrap());
        drop(engine);
        fs.simulate_crash();

        let engine = reopen(&fs);
        assert!(engine.map_names().is_empty());
        assert_eq!(read(&engine, "gone", 1), None);
    }

    #[test]
    fn closed_engine_refuses_work() {
        let (_fs, engine) = engine();
        engine.close().unwrap();
        assert!(!engine.is_open());
        assert!(matches!(
            engine.begin(TransactionOptions::default()),
            Err(CoreError::Closed)
        ));
        engine.close().unwrap();
    }

    #[test]
    fn background_workers_close_cleanly() {
        let fs = MemoryFs::new();
        let config = Config::default().background_workers(true).schedulers(2);
        let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config).unwrap();
        engine
            .run_transaction(
                TransactionOptions::default().isolation(IsolationLevel::RepeatableRead),
                |txn| {
                    txn.open_map::<Value>("t")?.put(1, Value::from("w"))?;
                    Ok(())
                },
            )
            .unwrap();
        engine.close().unwrap();
        assert!(!engine.schedulers().has_workers());
        drop(engine);

        let engine = reopen(&fs);
        assert_eq!(read(&engine, "t", 1), Some(Value::from("w")));
    }

    #[test]
    fn directory_engine_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TransactionEngine::open(dir.path()).unwrap();
        assert!(matches!(
            TransactionEngine::open(dir.path()),
            Err(CoreError::DatabaseLocked)
        ));
        engine.close().unwrap();
        drop(engine);
        let again = TransactionEngine::open(dir.path()).unwrap();
        again.close().unwrap();
    }
}
