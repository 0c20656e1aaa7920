//! The transaction handle.

use crate::config::MapConfig;
use crate::engine::EngineShared;
use crate::error::{CoreError, CoreResult};
use crate::record::{MapValue, ReadView};
use crate::redo::RedoRecord;
use crate::transaction::map::TransactionMap;
use crate::transaction::state::{TransactionOptions, TransactionState, TxnState, UndoEntry};
use crate::types::{IsolationLevel, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

/// A unit of work over transactional maps.
///
/// Writes lock the rows they touch until the transaction ends. A
/// transaction that is dropped while still active is rolled back.
pub struct Transaction {
    engine: Arc<EngineShared>,
    id: TransactionId,
    snapshot: Mutex<Option<TransactionId>>,
    options: TransactionOptions,
    state: Mutex<TxnState>,
}

impl Transaction {
    pub(crate) fn begin(engine: Arc<EngineShared>, options: TransactionOptions) -> CoreResult<Self> {
        engine.check_open()?;
        let (id, snapshot) = engine.manager.register(options.isolation, options.scheduler);
        tracing::debug!(txn = %id, isolation = ?options.isolation, "transaction started");
        Ok(Self {
            engine,
            id,
            snapshot: Mutex::new(snapshot),
            options,
            state: Mutex::new(TxnState::new()),
        })
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.options.isolation
    }

    /// Snapshot bound for repeatable read. An auto-commit transaction
    /// moves it past each of its commits.
    #[must_use]
    pub fn snapshot(&self) -> Option<TransactionId> {
        *self.snapshot.lock()
    }

    /// True if every write commits on its own.
    #[must_use]
    pub fn is_auto_commit(&self) -> bool {
        self.options.auto_commit
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state.lock().status
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Number of writes that a rollback would undo.
    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.state.lock().undo.len()
    }

    pub(crate) fn view(&self) -> ReadView {
        ReadView {
            reader: self.id,
            snapshot: self.snapshot(),
        }
    }

    pub(crate) fn engine(&self) -> &EngineShared {
        &self.engine
    }

    pub(crate) fn lock_state(&self) -> CoreResult<MutexGuard<'_, TxnState>> {
        let state = self.state.lock();
        state.ensure_active(self.id)?;
        Ok(state)
    }

    /// Opens (or creates) the map `name` with default settings.
    ///
    /// Committed changes to the map still held by the redo log are applied
    /// first.
    pub fn open_map<V: MapValue>(&self, name: &str) -> CoreResult<TransactionMap<'_, V>> {
        self.open_map_with(name, MapConfig::new())
    }

    /// Opens (or creates) the map `name`. `config` only matters when the
    /// map is created.
    pub fn open_map_with<V: MapValue>(
        &self,
        name: &str,
        config: MapConfig,
    ) -> CoreResult<TransactionMap<'_, V>> {
        drop(self.lock_state()?);
        let map = self.engine.open_map::<V>(name, config)?;
        Ok(TransactionMap::new(self, map))
    }

    /// Records a savepoint. Reusing a name shadows the older savepoint.
    pub fn add_savepoint(&self, name: impl Into<String>) -> CoreResult<()> {
        self.lock_state()?.add_savepoint(name.into());
        Ok(())
    }

    /// Undoes every write made after the savepoint `name`. Savepoints added
    /// after it are discarded; the savepoint itself stays usable.
    pub fn rollback_to_savepoint(&self, name: &str) -> CoreResult<()> {
        let mut state = self.lock_state()?;
        let position = state.release_after(name)?;
        let restored = state.rollback_to(self.id, position)?;
        drop(state);
        if restored > 0 {
            self.engine.rows_released(self.id);
        }
        tracing::debug!(txn = %self.id, savepoint = name, restored, "rolled back to savepoint");
        Ok(())
    }

    /// Commits the transaction. Returns the commit id, or `None` if it
    /// wrote nothing.
    ///
    /// # Errors
    ///
    /// If the redo log append fails the transaction is rolled back and the
    /// error returned.
    pub fn commit(self) -> CoreResult<Option<TransactionId>> {
        let result = self.commit_pending();
        {
            let mut state = self.state.lock();
            state.status = match result {
                Ok(_) => TransactionState::Committed,
                Err(_) => TransactionState::RolledBack,
            };
        }
        self.finish();
        result
    }

    /// Rolls back every write and ends the transaction.
    pub fn rollback(self) -> CoreResult<()> {
        self.rollback_all()
    }

    /// Commits what was written so far while keeping the transaction open.
    pub(crate) fn commit_pending(&self) -> CoreResult<Option<TransactionId>> {
        let mut state = self.lock_state()?;
        if state.undo.is_empty() {
            return Ok(None);
        }

        let gate = self.engine.commit_gate.read();
        let records: CoreResult<Vec<RedoRecord>> = state
            .distinct_rows()
            .into_iter()
            .map(|entry: &dyn UndoEntry| entry.redo_record(self.id))
            .collect();
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                drop(gate);
                self.abort_locked(&mut state)?;
                return Err(e);
            }
        };

        let commit_id = self.engine.manager.begin_commit();
        if let Err(e) = self.engine.redo.append_commit(self.id, commit_id, &records) {
            self.engine.manager.end_commit(commit_id);
            drop(gate);
            tracing::warn!(txn = %self.id, error = %e, "redo append failed, rolling back");
            self.abort_locked(&mut state)?;
            return Err(e);
        }

        let floor = self.engine.manager.retain_floor();
        let marked: CoreResult<()> = state
            .distinct_rows()
            .into_iter()
            .try_for_each(|entry| entry.commit(self.id, commit_id, floor));
        self.engine.manager.end_commit(commit_id);
        drop(gate);
        marked?;

        let rows = records.len();
        state.clear();
        drop(state);
        self.engine.rows_released(self.id);
        tracing::debug!(txn = %self.id, commit = %commit_id, rows, "transaction committed");
        self.engine.after_commit();
        Ok(Some(commit_id))
    }

    /// Runs the auto-commit step after a successful write. A
    /// repeatable-read snapshot then moves past the new commit so the
    /// transaction keeps reading and rewriting its own rows.
    pub(crate) fn after_write(&self) -> CoreResult<()> {
        if !self.options.auto_commit || self.commit_pending()?.is_none() {
            return Ok(());
        }
        let mut snapshot = self.snapshot.lock();
        if snapshot.is_some() {
            *snapshot = self
                .engine
                .manager
                .advance_snapshot(self.id, self.options.scheduler);
        }
        Ok(())
    }

    fn abort_locked(&self, state: &mut TxnState) -> CoreResult<()> {
        let restored = state.rollback_to(self.id, 0)?;
        state.clear();
        if restored > 0 {
            self.engine.rows_released(self.id);
        }
        Ok(())
    }

    fn rollback_all(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.status != TransactionState::Active {
            return Err(CoreError::TransactionClosed { id: self.id });
        }
        let result = state.rollback_to(self.id, 0);
        state.clear();
        state.status = TransactionState::RolledBack;
        drop(state);
        self.finish();
        tracing::debug!(txn = %self.id, "transaction rolled back");
        result.map(|_| ())
    }

    fn finish(&self) {
        self.engine.manager.deregister(self.id, self.options.scheduler);
        self.engine.rows_released(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(e) = self.rollback_all() {
                tracing::warn!(txn = %self.id, error = %e, "rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .field("options", &self.options)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
