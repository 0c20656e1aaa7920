//! Transactional view of a versioned map.

use crate::btree::{BTreeCursor, BTreeMap, CursorParameters, Mutation};
use crate::config::LockWaitPolicy;
use crate::error::{CoreError, CoreResult};
use crate::record::{MapValue, ReadView, TransactionalValue, VersionedValue};
use crate::transaction::handle::Transaction;
use crate::transaction::state::RowUndo;
use mvdb_codec::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A map opened inside a transaction.
///
/// Reads see what the transaction's isolation level allows plus its own
/// pending writes. Writes lock the row until the transaction ends.
pub struct TransactionMap<'t, V: MapValue> {
    txn: &'t Transaction,
    map: Arc<BTreeMap<TransactionalValue<V>>>,
}

impl<'t, V: MapValue> TransactionMap<'t, V> {
    pub(crate) fn new(txn: &'t Transaction, map: Arc<BTreeMap<TransactionalValue<V>>>) -> Self {
        Self { txn, map }
    }

    /// Map name.
    pub fn name(&self) -> &str {
        self.map.name()
    }

    /// Number of slots in the map, including rows that are only pending or
    /// deleted for this transaction.
    pub fn len_estimate(&self) -> u64 {
        self.map.len()
    }

    /// Value of `key` as this transaction sees it.
    pub fn get(&self, key: &Value) -> CoreResult<Option<V>> {
        drop(self.txn.lock_state()?);
        let view = self.txn.view();
        Ok(self
            .map
            .get(key)?
            .and_then(|slot| slot.visible_value(&view).cloned()))
    }

    /// True if `key` is visible to this transaction.
    pub fn contains_key(&self, key: &Value) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Stores `value` under `key`, waiting for the row per the engine's
    /// [`LockWaitPolicy`]. Returns the previous visible value.
    pub fn put(&self, key: impl Into<Value>, value: V) -> CoreResult<Option<V>> {
        let key = key.into();
        self.write_waiting(&key, &mut |_| Ok(Some(value.clone())))
    }

    /// Like [`put`](Self::put) but fails with `Locked` at once if another
    /// transaction holds the row.
    pub fn try_put(&self, key: impl Into<Value>, value: V) -> CoreResult<Option<V>> {
        let key = key.into();
        self.write(&key, &mut |_| Ok(Some(value.clone())))
    }

    /// Removes `key`, waiting for the row per the engine's
    /// [`LockWaitPolicy`]. Returns the previous visible value.
    pub fn remove(&self, key: &Value) -> CoreResult<Option<V>> {
        self.write_waiting(key, &mut |_| Ok(None))
    }

    /// Like [`remove`](Self::remove) but fails with `Locked` at once.
    pub fn try_remove(&self, key: &Value) -> CoreResult<Option<V>> {
        self.write(key, &mut |_| Ok(None))
    }

    /// Ascending cursor over visible entries with keys in `from..=to`.
    pub fn cursor(&self, from: Option<&Value>, to: Option<&Value>) -> CoreResult<TransactionCursor<'t, V>> {
        self.cursor_with(CursorParameters {
            from: from.cloned(),
            to: to.cloned(),
            columns: None,
        })
    }

    /// Cursor with explicit bounds and column projection.
    pub fn cursor_with(&self, params: CursorParameters) -> CoreResult<TransactionCursor<'t, V>> {
        drop(self.txn.lock_state()?);
        Ok(TransactionCursor {
            txn: self.txn,
            inner: self.map.cursor_with(params)?,
            view: self.txn.view(),
        })
    }

    fn write_waiting(
        &self,
        key: &Value,
        decide: &mut dyn FnMut(Option<&V>) -> CoreResult<Option<V>>,
    ) -> CoreResult<Option<V>> {
        let engine = self.txn.engine();
        let timeout = match engine.config.lock_wait {
            LockWaitPolicy::NoWait => return self.write(key, decide),
            LockWaitPolicy::Wait { timeout } => timeout,
        };
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let seen = engine.manager.release_generation();
            match self.write(key, decide) {
                Err(CoreError::Locked { map, key, holder }) => {
                    tracing::debug!(txn = %self.txn.id(), %map, %key, %holder, "waiting for row lock");
                    if !engine.manager.wait_release(seen, deadline) {
                        return Err(CoreError::LockTimeout {
                            map,
                            key,
                            holder,
                            waited: started.elapsed(),
                        });
                    }
                }
                other => return other,
            }
        }
    }

    /// Locks `key` and replaces its pending value with what `decide`
    /// returns for the currently visible value.
    fn write(
        &self,
        key: &Value,
        decide: &mut dyn FnMut(Option<&V>) -> CoreResult<Option<V>>,
    ) -> CoreResult<Option<V>> {
        let mut state = self.txn.lock_state()?;
        let me = self.txn.id();
        let view = self.txn.view();
        let name = self.map.name();

        let (old, previous, wrote) = self.map.update(key, |current| {
            if let Some(holder) = current.and_then(TransactionalValue::owner) {
                if holder != me {
                    tracing::debug!(txn = %me, map = name, %key, %holder, "row locked");
                    return Err(CoreError::Locked {
                        map: name.to_string(),
                        key: key.to_string(),
                        holder,
                    });
                }
            }
            if let (Some(snapshot), Some(slot)) = (view.snapshot, current) {
                if slot
                    .committed_version()
                    .is_some_and(|head| head.commit_id() >= snapshot)
                {
                    return Err(CoreError::write_conflict(name, key));
                }
            }
            let old = current.and_then(|slot| slot.visible_value(&view)).cloned();
            let new = decide(old.as_ref())?;
            if current.is_none() && new.is_none() {
                return Ok((Mutation::Keep, (old, None, false)));
            }
            let slot = TransactionalValue::uncommitted(me, new, current);
            Ok((Mutation::Put(slot), (old, current.cloned(), true)))
        })?;

        if wrote {
            state.undo.push(Box::new(RowUndo {
                map: Arc::clone(&self.map),
                key: key.clone(),
                previous,
            }));
        }
        drop(state);
        if wrote {
            self.txn.after_write()?;
        }
        Ok(old)
    }
}

impl TransactionMap<'_, VersionedValue> {
    /// Replaces the row at `key` with a revision carrying `columns`, if the
    /// visible row still has the version of `expected`. Never waits.
    ///
    /// # Errors
    ///
    /// `WriteConflict` if the row is absent or was revised since
    /// `expected` was read; `Locked` if another transaction holds it.
    pub fn try_update(
        &self,
        key: &Value,
        expected: &VersionedValue,
        columns: Vec<Value>,
    ) -> CoreResult<VersionedValue> {
        let name = self.map.name();
        let mut columns = Some(columns);
        let mut revised = None;
        self.write(key, &mut |current| match (current, columns.take()) {
            (Some(row), Some(columns)) if row.version() == expected.version() => {
                let row = row.revise(columns);
                revised = Some(row.clone());
                Ok(Some(row))
            }
            _ => Err(CoreError::write_conflict(name, key)),
        })?;
        revised.ok_or_else(|| CoreError::write_conflict(name, key))
    }
}

impl<V: MapValue> fmt::Debug for TransactionMap<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMap")
            .field("name", &self.map.name())
            .field("txn", &self.txn.id())
            .finish()
    }
}

/// Ascending iterator over the entries a transaction can see.
///
/// Works on the map root at creation time; the transaction's later writes
/// are not observed. The cursor cannot outlive its transaction.
pub struct TransactionCursor<'t, V: MapValue> {
    txn: &'t Transaction,
    inner: BTreeCursor<TransactionalValue<V>>,
    view: ReadView,
}

impl<V: MapValue> Iterator for TransactionCursor<'_, V> {
    type Item = CoreResult<(Value, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((key, slot)) => {
                    if let Some(value) = slot.visible_value(&self.view) {
                        return Some(Ok((key, value.clone())));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<V: MapValue> fmt::Debug for TransactionCursor<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCursor")
            .field("txn", &self.txn.id())
            .field("inner", &self.inner)
            .field("view", &self.view)
            .finish()
    }
}
