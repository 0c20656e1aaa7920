//! Transaction state, options and the undo log.

use crate::btree::{BTreeMap, Mutation};
use crate::error::{CoreError, CoreResult};
use crate::record::{MapValue, TransactionalValue};
use crate::redo::RedoRecord;
use crate::types::{IsolationLevel, TransactionId};
use mvdb_codec::{Value, Writer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been rolled back.
    RolledBack,
}

/// Options for [`crate::TransactionEngine::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Commit after every successful write.
    pub auto_commit: bool,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Scheduler whose transaction table registers the transaction.
    pub scheduler: usize,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            auto_commit: false,
            isolation: IsolationLevel::ReadCommitted,
            scheduler: 0,
        }
    }
}

impl TransactionOptions {
    /// Default options: read committed, explicit commit, scheduler 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets auto-commit.
    #[must_use]
    pub const fn auto_commit(mut self, value: bool) -> Self {
        self.auto_commit = value;
        self
    }

    /// Sets the isolation level.
    #[must_use]
    pub const fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the scheduler.
    #[must_use]
    pub const fn scheduler(mut self, scheduler: usize) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// One write recorded for rollback, type-erased over the map's value type.
pub(crate) trait UndoEntry: Send + Sync {
    fn map_name(&self) -> &str;

    fn key(&self) -> &Value;

    /// Redo record carrying the final pending value of the row.
    ///
    /// Fails with `WriteConflict` if `owner` no longer holds the row.
    fn redo_record(&self, owner: TransactionId) -> CoreResult<RedoRecord>;

    /// Turns `owner`'s pending write into a committed version.
    fn commit(
        &self,
        owner: TransactionId,
        commit_id: TransactionId,
        retain_floor: Option<TransactionId>,
    ) -> CoreResult<()>;

    /// Puts back the slot as it was before this write. Restoring twice
    /// is harmless.
    fn restore(&self, owner: TransactionId) -> CoreResult<()>;
}

/// Undo entry for a row of a `BTreeMap<TransactionalValue<V>>`.
pub(crate) struct RowUndo<V: MapValue> {
    pub(crate) map: Arc<BTreeMap<TransactionalValue<V>>>,
    pub(crate) key: Value,
    pub(crate) previous: Option<TransactionalValue<V>>,
}

impl<V: MapValue> UndoEntry for RowUndo<V> {
    fn map_name(&self) -> &str {
        self.map.name()
    }

    fn key(&self) -> &Value {
        &self.key
    }

    fn redo_record(&self, owner: TransactionId) -> CoreResult<RedoRecord> {
        let slot = self.map.get(&self.key)?;
        let map = self.map.name().to_string();
        match slot.as_ref().and_then(|s| s.pending_value(owner)) {
            Some(Some(value)) => {
                let mut w = Writer::new();
                value.write(&mut w);
                Ok(RedoRecord::Put {
                    txid: owner,
                    map,
                    key: self.key.clone(),
                    value: w.into_bytes(),
                })
            }
            Some(None) => Ok(RedoRecord::Remove {
                txid: owner,
                map,
                key: self.key.clone(),
            }),
            None => Err(CoreError::write_conflict(self.map.name(), &self.key)),
        }
    }

    fn commit(
        &self,
        owner: TransactionId,
        commit_id: TransactionId,
        retain_floor: Option<TransactionId>,
    ) -> CoreResult<()> {
        self.map.update(&self.key, |current| {
            let committed = current
                .filter(|slot| slot.owner() == Some(owner))
                .and_then(|slot| slot.commit(commit_id, retain_floor))
                .ok_or_else(|| {
                    CoreError::internal(format!(
                        "row {} in map {} lost by {owner} during commit",
                        self.key,
                        self.map.name()
                    ))
                })?;
            let mutation = if committed.is_dead() {
                Mutation::Remove
            } else {
                Mutation::Put(committed)
            };
            Ok((mutation, ()))
        })
    }

    fn restore(&self, owner: TransactionId) -> CoreResult<()> {
        if self.map.is_dropped() {
            return Ok(());
        }
        self.map.update(&self.key, |current| {
            match current.and_then(TransactionalValue::owner) {
                Some(holder) if holder == owner => {
                    let mutation = match &self.previous {
                        Some(previous) => Mutation::Put(previous.clone()),
                        None => Mutation::Remove,
                    };
                    Ok((mutation, ()))
                }
                None if self.previous.as_ref().map_or(true, |p| p.is_committed()) => {
                    Ok((Mutation::Keep, ()))
                }
                holder => Err(CoreError::internal(format!(
                    "undo of row {} in map {} by {owner} found it held by {holder:?}",
                    self.key,
                    self.map.name()
                ))),
            }
        })
    }
}

#[derive(Debug, Clone)]
struct Savepoint {
    name: String,
    position: usize,
}

/// Mutable part of a transaction.
pub(crate) struct TxnState {
    pub(crate) status: TransactionState,
    pub(crate) undo: Vec<Box<dyn UndoEntry>>,
    savepoints: Vec<Savepoint>,
}

impl TxnState {
    pub(crate) fn new() -> Self {
        Self {
            status: TransactionState::Active,
            undo: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub(crate) fn ensure_active(&self, id: TransactionId) -> CoreResult<()> {
        if self.status == TransactionState::Active {
            Ok(())
        } else {
            Err(CoreError::TransactionClosed { id })
        }
    }

    pub(crate) fn add_savepoint(&mut self, name: String) {
        let position = self.undo.len();
        self.savepoints.push(Savepoint { name, position });
    }

    /// Undo position of the newest savepoint called `name`; later
    /// savepoints are forgotten.
    pub(crate) fn release_after(&mut self, name: &str) -> CoreResult<usize> {
        let index = self
            .savepoints
            .iter()
            .rposition(|s| s.name == name)
            .ok_or_else(|| CoreError::SavepointNotFound {
                name: name.to_string(),
            })?;
        self.savepoints.truncate(index + 1);
        Ok(self.savepoints[index].position)
    }

    pub(crate) fn clear(&mut self) {
        self.undo.clear();
        self.savepoints.clear();
    }

    /// Restores entries above `position`, newest first.
    pub(crate) fn rollback_to(&mut self, owner: TransactionId, position: usize) -> CoreResult<usize> {
        let mut restored = 0;
        while self.undo.len() > position {
            let Some(entry) = self.undo.pop() else {
                break;
            };
            entry.restore(owner)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Entries for the first write of every distinct row, in undo order.
    pub(crate) fn distinct_rows(&self) -> Vec<&dyn UndoEntry> {
        let mut seen = HashSet::new();
        self.undo
            .iter()
            .filter(|e| seen.insert((e.map_name().to_string(), e.key().clone())))
            .map(|e| e.as_ref())
            .collect()
    }
}

impl fmt::Debug for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnState")
            .field("status", &self.status)
            .field("undo", &self.undo.len())
            .field("savepoints", &self.savepoints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ReadView;
    use crate::storage::Storage;
    use crate::config::{MapConfig, StorageConfig};
    use mvdb_storage::MemoryFs;

    fn map() -> (Storage, Arc<BTreeMap<TransactionalValue<Value>>>) {
        let storage = Storage::open(Arc::new(MemoryFs::new()), StorageConfig::default()).unwrap();
        let map = storage
            .open_btree_map::<TransactionalValue<Value>>("t", MapConfig::new())
            .unwrap();
        (storage, map)
    }

    fn write(
        map: &Arc<BTreeMap<TransactionalValue<Value>>>,
        owner: TransactionId,
        key: i64,
        value: Option<&str>,
    ) -> RowUndo<Value> {
        let key = Value::Int(key);
        let previous = map.get(&key).unwrap();
        let slot =
            TransactionalValue::uncommitted(owner, value.map(Value::from), previous.as_ref());
        map.put(key.clone(), slot).unwrap();
        RowUndo {
            map: Arc::clone(map),
            key,
            previous,
        }
    }

    fn read(map: &BTreeMap<TransactionalValue<Value>>, key: i64) -> Option<Value> {
        let view = ReadView::read_committed(TransactionId::new(999));
        map.get(&Value::Int(key))
            .unwrap()
            .and_then(|slot| slot.visible_value(&view).cloned())
    }

    #[test]
    fn options_builder() {
        let options = TransactionOptions::new()
            .auto_commit(true)
            .isolation(IsolationLevel::RepeatableRead)
            .scheduler(3);
        assert!(options.auto_commit);
        assert_eq!(options.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(options.scheduler, 3);
        assert_eq!(TransactionOptions::default().isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn restore_in_reverse_order_returns_to_committed() {
        let (_storage, map) = map();
        let owner = TransactionId::new(5);
        map.put(Value::Int(1), TransactionalValue::committed(TransactionId::new(1), Value::from("a")))
            .unwrap();

        let first = write(&map, owner, 1, Some("b"));
        let second = write(&map, owner, 1, None);
        let third = write(&map, owner, 2, Some("new"));

        third.restore(owner).unwrap();
        second.restore(owner).unwrap();
        first.restore(owner).unwrap();
        assert_eq!(read(&map, 1), Some(Value::from("a")));
        assert_eq!(read(&map, 2), None);
        assert!(map.get(&Value::Int(2)).unwrap().is_none());

        // A second pass changes nothing.
        first.restore(owner).unwrap();
        third.restore(owner).unwrap();
        assert_eq!(read(&map, 1), Some(Value::from("a")));
    }

    #[test]
    fn restore_of_row_held_by_another_is_internal_error() {
        let (_storage, map) = map();
        let undo = write(&map, TransactionId::new(5), 1, Some("x"));
        map.put(
            Value::Int(1),
            TransactionalValue::uncommitted(TransactionId::new(6), Some(Value::from("y")), None),
        )
        .unwrap();
        let err = undo.restore(TransactionId::new(5)).unwrap_err();
        assert!(matches!(err, CoreError::InternalInvariant { .. }));
    }

    #[test]
    fn redo_record_and_commit() {
        let (_storage, map) = map();
        let owner = TransactionId::new(5);
        let put = write(&map, owner, 1, Some("v"));
        let remove = write(&map, owner, 2, None);

        match put.redo_record(owner).unwrap() {
            RedoRecord::Put { map: name, key, .. } => {
                assert_eq!(name, "t");
                assert_eq!(key, Value::Int(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            remove.redo_record(owner).unwrap(),
            RedoRecord::Remove { .. }
        ));
        assert!(matches!(
            put.redo_record(TransactionId::new(6)).unwrap_err(),
            CoreError::WriteConflict { .. }
        ));

        put.commit(owner, TransactionId::new(7), None).unwrap();
        remove.commit(owner, TransactionId::new(7), None).unwrap();
        assert_eq!(read(&map, 1), Some(Value::from("v")));
        assert!(map.get(&Value::Int(2)).unwrap().is_none());
        assert!(put.commit(owner, TransactionId::new(8), None).is_err());
    }

    #[test]
    fn savepoints_and_distinct_rows() {
        let (_storage, map) = map();
        let owner = TransactionId::new(5);
        let mut state = TxnState::new();
        state.add_savepoint("start".into());
        state.undo.push(Box::new(write(&map, owner, 1, Some("a"))));
        state.add_savepoint("mid".into());
        state.undo.push(Box::new(write(&map, owner, 1, Some("b"))));
        state.undo.push(Box::new(write(&map, owner, 2, Some("c"))));
        assert_eq!(state.distinct_rows().len(), 2);

        let position = state.release_after("mid").unwrap();
        assert_eq!(position, 1);
        assert_eq!(state.rollback_to(owner, position).unwrap(), 2);
        let view = ReadView::read_committed(owner);
        let slot = map.get(&Value::Int(1)).unwrap().unwrap();
        assert_eq!(slot.visible_value(&view), Some(&Value::from("a")));
        assert!(map.get(&Value::Int(2)).unwrap().is_none());

        assert!(matches!(
            state.release_after("nope"),
            Err(CoreError::SavepointNotFound { .. })
        ));
        assert_eq!(state.release_after("start").unwrap(), 0);
        assert!(state.release_after("mid").is_err());

        state.status = TransactionState::Committed;
        assert!(matches!(
            state.ensure_active(owner),
            Err(CoreError::TransactionClosed { .. })
        ));
    }
}
