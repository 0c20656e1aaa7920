//! Redo log for durability and crash recovery.
//!
//! Every commit appends its final row values and a commit marker before any
//! of its values become visible. On open the log is replayed from the
//! checkpoint mark; row changes are held per map and applied when the map is
//! first opened, since only then is the value type known.
//!
//! ## Record Format
//!
//! ```text
//! | magic "MVRL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! Tolerated (clean end of log):
//!
//! - truncated header or payload at the end of a file, left by a crash
//!   before the write was synced
//!
//! Fatal (the open fails):
//!
//! - CRC mismatch, bad magic, unknown record type, future version
//!
//! Only transactions whose commit marker was read are applied.

mod iterator;
mod record;
mod writer;

pub use iterator::RedoRecordIterator;
pub use record::{RedoRecord, RedoRecordType, REDO_MAGIC, REDO_VERSION};
pub use writer::{log_file_id, log_file_name, PendingOp, PendingRecord, RedoLog, Replay};

use crate::btree::BTreeMap;
use crate::error::{CoreError, CoreResult};
use crate::record::{MapValue, TransactionalValue};
use crate::types::TransactionId;
use mvdb_codec::{Reader, Value};

/// Decodes held changes for a map of `V`.
pub(crate) fn decode_pending<V: MapValue>(
    map: &str,
    records: &[PendingRecord],
) -> CoreResult<Vec<(TransactionId, Value, Option<V>)>> {
    records
        .iter()
        .map(|record| match &record.op {
            PendingOp::Put { key, value } => {
                let mut r = Reader::new(value);
                let decoded = V::read(&mut r).map_err(|e| {
                    CoreError::log_corruption(format!("value for {key} in map {map}: {e}"))
                })?;
                Ok((record.commit_id, key.clone(), Some(decoded)))
            }
            PendingOp::Remove { key } => Ok((record.commit_id, key.clone(), None)),
        })
        .collect()
}

/// Applies decoded changes as committed slots. Returns how many were applied.
pub(crate) fn apply_pending<V: MapValue>(
    map: &BTreeMap<TransactionalValue<V>>,
    changes: Vec<(TransactionId, Value, Option<V>)>,
) -> CoreResult<usize> {
    let count = changes.len();
    for (commit_id, key, value) in changes {
        match value {
            Some(value) => {
                map.put(key, TransactionalValue::committed(commit_id, value))?;
            }
            None => {
                map.remove(&key)?;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::chunk::ChunkStore;
    use crate::config::StorageConfig;
    use crate::context::EngineContext;
    use crate::record::ReadView;
    use crate::types::PageStorageMode;
    use mvdb_codec::Writer;
    use mvdb_storage::MemoryFs;
    use std::sync::Arc;

    fn encoded(value: &Value) -> Vec<u8> {
        let mut w = Writer::new();
        value.write(&mut w);
        w.into_bytes()
    }

    #[test]
    fn held_changes_apply_as_committed_slots() {
        let fs = Arc::new(MemoryFs::new());
        let store = ChunkStore::open(
            fs,
            Arc::new(EngineContext::new()),
            StorageConfig::default(),
            Vec::new(),
            1,
        )
        .unwrap();
        let map: BTreeMap<TransactionalValue<Value>> =
            BTreeMap::open(1, "m".into(), PageStorageMode::Row, Arc::new(store), None).unwrap();
        map.put(
            Value::Int(2),
            TransactionalValue::committed(TransactionId::new(1), Value::from("old")),
        )
        .unwrap();

        let records = vec![
            PendingRecord {
                commit_id: TransactionId::new(5),
                op: PendingOp::Put {
                    key: Value::Int(1),
                    value: encoded(&Value::from("one")),
                },
            },
            PendingRecord {
                commit_id: TransactionId::new(6),
                op: PendingOp::Remove { key: Value::Int(2) },
            },
        ];
        let changes = decode_pending::<Value>("m", &records).unwrap();
        assert_eq!(apply_pending(&map, changes).unwrap(), 2);

        let slot = map.get(&Value::Int(1)).unwrap().unwrap();
        let view = ReadView::read_committed(TransactionId::new(9));
        assert_eq!(slot.visible_value(&view), Some(&Value::from("one")));
        assert_eq!(
            slot.committed_version().unwrap().commit_id(),
            TransactionId::new(5)
        );
        assert!(map.get(&Value::Int(2)).unwrap().is_none());
    }

    #[test]
    fn undecodable_value_is_log_corruption() {
        let records = vec![PendingRecord {
            commit_id: TransactionId::new(1),
            op: PendingOp::Put {
                key: Value::Int(1),
                value: vec![0xEE],
            },
        }];
        let err = decode_pending::<Value>("m", &records).unwrap_err();
        assert!(matches!(err, CoreError::LogCorruption { .. }));
    }
}
