//! Cursor behavior through transactions, across page splits and reloads.

use mvdb_codec::Value;
use mvdb_core::{
    ChunkId, Config, CursorParameters, MapConfig, PageStorageMode, TransactionEngine,
    TransactionOptions, VersionedValue,
};
use mvdb_storage::{FileSystem, MemoryFs};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn config() -> Config {
    Config::default().page_size(256)
}

fn keys(engine: &TransactionEngine, from: Option<i64>, to: Option<i64>) -> Vec<i64> {
    let txn = engine.begin(TransactionOptions::default()).unwrap();
    let map = txn.open_map::<Value>("t").unwrap();
    let from = from.map(Value::Int);
    let to = to.map(Value::Int);
    let keys = map
        .cursor(from.as_ref(), to.as_ref())
        .unwrap()
        .map(|e| e.unwrap().0.as_int().unwrap())
        .collect();
    drop(map);
    txn.rollback().unwrap();
    keys
}

#[test]
fn cursor_visits_every_key_once_after_splits() {
    let engine = TransactionEngine::open_in_memory(config()).unwrap();
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("t")?;
            for k in 0..1000 {
                map.put(k, Value::Int(k))?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(keys(&engine, Some(500), None), (500..1000).collect::<Vec<_>>());
    assert_eq!(keys(&engine, None, None).len(), 1000);
    assert_eq!(keys(&engine, Some(10), Some(19)), (10..=19).collect::<Vec<_>>());
    assert!(keys(&engine, Some(2000), None).is_empty());
}

#[test]
fn cursor_shows_own_writes_and_hides_others() {
    let engine = TransactionEngine::open_in_memory(config()).unwrap();
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("t")?;
            for k in (0..20).step_by(2) {
                map.put(k, Value::Int(k))?;
            }
            Ok(())
        })
        .unwrap();

    let writer = engine.begin(TransactionOptions::default()).unwrap();
    let map = writer.open_map::<Value>("t").unwrap();
    map.put(1, Value::Int(1)).unwrap();
    map.remove(&Value::Int(2)).unwrap();

    let mine: Vec<i64> = map
        .cursor(None, Some(&Value::Int(5)))
        .unwrap()
        .map(|e| e.unwrap().0.as_int().unwrap())
        .collect();
    assert_eq!(mine, vec![0, 1, 4]);
    assert_eq!(keys(&engine, None, Some(5)), vec![0, 2, 4]);
}

#[test]
fn cursor_survives_checkpoint_and_reopen() {
    let fs = MemoryFs::new();
    let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config()).unwrap();
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("t")?;
            for k in (0..600).rev() {
                map.put(k, Value::from(format!("row {k}")))?;
            }
            Ok(())
        })
        .unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = TransactionEngine::open_with_fs(Arc::new(fs), config()).unwrap();
    assert_eq!(keys(&engine, Some(123), Some(456)), (123..=456).collect::<Vec<_>>());
}

#[test]
fn open_cursor_reads_pages_replaced_by_a_checkpoint() {
    let fs = MemoryFs::new();
    let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config()).unwrap();
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("t")?;
            for k in 0..300 {
                map.put(k, Value::Int(k))?;
            }
            Ok(())
        })
        .unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config()).unwrap();
    let reader = engine.begin(TransactionOptions::default()).unwrap();
    let map = reader.open_map::<Value>("t").unwrap();
    let old: Vec<ChunkId> = engine.storage().chunks().iter().map(|c| c.id).collect();
    assert!(!old.is_empty());
    let cursor = map.cursor(None, None).unwrap();

    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("t")?;
            for k in 0..300 {
                map.put(k, Value::Int(-k))?;
            }
            Ok(())
        })
        .unwrap();
    engine.checkpoint().unwrap();
    assert!(old.iter().all(|id| fs.exists(&id.file_name())));

    let values: Vec<i64> = cursor.map(|e| e.unwrap().1.as_int().unwrap()).collect();
    assert_eq!(values, (0..300).collect::<Vec<_>>());
    drop(map);
    reader.rollback().unwrap();

    let report = engine.checkpoint().unwrap();
    assert_eq!(report.chunks_deleted, old.len());
    assert!(old.iter().all(|id| !fs.exists(&id.file_name())));
}

#[test]
fn column_pages_project_requested_columns() {
    let fs = MemoryFs::new();
    let columnar = MapConfig::new().storage_mode(PageStorageMode::Column);
    let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), config()).unwrap();
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map_with::<VersionedValue>("rows", columnar)?;
            for k in 0..200 {
                let row = VersionedValue::initial(vec![
                    Value::Int(k),
                    Value::from(format!("name {k}")),
                    Value::Bytes(vec![0; 32]),
                ]);
                map.put(k, row)?;
            }
            Ok(())
        })
        .unwrap();
    engine.close().unwrap();
    drop(engine);

    let engine = TransactionEngine::open_with_fs(Arc::new(fs), config()).unwrap();
    let txn = engine.begin(TransactionOptions::default()).unwrap();
    let map = txn.open_map_with::<VersionedValue>("rows", columnar).unwrap();
    let rows: Vec<(Value, VersionedValue)> = map
        .cursor_with(CursorParameters::new().from(50).to(59).columns(vec![1]))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(rows.len(), 10);
    for (key, row) in &rows {
        let k = key.as_int().unwrap();
        assert_eq!(row.column(1), Some(&Value::from(format!("name {k}"))));
        assert_eq!(row.column(0), Some(&Value::Null));
    }

    let full = map.get(&Value::Int(7)).unwrap().unwrap();
    assert_eq!(full.column(0), Some(&Value::Int(7)));
    assert_eq!(full.column(2), Some(&Value::Bytes(vec![0; 32])));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cursor_matches_sorted_key_set(
        inserted in prop::collection::btree_set(-500i64..500, 0..300),
        from in -600i64..600,
    ) {
        let engine = TransactionEngine::open_in_memory(config()).unwrap();
        engine
            .run_transaction(TransactionOptions::default(), |txn| {
                let map = txn.open_map::<Value>("t")?;
                for k in &inserted {
                    map.put(*k, Value::Int(*k))?;
                }
                Ok(())
            })
            .unwrap();

        let expected: Vec<i64> = inserted.range(from..).copied().collect();
        prop_assert_eq!(keys(&engine, Some(from), None), expected);
        let all: BTreeSet<i64> = keys(&engine, None, None).into_iter().collect();
        prop_assert_eq!(all, inserted);
    }
}
