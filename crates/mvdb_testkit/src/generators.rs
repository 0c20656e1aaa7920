//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, values, rows and whole transaction
//! scripts, plus a reference model to check engines against.

use mvdb_codec::Value;
use mvdb_core::{CoreResult, Transaction, VersionedValue};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for map names.
pub fn map_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for scalar values (no arrays).
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<f64>().prop_map(Value::Double),
        ".{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ]
}

/// Strategy for arbitrary values, nesting arrays up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 32, 6, |inner| {
        prop::collection::vec(inner, 0..6).prop_map(Value::Array)
    })
}

/// Strategy for keys drawn from a small space, so scripts revisit rows.
pub fn key_strategy(space: i64) -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => (0..space).prop_map(Value::Int),
        1 => (0..space).prop_map(|k| Value::Text(format!("k{k:04}"))),
    ]
}

/// Strategy for rows of `columns` scalar columns.
pub fn versioned_value_strategy(columns: usize) -> impl Strategy<Value = VersionedValue> {
    (any::<u32>(), prop::collection::vec(scalar_value_strategy(), columns))
        .prop_map(|(version, columns)| VersionedValue::new(version, columns))
}

/// One write inside a transaction script.
#[derive(Debug, Clone)]
pub enum MapOp {
    /// Store a value.
    Put(Value, Value),
    /// Remove a key.
    Remove(Value),
}

/// Strategy for writes over `space` keys, mostly puts.
pub fn map_op_strategy(space: i64) -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (key_strategy(space), scalar_value_strategy()).prop_map(|(k, v)| MapOp::Put(k, v)),
        1 => key_strategy(space).prop_map(MapOp::Remove),
    ]
}

/// The writes of one transaction and how it ends.
#[derive(Debug, Clone)]
pub struct TxnScript {
    /// Writes in order.
    pub ops: Vec<MapOp>,
    /// Commit if true, roll back otherwise.
    pub commit: bool,
}

/// Strategy for a transaction script of up to `max_ops` writes.
pub fn txn_script_strategy(space: i64, max_ops: usize) -> impl Strategy<Value = TxnScript> {
    (
        prop::collection::vec(map_op_strategy(space), 0..=max_ops),
        prop::bool::weighted(0.75),
    )
        .prop_map(|(ops, commit)| TxnScript { ops, commit })
}

/// What a map should contain after a sequence of scripts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    rows: BTreeMap<Value, Value>,
}

impl Model {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows in key order.
    pub fn rows(&self) -> Vec<(Value, Value)> {
        self.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the model has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Applies a script's writes to the model if it commits.
    pub fn apply(&mut self, script: &TxnScript) {
        if !script.commit {
            return;
        }
        for op in &script.ops {
            match op {
                MapOp::Put(k, v) => {
                    self.rows.insert(k.clone(), v.clone());
                }
                MapOp::Remove(k) => {
                    self.rows.remove(k);
                }
            }
        }
    }
}

/// Runs `script`'s writes against `map` inside `txn`. Ending the
/// transaction is left to the caller.
pub fn run_script(txn: &Transaction, map: &str, script: &TxnScript) -> CoreResult<()> {
    let map = txn.open_map::<Value>(map)?;
    for op in &script.ops {
        match op {
            MapOp::Put(k, v) => {
                map.put(k.clone(), v.clone())?;
            }
            MapOp::Remove(k) => {
                map.remove(k)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{read_all, TestEngine};
    use mvdb_core::TransactionOptions;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn engine_matches_model(scripts in prop::collection::vec(txn_script_strategy(32, 6), 1..12)) {
            let test = TestEngine::memory();
            let mut model = Model::new();
            for script in &scripts {
                let txn = test.begin(TransactionOptions::default()).unwrap();
                run_script(&txn, "t", script).unwrap();
                if script.commit {
                    txn.commit().unwrap();
                } else {
                    txn.rollback().unwrap();
                }
                model.apply(script);
            }
            prop_assert_eq!(read_all(&test, "t"), model.rows());
        }

        #[test]
        fn generated_map_names_are_nonempty(name in map_name_strategy()) {
            prop_assert!(!name.is_empty());
        }

        #[test]
        fn versioned_rows_have_requested_width(row in versioned_value_strategy(4)) {
            prop_assert_eq!(row.columns().len(), 4);
        }
    }
}
