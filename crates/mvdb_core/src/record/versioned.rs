//! Row values with a revision number.

use crate::record::MapValue;
use mvdb_codec::{CodecResult, Reader, Value, Writer};

/// Upper bound on columns per row accepted when decoding.
const MAX_COLUMNS: u64 = 64 * 1024;

/// A row: ordered column values plus a version.
///
/// Instances are never modified; every logical update builds a new value
/// whose `version` is one higher. Writers that read a row, change a subset
/// of its columns and write it back use the version to detect that someone
/// else revised the row in between.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedValue {
    version: u32,
    columns: Vec<Value>,
}

impl VersionedValue {
    /// Creates a row at the given version.
    #[must_use]
    pub fn new(version: u32, columns: Vec<Value>) -> Self {
        Self { version, columns }
    }

    /// Creates a first-version row.
    #[must_use]
    pub fn initial(columns: Vec<Value>) -> Self {
        Self::new(0, columns)
    }

    /// The row version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// All column values.
    #[must_use]
    pub fn columns(&self) -> &[Value] {
        &self.columns
    }

    /// One column, if present.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&Value> {
        self.columns.get(index)
    }

    /// Builds the next revision with all columns replaced.
    #[must_use]
    pub fn revise(&self, columns: Vec<Value>) -> Self {
        Self::new(self.version.wrapping_add(1), columns)
    }

    /// Builds the next revision with one column replaced. Missing columns
    /// up to `index` are filled with nulls.
    #[must_use]
    pub fn with_column(&self, index: usize, value: Value) -> Self {
        let mut columns = self.columns.clone();
        if columns.len() <= index {
            columns.resize(index + 1, Value::Null);
        }
        columns[index] = value;
        self.revise(columns)
    }
}

impl MapValue for VersionedValue {
    fn write(&self, w: &mut Writer) {
        w.put_varint(u64::from(self.version));
        w.put_varint(self.columns.len() as u64);
        for column in &self.columns {
            w.put_value(column);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        let version = r.varint()? as u32;
        let count = r.length(MAX_COLUMNS)?;
        let mut columns = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            columns.push(r.value()?);
        }
        Ok(Self { version, columns })
    }

    fn memory(&self) -> usize {
        16 + self.columns.iter().map(Value::memory).sum::<usize>()
    }

    fn columns(&self) -> Option<&[Value]> {
        Some(&self.columns)
    }

    fn write_head(&self, w: &mut Writer) {
        w.put_varint(u64::from(self.version));
        w.put_varint(self.columns.len() as u64);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_columns(head: &mut Reader<'_>, mut columns: Vec<Value>) -> CodecResult<Self> {
        let version = head.varint()? as u32;
        let count = head.length(MAX_COLUMNS)?;
        columns.resize(count, Value::Null);
        Ok(Self { version, columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(version: u32, cols: &[i64]) -> VersionedValue {
        VersionedValue::new(version, cols.iter().map(|&c| Value::Int(c)).collect())
    }

    #[test]
    fn revisions_bump_version() {
        let v = row(3, &[1, 2]);
        let next = v.with_column(1, Value::Int(20));
        assert_eq!(next.version(), 4);
        assert_eq!(next.columns(), &[Value::Int(1), Value::Int(20)]);
        assert_eq!(v.columns(), &[Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn with_column_pads_missing_columns() {
        let next = VersionedValue::initial(vec![]).with_column(2, Value::from("x"));
        assert_eq!(
            next.columns(),
            &[Value::Null, Value::Null, Value::from("x")]
        );
    }

    #[test]
    fn column_split_rebuilds_row() {
        let v = row(7, &[10, 20, 30]);
        let mut head = Writer::new();
        v.write_head(&mut head);
        let head = head.into_bytes();

        let columns = v.columns().to_vec();
        let rebuilt =
            VersionedValue::from_columns(&mut Reader::new(&head), columns).unwrap();
        assert_eq!(rebuilt, v);
    }

    #[test]
    fn partial_columns_come_back_as_nulls() {
        let v = row(1, &[10, 20, 30]);
        let mut head = Writer::new();
        v.write_head(&mut head);
        let head = head.into_bytes();

        let rebuilt = VersionedValue::from_columns(
            &mut Reader::new(&head),
            vec![Value::Null, Value::Int(20)],
        )
        .unwrap();
        assert_eq!(
            rebuilt.columns(),
            &[Value::Null, Value::Int(20), Value::Null]
        );
    }
}
