//! The value contract of B-tree maps.

use mvdb_codec::{CodecError, CodecResult, Reader, Value, Writer};
use std::borrow::Cow;
use std::fmt;

/// A value that can be stored in a [`crate::BTreeMap`].
///
/// Besides encoding, a map value decides what a checkpoint persists
/// ([`MapValue::persistent`]) and whether it can be split into columns for
/// column-stored leaves ([`MapValue::columns`], [`MapValue::write_head`],
/// [`MapValue::from_columns`]).
pub trait MapValue: Clone + fmt::Debug + Send + Sync + 'static {
    /// Writes the full value.
    fn write(&self, w: &mut Writer);

    /// Reads a value written by [`MapValue::write`].
    ///
    /// # Errors
    ///
    /// Returns an error for malformed input.
    fn read(r: &mut Reader<'_>) -> CodecResult<Self>;

    /// Estimated in-memory size in bytes.
    fn memory(&self) -> usize;

    /// The form a checkpoint writes to disk. `None` leaves the key out of
    /// the saved page.
    fn persistent(&self) -> Option<Cow<'_, Self>> {
        Some(Cow::Borrowed(self))
    }

    /// Column values for column-stored leaves, `None` if the value has no
    /// column structure.
    fn columns(&self) -> Option<&[Value]> {
        None
    }

    /// Writes the per-row part that is not stored in column pages.
    fn write_head(&self, _w: &mut Writer) {}

    /// Rebuilds a value from its head and column values. Columns that were
    /// not requested arrive as [`Value::Null`].
    ///
    /// # Errors
    ///
    /// Returns an error if the head is malformed or the type has no column
    /// layout.
    fn from_columns(_head: &mut Reader<'_>, _columns: Vec<Value>) -> CodecResult<Self> {
        Err(CodecError::invalid_structure(
            "value type has no column layout",
        ))
    }
}

impl MapValue for Value {
    fn write(&self, w: &mut Writer) {
        w.put_value(self);
    }

    fn read(r: &mut Reader<'_>) -> CodecResult<Self> {
        r.value()
    }

    fn memory(&self) -> usize {
        Value::memory(self)
    }
}
