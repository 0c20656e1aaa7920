//! Binary writer.

use crate::value::Value;

pub(crate) const TAG_NULL: u8 = 0;
pub(crate) const TAG_FALSE: u8 = 1;
pub(crate) const TAG_TRUE: u8 = 2;
pub(crate) const TAG_INT: u8 = 3;
pub(crate) const TAG_DOUBLE: u8 = 4;
pub(crate) const TAG_TEXT: u8 = 5;
pub(crate) const TAG_BYTES: u8 = 6;
pub(crate) const TAG_ARRAY: u8 = 7;

/// Encode a value to bytes.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.put_value(value);
    writer.into_bytes()
}

/// An append-only little-endian byte writer.
///
/// Fixed-width integers are little-endian; lengths and counts are LEB128
/// varints; signed integers inside values are zig-zag varints.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buffer: Vec<u8>,
}

impl Writer {
    /// Create a new writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new writer with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get a reference to the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume this writer and return the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Write one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    /// Write a little-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite four bytes at `at` with a little-endian u32.
    ///
    /// Used to backfill length prefixes and check values reserved earlier.
    ///
    /// # Panics
    ///
    /// Panics if `at + 4` is past the written length.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.buffer[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Write an unsigned LEB128 varint.
    #[allow(clippy::cast_possible_truncation)]
    pub fn put_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.buffer.push((v as u8) | 0x80);
            v >>= 7;
        }
        self.buffer.push(v as u8);
    }

    /// Write a zig-zag encoded signed varint.
    #[allow(clippy::cast_sign_loss)]
    pub fn put_signed_varint(&mut self, v: i64) {
        self.put_varint(((v << 1) ^ (v >> 63)) as u64);
    }

    /// Write raw bytes without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Write varint-length-prefixed bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    /// Write a varint-length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Write a tagged value.
    pub fn put_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.put_u8(TAG_NULL),
            Value::Bool(false) => self.put_u8(TAG_FALSE),
            Value::Bool(true) => self.put_u8(TAG_TRUE),
            Value::Int(n) => {
                self.put_u8(TAG_INT);
                self.put_signed_varint(*n);
            }
            Value::Double(d) => {
                self.put_u8(TAG_DOUBLE);
                self.put_u64(d.to_bits());
            }
            Value::Text(s) => {
                self.put_u8(TAG_TEXT);
                self.put_str(s);
            }
            Value::Bytes(b) => {
                self.put_u8(TAG_BYTES);
                self.put_bytes(b);
            }
            Value::Array(items) => {
                self.put_u8(TAG_ARRAY);
                self.put_varint(items.len() as u64);
                for item in items {
                    self.put_value(item);
                }
            }
        }
    }
}
