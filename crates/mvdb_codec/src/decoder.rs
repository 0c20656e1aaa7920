//! Binary reader.

use crate::encoder::{
    TAG_ARRAY, TAG_BYTES, TAG_DOUBLE, TAG_FALSE, TAG_INT, TAG_NULL, TAG_TEXT, TAG_TRUE,
};
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Maximum element count accepted for arrays.
/// Guards against allocation blow-ups on corrupt input.
const MAX_ARRAY_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Maximum accepted byte/string length.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum array nesting depth.
const MAX_DEPTH: usize = 64;

/// Decode a single value that must span all of `bytes`.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid value or have trailing data.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut reader = Reader::new(bytes);
    let value = reader.value()?;
    if !reader.is_empty() {
        return Err(CodecError::invalid_structure(format!(
            "{} trailing bytes after value",
            reader.remaining()
        )));
    }
    Ok(value)
}

/// A cursor over a byte slice, mirroring [`crate::Writer`].
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a new reader for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read `len` raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedEof`] if fewer bytes remain.
    pub fn raw(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.raw(N)?);
        Ok(out)
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input.
    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a little-endian u16.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input.
    pub fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a little-endian u32.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input.
    pub fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read a little-endian u64.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input.
    pub fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Read an unsigned LEB128 varint.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input or if the varint exceeds 64 bits.
    pub fn varint(&mut self) -> CodecResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::VarintOverflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::VarintOverflow);
            }
        }
    }

    /// Read a zig-zag encoded signed varint.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input or on overflow.
    #[allow(clippy::cast_possible_wrap)]
    pub fn signed_varint(&mut self) -> CodecResult<i64> {
        let v = self.varint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    /// Read a varint count bounded by `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthLimit`] if the count exceeds `limit`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn length(&mut self, limit: u64) -> CodecResult<usize> {
        let len = self.varint()?;
        if len > limit {
            return Err(CodecError::LengthLimit { len, limit });
        }
        Ok(len as usize)
    }

    /// Read varint-length-prefixed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error at end of input or if the length is out of bounds.
    pub fn bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.length(MAX_BYTES_LENGTH)?;
        self.raw(len)
    }

    /// Read a varint-length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidUtf8`] for malformed text.
    pub fn str(&mut self) -> CodecResult<&'a str> {
        std::str::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a tagged value.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tags, truncated input or excessive nesting.
    pub fn value(&mut self) -> CodecResult<Value> {
        self.value_at_depth(0)
    }

    fn value_at_depth(&mut self, depth: usize) -> CodecResult<Value> {
        let tag = self.u8()?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(self.signed_varint()?),
            TAG_DOUBLE => Value::Double(f64::from_bits(self.u64()?)),
            TAG_TEXT => Value::Text(self.str()?.to_string()),
            TAG_BYTES => Value::Bytes(self.bytes()?.to_vec()),
            TAG_ARRAY => {
                if depth >= MAX_DEPTH {
                    return Err(CodecError::invalid_structure("array nesting too deep"));
                }
                let count = self.length(MAX_ARRAY_ELEMENTS)?;
                // Each element takes at least one byte.
                if count > self.remaining() {
                    return Err(CodecError::UnexpectedEof {
                        offset: self.pos,
                        needed: count,
                    });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value_at_depth(depth + 1)?);
                }
                Value::Array(items)
            }
            other => return Err(CodecError::InvalidTag(other)),
        };
        Ok(value)
    }
}
