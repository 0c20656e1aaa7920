//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Unexpected end of input.
    #[error("unexpected end of input: needed {needed} bytes at offset {offset}")]
    UnexpectedEof {
        /// Offset where the read started.
        offset: usize,
        /// Number of bytes requested.
        needed: usize,
    },

    /// Unknown value tag.
    #[error("unknown value tag: {0:#04x}")]
    InvalidTag(u8),

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A varint ran past 64 bits.
    #[error("varint overflow")]
    VarintOverflow,

    /// A length prefix exceeds the decoder limits.
    #[error("length {len} exceeds limit {limit}")]
    LengthLimit {
        /// Decoded length.
        len: u64,
        /// Allowed maximum.
        limit: u64,
    },

    /// Structurally invalid input.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }
}
