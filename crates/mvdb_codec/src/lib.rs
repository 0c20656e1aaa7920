//! # mvdb Codec
//!
//! The dynamic [`Value`] type used for B-tree keys and row columns, and the
//! compact binary format every mvdb file is built from.
//!
//! ## Encoding Rules
//!
//! - Fixed-width integers are little-endian
//! - Lengths and counts are LEB128 varints
//! - Values carry a one-byte tag followed by a type-specific body
//! - Integers inside values are zig-zag varints, doubles are raw IEEE bits
//!
//! ## Usage
//!
//! ```
//! use mvdb_codec::{decode_value, encode_value, Value};
//!
//! let value = Value::Int(42);
//! let bytes = encode_value(&value);
//! assert_eq!(decode_value(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{decode_value, Reader};
pub use encoder::{encode_value, Writer};
pub use error::{CodecError, CodecResult};
pub use value::Value;
