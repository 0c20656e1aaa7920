//! B-tree page storage and the map built on it.
//!
//! - [`page`]: immutable in-memory pages with lazily loaded children
//! - [`codec`]: page frames (length, kind, compression, CRC32) and payloads
//! - [`chunk`]: chunk files, space accounting, garbage collection
//! - [`map`]: copy-on-write ordered map and its checkpoint snapshots
//! - [`cursor`]: ordered traversal with an explicit frame stack

pub(crate) mod chunk;
pub(crate) mod codec;
mod cursor;
mod map;
pub(crate) mod page;

pub use cursor::{BTreeCursor, CursorParameters};
pub use map::{BTreeMap, Mutation};
pub(crate) use map::{MapSnapshot, StoredMap};
