//! Versioned record model.
//!
//! - [`VersionedValue`] is a row: a column vector tagged with a version.
//! - [`TransactionalValue`] is what a transactional map stores per key: the
//!   committed version chain, optionally topped by one transaction's pending
//!   write.
//! - [`MapValue`] is the contract every value stored in a B-tree map
//!   implements (encoding, size estimate, checkpoint view, column layout).

mod map_value;
mod transactional;
mod versioned;

pub use map_value::MapValue;
pub use transactional::{CommittedVersion, ReadView, TransactionalValue};
pub use versioned::VersionedValue;
