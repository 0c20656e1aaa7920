//! # mvdb testkit
//!
//! Test utilities for mvdb.
//!
//! This crate provides:
//! - Test fixtures: temporary engines on memory or disk, crash and reopen
//! - Property-based test generators using proptest
//! - A crash recovery harness driven by the in-memory file system
//! - Contention stress runners
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mvdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     with_temp_engine(|engine| {
//!         put_rows(engine, "t", 0..10);
//!         assert_eq!(read_all(engine, "t").len(), 10);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
