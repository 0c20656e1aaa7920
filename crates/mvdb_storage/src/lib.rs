//! # mvdb Storage
//!
//! Byte-store backends and the file-system abstraction used by mvdb.
//!
//! Backends are **opaque byte stores**: they do not interpret the pages,
//! chunks, manifests or redo records written through them.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, append, flush, sync)
//! - A [`FileSystem`] hands out named backends and atomic small-file writes
//! - Everything is `Send + Sync` for concurrent access
//! - The engine owns all file format interpretation
//!
//! ## Available Implementations
//!
//! - [`InMemoryBackend`] / [`MemoryFs`] - For testing, including crash simulation
//! - [`FileBackend`] / [`DirectoryFs`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use mvdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod fs;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use fs::{DirectoryFs, FileSystem, MemoryFs};
pub use memory::InMemoryBackend;
