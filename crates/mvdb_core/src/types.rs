//! Core type definitions for mvdb.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction ids and commit ids are drawn from the same monotonically
/// increasing counter and are never reused, so a commit id can be compared
/// directly with a reader's snapshot id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Id carried by values that predate any tracked commit.
    pub const ZERO: Self = Self(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier of a chunk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Creates a new chunk ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// File name of this chunk inside the database directory.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("chunk_{:08}.db", self.0)
    }

    /// Parses a chunk file name back into its id.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix("chunk_")?
            .strip_suffix(".db")?
            .parse()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk:{}", self.0)
    }
}

/// Address of a persisted page: `(chunk, offset)` plus its stored length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PagePos {
    /// Chunk holding the page.
    pub chunk: ChunkId,
    /// Byte offset of the page inside the chunk file.
    pub offset: u32,
    /// Stored length including the page header.
    pub len: u32,
}

impl PagePos {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = 12;

    /// Creates a page position.
    #[must_use]
    pub const fn new(chunk: ChunkId, offset: u32, len: u32) -> Self {
        Self { chunk, offset, len }
    }
}

impl fmt::Display for PagePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.chunk, self.offset, self.len)
    }
}

/// Position inside the redo log: file id and byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    /// Redo log file id.
    pub file: u64,
    /// Byte offset within that file.
    pub offset: u64,
}

impl LogPosition {
    /// Creates a log position.
    #[must_use]
    pub const fn new(file: u64, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log:{}:{}", self.file, self.offset)
    }
}

/// The checkpoint mark.
///
/// Everything logged before `log_position` is durable in pages;
/// `last_gc_meta_id` counts completed chunk-GC passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointMark {
    /// Id of the last chunk-GC pass.
    pub last_gc_meta_id: u64,
    /// Redo log position covered by page storage.
    pub log_position: LogPosition,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each read sees the latest committed value.
    #[default]
    ReadCommitted,
    /// Reads see the state as of the transaction's begin.
    RepeatableRead,
}

/// Leaf page layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageStorageMode {
    /// Whole records stored contiguously.
    #[default]
    Row,
    /// One sub-page per column, decoded lazily.
    Column,
}

impl PageStorageMode {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Row => 0,
            Self::Column => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Row),
            1 => Some(Self::Column),
            _ => None,
        }
    }
}
