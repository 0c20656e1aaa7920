//! The byte-store trait behind every mvdb file.

use crate::error::StorageResult;

/// An append-only byte store with random reads.
///
/// mvdb writes two kinds of files through this trait. Chunk files are
/// appended once by a checkpoint, synced, and from then on only read at
/// page offsets. Redo log files grow record by record and may be synced
/// after each commit or periodically; after a crash their tail may be
/// shorter than what was appended.
///
/// Offsets returned by [`append`](Self::append) are stable for the life
/// of the store: later appends never move earlier bytes.
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::ReadPastEnd`] if the range
    /// ends past [`size`](Self::size), or on I/O failure.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset of its first byte.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered appends to the operating system.
    ///
    /// Flushed bytes survive a process crash but not a power loss.
    fn flush(&mut self) -> StorageResult<()>;

    /// Current length in bytes; the next append lands here.
    fn size(&self) -> StorageResult<u64>;

    /// Makes every appended byte durable, file length included.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_size` bytes.
    ///
    /// Used when a redo log file is reused after rotation. Growing the
    /// store this way is an error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
