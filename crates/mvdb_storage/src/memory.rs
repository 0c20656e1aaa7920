//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Contents of one in-memory file.
#[derive(Debug, Default)]
pub(crate) struct MemoryFile {
    pub(crate) bytes: Vec<u8>,
    /// Length covered by the last `sync`.
    pub(crate) synced: usize,
}

pub(crate) type SharedFile = Arc<RwLock<MemoryFile>>;

/// An in-memory storage backend.
///
/// Handles opened on the same [`crate::MemoryFs`] file share one buffer, so a
/// file written by one engine instance can be read by the next one. The
/// backend remembers how much of the buffer was synced, which lets
/// [`crate::MemoryFs::simulate_crash`] drop unsynced bytes.
///
/// # Example
///
/// ```rust
/// use mvdb_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    file: SharedFile,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing, synced data.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let synced = data.len();
        Self {
            file: Arc::new(RwLock::new(MemoryFile {
                bytes: data,
                synced,
            })),
        }
    }

    pub(crate) fn shared(file: SharedFile) -> Self {
        Self { file }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.file.read().bytes.clone()
    }

    /// Returns the length covered by the last sync.
    #[must_use]
    pub fn synced_len(&self) -> u64 {
        self.file.read().synced as u64
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let file = self.file.read();
        let size = file.bytes.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if offset > size || end > file.bytes.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(file.bytes[start..end].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.write();
        let offset = file.bytes.len() as u64;
        file.bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.file.read().bytes.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.synced = file.bytes.len();
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut file = self.file.write();
        let current = file.bytes.len() as u64;
        if new_size > current {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to size {new_size} which is greater than current size {current}"),
            )));
        }
        file.bytes.truncate(new_size as usize);
        file.synced = file.synced.min(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn memory_read_past_end_fails() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(10, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn memory_clones_share_contents() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(reader.data(), b"shared");
    }

    #[test]
    fn memory_sync_tracks_durable_length() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"abc").unwrap();
        assert_eq!(backend.synced_len(), 0);
        backend.sync().unwrap();
        backend.append(b"def").unwrap();
        assert_eq!(backend.synced_len(), 3);

        backend.truncate(1).unwrap();
        assert_eq!(backend.synced_len(), 1);
        assert!(backend.truncate(100).is_err());
    }

    #[test]
    fn memory_with_data_is_synced() {
        let backend = InMemoryBackend::with_data(b"preloaded".to_vec());
        assert_eq!(backend.size().unwrap(), 9);
        assert_eq!(backend.synced_len(), 9);
    }
}
