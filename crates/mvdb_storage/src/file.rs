//! OS file backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A [`StorageBackend`] over one OS file.
///
/// The length is tracked in memory so readers never take the file lock
/// just to bounds-check. `sync` is `File::sync_all`, which also makes the
/// new length durable.
///
/// ```no_run
/// use mvdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut chunk = FileBackend::open(Path::new("chunk_00000001.db")).unwrap();
/// let offset = chunk.append(b"page bytes").unwrap();
/// chunk.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    len: AtomicU64,
}

impl FileBackend {
    /// Opens `path`, creating an empty file if needed.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.len.load(Ordering::Acquire);
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let mut buf = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.lock();
        let offset = self.len.load(Ordering::Acquire);
        if !data.is_empty() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            self.len.store(offset + data.len() as u64, Ordering::Release);
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.lock();
        let size = self.len.load(Ordering::Acquire);
        if new_size > size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: truncate to {new_size} exceeds length {size}", self.path.display()),
            )));
        }
        file.set_len(new_size)?;
        file.sync_all()?;
        self.len.store(new_size, Ordering::Release);
        Ok(())
    }
}
