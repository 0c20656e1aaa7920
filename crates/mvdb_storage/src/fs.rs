//! Named-file access for the engine directory.
//!
//! The engine keeps several files side by side (manifest, chunk files, redo
//! log files). A [`FileSystem`] hands out a [`StorageBackend`] per name and
//! provides the atomic small-file replacement the manifest relies on.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ MANIFEST          # Map and chunk registry, checkpoint mark
//! ├─ chunk_<id>.db     # Append-only page containers
//! └─ redo_<id>.log     # Redo log files
//! ```

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::{InMemoryBackend, MemoryFile, SharedFile};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const TEMP_SUFFIX: &str = ".tmp";

/// A directory of named byte stores.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Opens the named file, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns true if the named file exists.
    fn exists(&self, name: &str) -> bool;

    /// Removes the named file. Removing a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Lists the names of all data files, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self) -> StorageResult<Vec<String>>;

    /// Reads a whole file, or `None` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the named file with `data` atomically and durably.
    ///
    /// # Errors
    ///
    /// Returns an error if writing, syncing or renaming fails.
    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()>;
}

/// A [`FileSystem`] rooted at an OS directory.
///
/// Holds an exclusive advisory lock on `LOCK` for its lifetime, so only one
/// engine can use a directory at a time.
pub struct DirectoryFs {
    path: PathBuf,
    _lock_file: File,
}

impl fmt::Debug for DirectoryFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryFs")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DirectoryFs {
    /// Opens (and optionally creates) a directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the directory is missing and
    ///   `create_if_missing` is false
    /// - [`StorageError::Locked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(StorageError::NotFound(path.display().to_string()));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StorageError::Corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl FileSystem for DirectoryFs {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open(&self.path.join(name))?))
    }

    fn exists(&self, name: &str) -> bool {
        self.path.join(name).exists()
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        match fs::remove_file(self.path.join(name)) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LOCK_FILE || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.path.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.path.join(name);
        let temp = self.path.join(format!("{name}{TEMP_SUFFIX}"));

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        self.sync_directory()
    }
}

/// A [`FileSystem`] kept entirely in memory.
///
/// Cloning shares the same files, which is how tests "restart" an engine:
/// drop it, keep the `MemoryFs`, open a new engine on it.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    files: Arc<Mutex<BTreeMap<String, SharedFile>>>,
}

impl MemoryFs {
    /// Creates an empty in-memory file system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every byte that was not covered by a `sync`, as a power loss
    /// would.
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values() {
            let mut file = file.write();
            let synced = file.synced;
            file.bytes.truncate(synced);
        }
    }

    /// Returns the current length of a file, if it exists.
    #[must_use]
    pub fn file_len(&self, name: &str) -> Option<usize> {
        self.files.lock().get(name).map(|f| f.read().bytes.len())
    }

    /// Overwrites one byte of a file. Used to inject corruption in tests.
    pub fn corrupt_byte(&self, name: &str, offset: usize) -> bool {
        let files = self.files.lock();
        let Some(file) = files.get(name) else {
            return false;
        };
        let mut file = file.write();
        match file.bytes.get_mut(offset) {
            Some(byte) => {
                *byte ^= 0xFF;
                true
            }
            None => false,
        }
    }
}

impl FileSystem for MemoryFs {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let file = self
            .files
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(InMemoryBackend::shared(file)))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }

    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .get(name)
            .map(|f| f.read().bytes.clone()))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let file = MemoryFile {
            bytes: data.to_vec(),
            synced: data.len(),
        };
        self.files
            .lock()
            .insert(name.to_string(), Arc::new(RwLock::new(file)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directory_fs_lists_data_files_only() {
        let dir = tempdir().unwrap();
        let fs = DirectoryFs::open(dir.path(), true).unwrap();

        fs.open("chunk_2.db").unwrap().append(b"x").unwrap();
        fs.open("chunk_1.db").unwrap();
        fs.write_atomic("MANIFEST", b"m").unwrap();

        assert_eq!(
            fs.list().unwrap(),
            vec!["MANIFEST", "chunk_1.db", "chunk_2.db"]
        );
    }

    #[test]
    fn directory_fs_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = DirectoryFs::open(dir.path(), true).unwrap();
        let second = DirectoryFs::open(dir.path(), true);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn directory_fs_missing_without_create_fails() {
        let dir = tempdir().unwrap();
        let result = DirectoryFs::open(&dir.path().join("nope"), false);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn directory_fs_atomic_replace_and_remove() {
        let dir = tempdir().unwrap();
        let fs = DirectoryFs::open(dir.path(), true).unwrap();

        assert!(fs.read_file("MANIFEST").unwrap().is_none());
        fs.write_atomic("MANIFEST", b"one").unwrap();
        fs.write_atomic("MANIFEST", b"two").unwrap();
        assert_eq!(fs.read_file("MANIFEST").unwrap().unwrap(), b"two");

        fs.remove("MANIFEST").unwrap();
        fs.remove("MANIFEST").unwrap();
        assert!(!fs.exists("MANIFEST"));
    }

    #[test]
    fn memory_fs_reopen_sees_previous_writes() {
        let fs = MemoryFs::new();
        fs.open("redo_1.log").unwrap().append(b"abc").unwrap();

        let again = fs.open("redo_1.log").unwrap();
        assert_eq!(again.read_at(0, 3).unwrap(), b"abc");
        assert_eq!(fs.file_len("redo_1.log"), Some(3));
    }

    #[test]
    fn memory_fs_crash_drops_unsynced_tail() {
        let fs = MemoryFs::new();
        let mut log = fs.open("redo_1.log").unwrap();
        log.append(b"durable").unwrap();
        log.sync().unwrap();
        log.append(b"lost").unwrap();
        fs.write_atomic("MANIFEST", b"m").unwrap();

        fs.simulate_crash();

        assert_eq!(fs.file_len("redo_1.log"), Some(7));
        assert_eq!(fs.read_file("MANIFEST").unwrap().unwrap(), b"m");
    }

    #[test]
    fn memory_fs_corrupt_byte_flips_bits() {
        let fs = MemoryFs::new();
        fs.write_atomic("f", &[0x0F]).unwrap();
        assert!(fs.corrupt_byte("f", 0));
        assert!(!fs.corrupt_byte("f", 5));
        assert_eq!(fs.read_file("f").unwrap().unwrap(), vec![0xF0]);
    }
}
