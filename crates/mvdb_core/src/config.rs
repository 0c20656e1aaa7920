//! Engine configuration.

use crate::types::PageStorageMode;
use std::time::Duration;

/// When the redo log is synced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSyncPolicy {
    /// Sync before every commit returns.
    Sync,
    /// Sync at most once per interval. A crash can lose commits from the
    /// last unsynced interval.
    Periodic {
        /// Maximum time between syncs.
        interval: Duration,
    },
}

/// What a blocking write does when the row is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWaitPolicy {
    /// Fail with `Locked` immediately.
    NoWait,
    /// Wait for the holder to finish, failing with `LockTimeout` after
    /// `timeout`.
    Wait {
        /// Upper bound on the wait.
        timeout: Duration,
    },
}

/// Page compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Store payloads as-is.
    None,
    /// LZ4 block compression when it shrinks the payload.
    Lz4,
}

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Split threshold for pages, in estimated serialized bytes.
    pub page_size: usize,

    /// Compression applied to page payloads.
    pub compression: Compression,

    /// Redo log durability policy.
    pub log_sync: LogSyncPolicy,

    /// How often to checkpoint automatically (zero = only on demand).
    pub checkpoint_interval: Duration,

    /// Redo log size that triggers a checkpoint on the next tick.
    pub max_redo_log_size: u64,

    /// Chunks whose live-byte ratio falls below this percentage are
    /// compacted during checkpoints.
    pub min_chunk_fill_rate: u8,

    /// Behavior of blocking writes on locked rows.
    pub lock_wait: LockWaitPolicy,

    /// How many times `run_transaction` retries on lock or conflict errors.
    pub transaction_retries: u32,

    /// Number of cooperative schedulers.
    pub schedulers: usize,

    /// Whether schedulers run on their own threads. When off, callers
    /// drive queued tasks with `run_once`, and due checkpoints and redo
    /// syncs run on committing threads.
    pub background_workers: bool,

    /// Scheduler idle tick.
    pub scheduler_tick: Duration,

    /// Leaf layout for maps that don't choose one.
    pub default_storage_mode: PageStorageMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            page_size: 16 * 1024,
            compression: Compression::Lz4,
            log_sync: LogSyncPolicy::Sync,
            checkpoint_interval: Duration::from_secs(30),
            max_redo_log_size: 32 * 1024 * 1024, // 32 MB
            min_chunk_fill_rate: 50,
            lock_wait: LockWaitPolicy::Wait {
                timeout: Duration::from_secs(2),
            },
            transaction_retries: 3,
            schedulers: 1,
            background_workers: false,
            scheduler_tick: Duration::from_millis(10),
            default_storage_mode: PageStorageMode::Row,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the page split threshold.
    #[must_use]
    pub const fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets page compression.
    #[must_use]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the redo log durability policy.
    #[must_use]
    pub const fn log_sync(mut self, policy: LogSyncPolicy) -> Self {
        self.log_sync = policy;
        self
    }

    /// Sets the automatic checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the redo log size that forces a checkpoint.
    #[must_use]
    pub const fn max_redo_log_size(mut self, bytes: u64) -> Self {
        self.max_redo_log_size = bytes;
        self
    }

    /// Sets the compaction threshold (percent of live bytes).
    #[must_use]
    pub const fn min_chunk_fill_rate(mut self, percent: u8) -> Self {
        self.min_chunk_fill_rate = percent;
        self
    }

    /// Sets the lock wait policy.
    #[must_use]
    pub const fn lock_wait(mut self, policy: LockWaitPolicy) -> Self {
        self.lock_wait = policy;
        self
    }

    /// Sets the retry budget of `run_transaction`.
    #[must_use]
    pub const fn transaction_retries(mut self, retries: u32) -> Self {
        self.transaction_retries = retries;
        self
    }

    /// Sets the number of schedulers.
    #[must_use]
    pub const fn schedulers(mut self, count: usize) -> Self {
        self.schedulers = count;
        self
    }

    /// Sets whether schedulers get their own threads.
    #[must_use]
    pub const fn background_workers(mut self, value: bool) -> Self {
        self.background_workers = value;
        self
    }

    /// Sets the scheduler idle tick.
    #[must_use]
    pub const fn scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    /// Sets the default leaf layout.
    #[must_use]
    pub const fn default_storage_mode(mut self, mode: PageStorageMode) -> Self {
        self.default_storage_mode = mode;
        self
    }

    /// The storage-level subset of this configuration.
    #[must_use]
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            page_size: self.page_size,
            compression: self.compression,
            min_chunk_fill_rate: self.min_chunk_fill_rate,
            default_storage_mode: self.default_storage_mode,
        }
    }
}

/// Settings used by [`crate::Storage`] on its own.
#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    /// Split threshold for pages.
    pub page_size: usize,
    /// Compression applied to page payloads.
    pub compression: Compression,
    /// Compaction threshold in percent.
    pub min_chunk_fill_rate: u8,
    /// Leaf layout for maps that don't choose one.
    pub default_storage_mode: PageStorageMode,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Config::default().storage_config()
    }
}

/// Per-map settings passed to `open_btree_map`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapConfig {
    /// Leaf layout; `None` uses the storage default.
    pub storage_mode: Option<PageStorageMode>,
}

impl MapConfig {
    /// Creates map settings with the storage defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self { storage_mode: None }
    }

    /// Selects the leaf layout.
    #[must_use]
    pub const fn storage_mode(mut self, mode: PageStorageMode) -> Self {
        self.storage_mode = Some(mode);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert_eq!(config.log_sync, LogSyncPolicy::Sync);
        assert_eq!(config.page_size, 16 * 1024);
        assert!(matches!(config.lock_wait, LockWaitPolicy::Wait { .. }));
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .page_size(512)
            .compression(Compression::None)
            .log_sync(LogSyncPolicy::Periodic {
                interval: Duration::from_millis(5),
            })
            .lock_wait(LockWaitPolicy::NoWait)
            .schedulers(4);

        assert_eq!(config.page_size, 512);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.lock_wait, LockWaitPolicy::NoWait);
        assert_eq!(config.schedulers, 4);
        assert_eq!(config.storage_config().page_size, 512);
    }

    #[test]
    fn map_config_overrides_mode() {
        assert_eq!(MapConfig::new().storage_mode, None);
        assert_eq!(
            MapConfig::new()
                .storage_mode(PageStorageMode::Column)
                .storage_mode,
            Some(PageStorageMode::Column)
        );
    }
}
