//! Test fixtures and engine helpers.
//!
//! Provides temporary engines that can be crashed and reopened, plus
//! shortcuts for the reads and writes most tests start with.

use mvdb_codec::Value;
use mvdb_core::{Config, TransactionEngine, TransactionOptions};
use mvdb_storage::MemoryFs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Where a [`TestEngine`] keeps its files.
#[derive(Debug)]
pub enum TestBackend {
    /// Shared in-memory files; survives engine restarts and simulated crashes.
    Memory(MemoryFs),
    /// A temporary directory, removed when the fixture is dropped.
    Directory(TempDir),
}

impl TestBackend {
    fn open(&self, config: Config) -> TransactionEngine {
        match self {
            TestBackend::Memory(fs) => {
                TransactionEngine::open_with_fs(Arc::new(fs.clone()), config)
                    .expect("Failed to open in-memory engine")
            }
            TestBackend::Directory(dir) => {
                TransactionEngine::open_with_config(&dir.path().join("db"), config)
                    .expect("Failed to open directory engine")
            }
        }
    }
}

/// A test engine with automatic cleanup.
#[derive(Debug)]
pub struct TestEngine {
    /// The engine instance.
    pub engine: TransactionEngine,
    backend: TestBackend,
    config: Config,
}

impl TestEngine {
    /// Creates an engine on a fresh in-memory file system.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates an in-memory engine with the given configuration.
    pub fn memory_with(config: Config) -> Self {
        let backend = TestBackend::Memory(MemoryFs::new());
        Self {
            engine: backend.open(config.clone()),
            backend,
            config,
        }
    }

    /// Creates an engine in a temporary directory.
    pub fn file() -> Self {
        Self::file_with(test_config())
    }

    /// Creates a directory engine with the given configuration.
    pub fn file_with(config: Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let backend = TestBackend::Directory(dir);
        Self {
            engine: backend.open(config.clone()),
            backend,
            config,
        }
    }

    /// The database directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<std::path::PathBuf> {
        match &self.backend {
            TestBackend::Directory(dir) => Some(dir.path().join("db")),
            TestBackend::Memory(_) => None,
        }
    }

    /// The in-memory file system, if any.
    pub fn fs(&self) -> Option<&MemoryFs> {
        match &self.backend {
            TestBackend::Memory(fs) => Some(fs),
            TestBackend::Directory(_) => None,
        }
    }

    /// The configuration used for every (re)open.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drops the engine without closing it, loses every unsynced byte and
    /// opens it again.
    ///
    /// Directory engines cannot lose page cache contents, so for them this
    /// is an unclean restart.
    pub fn crash(self) -> Self {
        let Self {
            engine,
            backend,
            config,
        } = self;
        drop(engine);
        if let TestBackend::Memory(fs) = &backend {
            fs.simulate_crash();
        }
        Self {
            engine: backend.open(config.clone()),
            backend,
            config,
        }
    }

    /// Closes the engine cleanly and opens it again.
    pub fn reopen(self) -> Self {
        let Self {
            engine,
            backend,
            config,
        } = self;
        engine.close().expect("Failed to close engine");
        drop(engine);
        Self {
            engine: backend.open(config.clone()),
            backend,
            config,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = TransactionEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Configuration with small pages so a few hundred rows already split.
pub fn test_config() -> Config {
    Config::default().page_size(512)
}

/// Runs a test with a temporary in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use mvdb_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine| {
///         let txn = engine.begin(Default::default()).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionEngine) -> R,
{
    let test = TestEngine::memory();
    f(&test.engine)
}

/// Runs a test with a temporary directory engine.
pub fn with_file_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TransactionEngine, &Path) -> R,
{
    let test = TestEngine::file();
    let path = test.path().expect("File engine should have a path");
    f(&test.engine, &path)
}

/// Writes `key -> key * 10` for every key of `keys` in one transaction.
pub fn put_rows(engine: &TransactionEngine, map: &str, keys: Range<i64>) {
    engine
        .run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>(map)?;
            for k in keys.clone() {
                map.put(k, Value::Int(k * 10))?;
            }
            Ok(())
        })
        .expect("Failed to put rows");
}

/// Every visible entry of `map`, in key order.
pub fn read_all(engine: &TransactionEngine, map: &str) -> Vec<(Value, Value)> {
    let txn = engine
        .begin(TransactionOptions::default())
        .expect("Failed to begin transaction");
    let rows = txn
        .open_map::<Value>(map)
        .expect("Failed to open map")
        .cursor(None, None)
        .expect("Failed to open cursor")
        .collect::<Result<Vec<_>, _>>()
        .expect("Failed to read map");
    txn.rollback().expect("Failed to roll back");
    rows
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// An engine whose map `t` holds `rows` rows.
    pub fn populated_engine(rows: i64) -> TestEngine {
        let test = TestEngine::memory();
        put_rows(&test, "t", 0..rows);
        test
    }

    /// An engine with `count` maps of one row each, checkpointed once per
    /// map so each map lives in its own chunk.
    pub fn multi_map_engine(count: usize) -> (TestEngine, Vec<String>) {
        let test = TestEngine::memory();
        let mut names = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("map_{i}");
            put_rows(&test, &name, 0..1);
            test.checkpoint().expect("Failed to checkpoint");
            names.push(name);
        }
        (test, names)
    }
}
