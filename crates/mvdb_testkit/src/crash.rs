//! Crash recovery testing for mvdb.
//!
//! This module simulates crashes at various points and verifies that the
//! engine recovers exactly the committed state.
//!
//! ## Test Strategy
//!
//! 1. **Crash before commit** - uncommitted rows must vanish
//! 2. **Crash after commit** - committed rows must survive
//! 3. **Crash after checkpoint** - chunk state plus log tail must combine
//! 4. **Torn log tail** - a half-written last record drops only its transaction
//! 5. **Corrupt log** - a damaged record must be reported, not skipped
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mvdb_testkit::crash::{CrashPoint, CrashRecoveryHarness};
//!
//! let harness = CrashRecoveryHarness::new();
//! assert!(harness.run(CrashPoint::AfterCommit).passed);
//! ```

use crate::fixtures::{put_rows, read_all, test_config};
use mvdb_codec::Value;
use mvdb_core::redo::log_file_id;
use mvdb_core::{Config, CoreResult, TransactionEngine, TransactionOptions};
use mvdb_storage::{FileSystem, MemoryFs};
use std::sync::Arc;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash while a transaction has written but not committed.
    BeforeCommit,
    /// Crash right after commits returned.
    AfterCommit,
    /// Crash after a checkpoint followed by more commits.
    AfterCheckpoint,
    /// Crash in the middle of writing the last commit record.
    TornLogTail,
    /// A byte of an older log record is damaged.
    CorruptLog,
}

impl CrashPoint {
    /// All crash points.
    pub const ALL: [CrashPoint; 5] = [
        CrashPoint::BeforeCommit,
        CrashPoint::AfterCommit,
        CrashPoint::AfterCheckpoint,
        CrashPoint::TornLogTail,
        CrashPoint::CorruptLog,
    ];
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected rows after recovery.
    pub expected_rows: usize,
    /// Actual rows after recovery.
    pub actual_rows: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, rows: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_rows: rows,
            actual_rows: rows,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_rows: expected,
            actual_rows: actual,
            error: Some(error.to_string()),
        }
    }
}

/// Runs crash scenarios against engines on a [`MemoryFs`].
#[derive(Debug, Clone)]
pub struct CrashRecoveryHarness {
    config: Config,
    rows_per_commit: i64,
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashRecoveryHarness {
    /// A harness with small pages and synchronous log writes.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// A harness using `config` for every engine it opens.
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            rows_per_commit: 25,
        }
    }

    /// Runs every crash point.
    pub fn run_all(&self) -> Vec<CrashRecoveryResult> {
        CrashPoint::ALL.iter().map(|&point| self.run(point)).collect()
    }

    /// Runs one crash scenario.
    pub fn run(&self, point: CrashPoint) -> CrashRecoveryResult {
        let description = format!("{point:?}");
        let fs = MemoryFs::new();
        let expected = match self.prepare(&fs, point) {
            Ok(expected) => expected,
            Err(e) => return CrashRecoveryResult::fail(&description, 0, 0, &format!("setup failed: {e}")),
        };
        fs.simulate_crash();

        let reopened = TransactionEngine::open_with_fs(Arc::new(fs.clone()), self.config.clone());
        match (point, reopened) {
            (CrashPoint::CorruptLog, Err(e)) if e.is_corruption() => {
                CrashRecoveryResult::pass(&description, 0)
            }
            (CrashPoint::CorruptLog, Err(e)) => {
                CrashRecoveryResult::fail(&description, 0, 0, &format!("wrong error: {e}"))
            }
            (CrashPoint::CorruptLog, Ok(engine)) => {
                let actual = read_all(&engine, "t").len();
                CrashRecoveryResult::fail(&description, 0, actual, "corruption went unnoticed")
            }
            (_, Err(e)) => CrashRecoveryResult::fail(&description, expected.len(), 0, &e.to_string()),
            (_, Ok(engine)) => {
                let actual = read_all(&engine, "t");
                if actual == expected {
                    CrashRecoveryResult::pass(&description, expected.len())
                } else {
                    CrashRecoveryResult::fail(
                        &description,
                        expected.len(),
                        actual.len(),
                        "recovered rows differ from committed rows",
                    )
                }
            }
        }
    }

    /// Runs the workload for `point` and returns the rows that must
    /// survive. The engine is gone when this returns.
    fn prepare(&self, fs: &MemoryFs, point: CrashPoint) -> CoreResult<Vec<(Value, Value)>> {
        let engine = TransactionEngine::open_with_fs(Arc::new(fs.clone()), self.config.clone())?;
        let n = self.rows_per_commit;
        put_rows(&engine, "t", 0..n);

        match point {
            CrashPoint::BeforeCommit => {
                let expected = read_all(&engine, "t");
                let txn = engine.begin(TransactionOptions::default())?;
                let map = txn.open_map::<Value>("t")?;
                for k in 0..2 * n {
                    map.put(k, Value::from("uncommitted"))?;
                }
                drop(map);
                // Never committed and never rolled back.
                std::mem::forget(txn);
                Ok(expected)
            }
            CrashPoint::AfterCommit => {
                put_rows(&engine, "t", n..2 * n);
                Ok(read_all(&engine, "t"))
            }
            CrashPoint::AfterCheckpoint => {
                engine.checkpoint()?;
                put_rows(&engine, "t", n..2 * n);
                engine.run_transaction(TransactionOptions::default(), |txn| {
                    txn.open_map::<Value>("t")?.remove(&Value::Int(0))?;
                    Ok(())
                })?;
                Ok(read_all(&engine, "t"))
            }
            CrashPoint::TornLogTail => {
                let expected = read_all(&engine, "t");
                put_rows(&engine, "t", n..2 * n);
                drop(engine);
                tear_last_log_record(fs)?;
                Ok(expected)
            }
            CrashPoint::CorruptLog => {
                drop(engine);
                let name = newest_log_file(fs)?;
                fs.corrupt_byte(&name, 20);
                Ok(Vec::new())
            }
        }
    }
}

fn newest_log_file(fs: &MemoryFs) -> CoreResult<String> {
    fs.list()?
        .into_iter()
        .filter(|name| log_file_id(name).is_some())
        .max_by_key(|name| log_file_id(name))
        .ok_or_else(|| mvdb_core::CoreError::internal("no redo log file"))
}

/// Cuts the last bytes off the newest log file, as a crash in the middle
/// of an append would.
fn tear_last_log_record(fs: &MemoryFs) -> CoreResult<()> {
    let name = newest_log_file(fs)?;
    let mut file = fs.open(&name)?;
    let size = file.size()?;
    file.truncate(size.saturating_sub(3))?;
    file.sync()?;
    Ok(())
}
