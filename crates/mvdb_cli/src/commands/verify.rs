//! Verify command implementation.

use super::{open_existing, CliError, CliResult};
use mvdb_core::redo::{RedoLog, RedoRecord};
use mvdb_core::{Storage, StorageConfig};
use mvdb_storage::FileSystem;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of items checked (records or pages).
    pub checked: u64,
    /// Transactions with a commit marker, for the log check.
    pub committed: usize,
    /// Transactions without one.
    pub incomplete: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, check_log: bool, check_pages: bool) -> CliResult<()> {
    println!("Verifying database at {}", path.display());
    println!();

    let fs = Arc::new(open_existing(path)?);
    let mut issues = 0;

    if check_log {
        println!("Checking redo log...");
        let result = verify_log(&*fs);
        print_result("Redo log", &result);
        issues += result.errors.len();
    }

    if check_pages {
        println!("Checking pages...");
        let result = verify_pages(Arc::clone(&fs) as Arc<dyn FileSystem>)?;
        print_result("Pages", &result);
        issues += result.errors.len();
    }

    println!();
    if issues == 0 {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err(CliError::VerifyFailed(issues))
    }
}

fn verify_log(fs: &dyn FileSystem) -> VerifyResult {
    let mut result = VerifyResult::default();
    let records = match RedoLog::scan(fs) {
        Ok(records) => records,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };

    let mut writers = HashSet::new();
    let mut committed = HashSet::new();
    for (_, record) in &records {
        result.checked += 1;
        match record {
            RedoRecord::Commit { txid, .. } => {
                committed.insert(*txid);
            }
            other => {
                writers.insert(other.txid());
            }
        }
    }
    result.committed = committed.len();
    result.incomplete = writers.difference(&committed).count();
    result
}

fn verify_pages(fs: Arc<dyn FileSystem>) -> CliResult<VerifyResult> {
    let storage = Storage::open(fs, StorageConfig::default())?;
    let report = storage.verify();
    Ok(VerifyResult {
        checked: report.pages,
        errors: report.issues,
        ..VerifyResult::default()
    })
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {} checked: {} item(s)", name, result.checked);
    if result.committed > 0 || result.incomplete > 0 {
        println!(
            "  Transactions: {} committed, {} without commit marker",
            result.committed, result.incomplete
        );
    }

    if result.is_ok() {
        println!("  ✓ {} OK", name);
    } else {
        println!("  ✗ {} has {} error(s):", name, result.errors.len());
        for error in result.errors.iter().take(10) {
            println!("    - {}", error);
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }
}
