//! CLI command implementations.

pub mod checkpoint;
pub mod dump_log;
pub mod inspect;
pub mod verify;

use clap::ValueEnum;
use mvdb_core::CoreError;
use mvdb_storage::{DirectoryFs, StorageError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No `--path` given for a command that needs one.
    #[error("database path required for {0}")]
    MissingPath(&'static str),

    /// The directory holds no database.
    #[error("no database found at {}", .0.display())]
    NotFound(PathBuf),

    /// Verification found problems.
    #[error("verification failed with {0} issue(s)")]
    VerifyFailed(usize),

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// File system error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Unwraps the global `--path` argument.
pub fn require_path(path: Option<PathBuf>, command: &'static str) -> CliResult<PathBuf> {
    path.ok_or(CliError::MissingPath(command))
}

/// Opens an existing database directory without creating anything.
pub fn open_existing(path: &Path) -> CliResult<DirectoryFs> {
    if !path.is_dir() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    match DirectoryFs::open(path, false) {
        Ok(fs) => Ok(fs),
        Err(StorageError::Locked(_)) => Err(CoreError::DatabaseLocked.into()),
        Err(e) => Err(e.into()),
    }
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
