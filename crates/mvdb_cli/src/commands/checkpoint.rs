//! Checkpoint command implementation.
//!
//! Opens the engine, which replays the redo log, and runs one checkpoint
//! followed by the closing checkpoint. Changes to maps whose value type
//! the tool cannot know stay held and are carried into the new log file.

use super::{print_json, CliError, CliResult, OutputFormat};
use mvdb_core::{CheckpointReport, Config, TransactionEngine};
use serde::Serialize;
use std::path::Path;

/// Checkpoint command output.
#[derive(Debug, Serialize)]
pub struct CheckpointOutput {
    /// Chunk written, if any page was dirty.
    pub chunk: Option<u32>,
    /// Pages written.
    pub pages: u64,
    /// Pages rewritten out of sparse chunks.
    pub compacted_pages: usize,
    /// Pages whose space was released.
    pub released_pages: usize,
    /// Redo log files deleted.
    pub log_files_removed: usize,
    /// Chunk files deleted.
    pub chunks_deleted: usize,
    /// New checkpoint mark.
    pub mark: String,
    /// Redo log bytes left after closing.
    pub redo_log_size: u64,
}

impl CheckpointOutput {
    fn new(report: &CheckpointReport, redo_log_size: u64) -> Self {
        Self {
            chunk: report.chunk.map(|c| c.0),
            pages: report.pages,
            compacted_pages: report.compacted_pages,
            released_pages: report.released_pages,
            log_files_removed: report.log_files_removed,
            chunks_deleted: report.chunks_deleted,
            mark: report.mark.to_string(),
            redo_log_size,
        }
    }
}

/// Runs the checkpoint command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let output = checkpoint(path)?;
    match format {
        OutputFormat::Json => print_json(&output)?,
        OutputFormat::Text => {
            println!("Checkpoint of {}", path.display());
            match output.chunk {
                Some(chunk) => println!("  Chunk written:     {chunk} ({} pages)", output.pages),
                None => println!("  Chunk written:     none (nothing dirty)"),
            }
            println!("  Compacted pages:   {}", output.compacted_pages);
            println!("  Released pages:    {}", output.released_pages);
            println!("  Log files removed: {}", output.log_files_removed);
            println!("  Chunks deleted:    {}", output.chunks_deleted);
            println!("  Mark:              {}", output.mark);
            println!("  Redo log left:     {} bytes", output.redo_log_size);
        }
    }
    Ok(())
}

fn checkpoint(path: &Path) -> CliResult<CheckpointOutput> {
    if !path.is_dir() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let engine =
        TransactionEngine::open_with_config(path, Config::default().create_if_missing(false))?;
    let report = engine.checkpoint()?;
    engine.close()?;
    Ok(CheckpointOutput::new(&report, engine.redo_log_size()))
}
