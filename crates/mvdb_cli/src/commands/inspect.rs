//! Inspect command implementation.

use super::{open_existing, print_json, CliError, CliResult, OutputFormat};
use mvdb_core::manifest::{Manifest, MANIFEST_FILE};
use mvdb_core::redo::log_file_id;
use mvdb_storage::FileSystem;
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Whether a checkpoint ever wrote a manifest.
    pub has_manifest: bool,
    /// Highest transaction id covered by the last checkpoint.
    pub last_transaction_id: u64,
    /// Redo log position covered by pages.
    pub checkpoint_mark: String,
    /// Completed chunk-GC passes.
    pub gc_passes: u64,
    /// Maps known to page storage.
    pub maps: Vec<MapStats>,
    /// Number of chunk files.
    pub chunk_count: usize,
    /// Total chunk bytes.
    pub chunk_bytes: u64,
    /// Live chunk bytes.
    pub live_bytes: u64,
    /// Redo log files and their sizes.
    pub log_files: Vec<LogFileStats>,
    /// Chunk details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkStats>>,
}

/// One map in the manifest.
#[derive(Debug, Serialize)]
pub struct MapStats {
    /// Map id.
    pub id: u32,
    /// Map name.
    pub name: String,
    /// Leaf layout.
    pub mode: String,
    /// Root page, if the map was ever saved non-empty.
    pub root: Option<String>,
}

/// One chunk file.
#[derive(Debug, Serialize)]
pub struct ChunkStats {
    /// Chunk id.
    pub id: u32,
    /// File length.
    pub len: u64,
    /// Pages written.
    pub pages: u64,
    /// Pages still referenced.
    pub live_pages: u64,
    /// Live bytes in percent.
    pub fill_rate: u64,
    /// Transaction counter when the chunk became unused.
    pub unused_since: Option<u64>,
}

/// One redo log file.
#[derive(Debug, Serialize)]
pub struct LogFileStats {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_chunks: bool, format: OutputFormat) -> CliResult<()> {
    let fs = open_existing(path)?;
    let result = inspect(&fs, path)?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => print_text_output(&result, show_chunks),
    }
    Ok(())
}

fn inspect(fs: &dyn FileSystem, path: &Path) -> CliResult<InspectResult> {
    let manifest_bytes = fs.read_file(MANIFEST_FILE)?;
    let mut log_files = Vec::new();
    for name in fs.list()? {
        if log_file_id(&name).is_some() {
            let size = fs.open(&name)?.size()?;
            log_files.push(LogFileStats { name, size });
        }
    }
    log_files.sort_by(|a, b| a.name.cmp(&b.name));

    if manifest_bytes.is_none() && log_files.is_empty() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let manifest = match &manifest_bytes {
        Some(bytes) => Manifest::decode(bytes)?,
        None => Manifest::default(),
    };

    let maps = manifest
        .maps
        .iter()
        .map(|m| MapStats {
            id: m.id,
            name: m.name.clone(),
            mode: format!("{:?}", m.mode),
            root: m.root.map(|r| r.to_string()),
        })
        .collect();
    let chunks: Vec<ChunkStats> = manifest
        .chunks
        .iter()
        .map(|c| ChunkStats {
            id: c.id.0,
            len: c.len,
            pages: c.page_count,
            live_pages: c.live_pages,
            fill_rate: c.fill_rate(),
            unused_since: c.unused_since,
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        has_manifest: manifest_bytes.is_some(),
        last_transaction_id: manifest.last_transaction_id.0,
        checkpoint_mark: manifest.mark.log_position.to_string(),
        gc_passes: manifest.mark.last_gc_meta_id,
        maps,
        chunk_count: chunks.len(),
        chunk_bytes: manifest.chunks.iter().map(|c| c.len).sum(),
        live_bytes: manifest.chunks.iter().map(|c| c.live_len).sum(),
        log_files,
        chunks: Some(chunks),
    })
}

fn print_text_output(result: &InspectResult, show_chunks: bool) {
    println!("Database: {}", result.path);
    if !result.has_manifest {
        println!("  (no checkpoint yet; all data is in the redo log)");
    }
    println!("  Last transaction id: {}", result.last_transaction_id);
    println!("  Checkpoint mark:     {}", result.checkpoint_mark);
    println!("  GC passes:           {}", result.gc_passes);
    println!();

    println!("Maps ({}):", result.maps.len());
    for map in &result.maps {
        println!(
            "  #{:<4} {:<24} {:<7} root={}",
            map.id,
            map.name,
            map.mode,
            map.root.as_deref().unwrap_or("-")
        );
    }
    println!();

    println!(
        "Chunks: {} ({} bytes, {} live)",
        result.chunk_count, result.chunk_bytes, result.live_bytes
    );
    if show_chunks {
        if let Some(chunks) = &result.chunks {
            for c in chunks {
                println!(
                    "  chunk {:<6} {:>10} bytes  pages {:>6}/{:<6} fill {:>3}%{}",
                    c.id,
                    c.len,
                    c.live_pages,
                    c.pages,
                    c.fill_rate,
                    c.unused_since
                        .map(|s| format!("  unused since {s}"))
                        .unwrap_or_default()
                );
            }
        }
    }
    println!();

    println!("Redo log files ({}):", result.log_files.len());
    for f in &result.log_files {
        println!("  {:<24} {:>10} bytes", f.name, f.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvdb_codec::Value;
    use mvdb_core::{Config, TransactionEngine, TransactionOptions};
    use tempfile::TempDir;

    #[test]
    fn inspect_reports_maps_and_chunks() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        {
            let engine = TransactionEngine::open_with_config(&db, Config::default()).unwrap();
            let txn = engine.begin(TransactionOptions::default()).unwrap();
            txn.open_map::<Value>("users").unwrap().put(1, Value::from("a")).unwrap();
            txn.commit().unwrap();
            engine.close().unwrap();
        }

        let fs = open_existing(&db).unwrap();
        let result = inspect(&fs, &db).unwrap();
        assert!(result.has_manifest);
        assert_eq!(result.maps.len(), 1);
        assert_eq!(result.maps[0].name, "users");
        assert!(result.chunk_count >= 1);
        assert!(result.last_transaction_id > 0);
    }

    #[test]
    fn inspect_of_empty_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = open_existing(dir.path()).unwrap();
        assert!(matches!(
            inspect(&fs, dir.path()),
            Err(CliError::NotFound(_))
        ));
    }
}
