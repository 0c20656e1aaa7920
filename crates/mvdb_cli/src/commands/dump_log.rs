//! Dump-log command implementation.

use super::{open_existing, print_json, CliResult, OutputFormat};
use mvdb_core::redo::{RedoLog, RedoRecord};
use mvdb_core::LogPosition;
use serde::Serialize;
use std::path::Path;

/// A redo record for display.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Position of the record.
    pub position: String,
    /// Record type.
    pub record_type: String,
    /// Writing transaction.
    pub txid: u64,
    /// Map touched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
    /// Row key, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Encoded value size for puts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_len: Option<usize>,
    /// Commit id for commit markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<u64>,
}

impl RecordInfo {
    fn new(position: LogPosition, record: &RedoRecord) -> Self {
        let mut info = Self {
            position: position.to_string(),
            record_type: format!("{:?}", record.record_type()),
            txid: record.txid().0,
            map: None,
            key: None,
            value_len: None,
            commit_id: None,
        };
        match record {
            RedoRecord::Put { map, key, value, .. } => {
                info.map = Some(map.clone());
                info.key = Some(key.to_string());
                info.value_len = Some(value.len());
            }
            RedoRecord::Remove { map, key, .. } => {
                info.map = Some(map.clone());
                info.key = Some(key.to_string());
            }
            RedoRecord::DropMap { map, .. } => info.map = Some(map.clone()),
            RedoRecord::Commit { commit_id, .. } => info.commit_id = Some(commit_id.0),
        }
        info
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    map: Option<&str>,
    format: OutputFormat,
) -> CliResult<()> {
    let fs = open_existing(path)?;
    let records = RedoLog::scan(&fs)?;
    let total = records.len();
    let selected = select(&records, limit, map);

    match format {
        OutputFormat::Json => print_json(&selected)?,
        OutputFormat::Text => {
            println!("Redo log at {} ({} records)", path.display(), total);
            println!();
            for info in &selected {
                print!("{:<16} {:<8} tx={:<6}", info.position, info.record_type, info.txid);
                if let Some(map) = &info.map {
                    print!(" map={map}");
                }
                if let Some(key) = &info.key {
                    print!(" key={key}");
                }
                if let Some(len) = info.value_len {
                    print!(" value={len}B");
                }
                if let Some(commit_id) = info.commit_id {
                    print!(" commit={commit_id}");
                }
                println!();
            }
            if selected.len() < total && map.is_none() {
                println!("... {} more", total - selected.len());
            }
        }
    }
    Ok(())
}

/// Keeps records touching `map` (commit markers of their transactions
/// included) up to `limit`.
fn select(
    records: &[(LogPosition, RedoRecord)],
    limit: Option<usize>,
    map: Option<&str>,
) -> Vec<RecordInfo> {
    let wanted: Option<std::collections::HashSet<_>> = map.map(|name| {
        records
            .iter()
            .filter(|(_, r)| record_map(r) == Some(name))
            .map(|(_, r)| r.txid())
            .collect()
    });
    records
        .iter()
        .filter(|(_, record)| match (&wanted, map) {
            (Some(txids), Some(name)) => match record {
                RedoRecord::Commit { txid, .. } => txids.contains(txid),
                other => record_map(other) == Some(name),
            },
            _ => true,
        })
        .take(limit.unwrap_or(usize::MAX))
        .map(|(pos, record)| RecordInfo::new(*pos, record))
        .collect()
}

fn record_map(record: &RedoRecord) -> Option<&str> {
    match record {
        RedoRecord::Put { map, .. }
        | RedoRecord::Remove { map, .. }
        | RedoRecord::DropMap { map, .. } => Some(map),
        RedoRecord::Commit { .. } => None,
    }
}
