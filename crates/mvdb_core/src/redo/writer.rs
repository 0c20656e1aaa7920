//! Redo log files: appends, rotation, truncation and replay.

use crate::config::LogSyncPolicy;
use crate::error::{CoreError, CoreResult};
use crate::redo::iterator::RedoRecordIterator;
use crate::redo::record::RedoRecord;
use crate::types::{LogPosition, TransactionId};
use mvdb_codec::Value;
use mvdb_storage::{FileSystem, StorageBackend, StorageResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// File name of redo log `id`.
pub fn log_file_name(id: u64) -> String {
    format!("redo_{id:08}.log")
}

/// Parses a redo log file name back into its id.
pub fn log_file_id(name: &str) -> Option<u64> {
    name.strip_prefix("redo_")?.strip_suffix(".log")?.parse().ok()
}

/// A committed row change waiting for its map to be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    /// Row written; the value is still encoded.
    Put {
        /// Row key.
        key: Value,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Row removed.
    Remove {
        /// Row key.
        key: Value,
    },
}

/// A [`PendingOp`] with the commit that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// Commit id of the producing transaction.
    pub commit_id: TransactionId,
    /// The change.
    pub op: PendingOp,
}

/// Summary of replaying the log on open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    /// Highest transaction or commit id found in the log.
    pub last_transaction_id: TransactionId,
    /// Committed transactions replayed.
    pub transactions: usize,
    /// Row changes held for their maps.
    pub records: usize,
    /// Transactions without a commit marker, ignored.
    pub discarded: usize,
    /// Maps dropped by replayed transactions, in drop order.
    pub dropped_maps: Vec<String>,
}

struct LogState {
    file: u64,
    backend: Box<dyn StorageBackend>,
    /// Size of every live log file, the current one included.
    sizes: BTreeMap<u64, u64>,
    last_sync: Instant,
    unsynced: bool,
    /// Set when a failed append could not be cut back off the file.
    poisoned: bool,
}

impl LogState {
    fn size(&self) -> u64 {
        self.sizes.get(&self.file).copied().unwrap_or(0)
    }
}

/// The redo log.
///
/// Commits append their records plus a commit marker as one write. The
/// log rotates to a new file at every checkpoint; files entirely below the
/// checkpoint mark are deleted once the checkpoint's manifest is durable.
pub struct RedoLog {
    fs: Arc<dyn FileSystem>,
    policy: LogSyncPolicy,
    state: Mutex<LogState>,
    pending: Mutex<HashMap<String, Vec<PendingRecord>>>,
}

impl RedoLog {
    /// Opens the log, replaying every committed transaction at or after
    /// `mark`. Replayed row changes are held per map until taken with
    /// [`RedoLog::take_pending`].
    ///
    /// Appends always go to a fresh file, so a torn tail left by a crash
    /// never has valid records written after it.
    ///
    /// # Errors
    ///
    /// `LogCorruption` or `ChecksumMismatch` if a record is damaged.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        policy: LogSyncPolicy,
        mark: LogPosition,
    ) -> CoreResult<(Self, Replay)> {
        let mut ids: Vec<u64> = fs.list()?.iter().filter_map(|n| log_file_id(n)).collect();
        ids.sort_unstable();

        let mut replay = Replay::default();
        let mut in_flight: HashMap<TransactionId, Vec<RedoRecord>> = HashMap::new();
        let mut pending: HashMap<String, Vec<PendingRecord>> = HashMap::new();
        let mut sizes = BTreeMap::new();

        for &id in &ids {
            let name = log_file_name(id);
            if id < mark.file {
                fs.remove(&name)?;
                continue;
            }
            let backend = fs.open(&name)?;
            sizes.insert(id, backend.size()?);
            let start = if id == mark.file { mark.offset } else { 0 };
            for item in RedoRecordIterator::new(backend.as_ref(), start)? {
                let (_, record) = item?;
                replay.last_transaction_id = replay.last_transaction_id.max(record.txid());
                match record {
                    RedoRecord::Commit { txid, commit_id } => {
                        replay.last_transaction_id = replay.last_transaction_id.max(commit_id);
                        let records = in_flight.remove(&txid).unwrap_or_default();
                        replay.transactions += 1;
                        hold_committed(&mut pending, &mut replay, commit_id, records);
                    }
                    other => in_flight.entry(other.txid()).or_default().push(other),
                }
            }
        }
        replay.discarded = in_flight.len();

        let file = ids.last().map_or(mark.file.max(1), |last| last + 1);
        let mut backend = fs.open(&log_file_name(file))?;
        if backend.size()? > 0 {
            backend.truncate(0)?;
        }
        sizes.insert(file, 0);

        if replay.transactions > 0 || replay.discarded > 0 {
            tracing::info!(
                transactions = replay.transactions,
                records = replay.records,
                discarded = replay.discarded,
                dropped_maps = replay.dropped_maps.len(),
                "redo log replayed"
            );
        }

        Ok((
            Self {
                fs,
                policy,
                state: Mutex::new(LogState {
                    file,
                    backend,
                    sizes,
                    last_sync: Instant::now(),
                    unsynced: false,
                    poisoned: false,
                }),
                pending: Mutex::new(pending),
            },
            replay,
        ))
    }

    /// The sync policy.
    pub fn policy(&self) -> LogSyncPolicy {
        self.policy
    }

    /// Appends a transaction's records and its commit marker.
    ///
    /// Under [`LogSyncPolicy::Sync`] the write is synced before this
    /// returns. On failure the partial write is cut off again; if that
    /// fails too the log refuses further appends.
    ///
    /// Returns the log position just past the commit marker.
    pub fn append_commit(
        &self,
        txid: TransactionId,
        commit_id: TransactionId,
        records: &[RedoRecord],
    ) -> CoreResult<LogPosition> {
        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf)?;
        }
        RedoRecord::Commit { txid, commit_id }.encode_into(&mut buf)?;
        self.append(&buf)
    }

    /// Appends a single record on its own, committed as `commit_id`.
    pub fn append_record(&self, record: RedoRecord, commit_id: TransactionId) -> CoreResult<LogPosition> {
        let txid = record.txid();
        self.append_commit(txid, commit_id, std::slice::from_ref(&record))
    }

    fn append(&self, buf: &[u8]) -> CoreResult<LogPosition> {
        let mut state = self.state.lock();
        let sync = match self.policy {
            LogSyncPolicy::Sync => true,
            LogSyncPolicy::Periodic { interval } => state.last_sync.elapsed() >= interval,
        };
        if state.poisoned {
            return Err(CoreError::invalid_operation(
                "redo log failed earlier and accepts no more writes",
            ));
        }
        let before = state.size();
        if let Err(e) = write_all(state.backend.as_mut(), buf, sync) {
            let cut = state
                .backend
                .truncate(before)
                .and_then(|()| state.backend.sync());
            if cut.is_err() {
                state.poisoned = true;
            }
            tracing::warn!(error = %e, "redo log append failed");
            return Err(e.into());
        }

        let file = state.file;
        let end = before + buf.len() as u64;
        state.sizes.insert(file, end);
        if sync {
            state.last_sync = Instant::now();
            state.unsynced = false;
        } else {
            state.unsynced = true;
        }
        Ok(LogPosition::new(file, end))
    }

    /// Syncs the current file if the periodic interval has elapsed.
    /// Returns whether a sync happened.
    pub fn sync_if_due(&self) -> CoreResult<bool> {
        let LogSyncPolicy::Periodic { interval } = self.policy else {
            return Ok(false);
        };
        let mut state = self.state.lock();
        if !state.unsynced || state.last_sync.elapsed() < interval {
            return Ok(false);
        }
        state.backend.sync()?;
        state.unsynced = false;
        state.last_sync = Instant::now();
        Ok(true)
    }

    /// Syncs the current file.
    pub fn sync(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.backend.sync()?;
        state.unsynced = false;
        state.last_sync = Instant::now();
        Ok(())
    }

    /// Position of the next append.
    pub fn position(&self) -> LogPosition {
        let state = self.state.lock();
        LogPosition::new(state.file, state.size())
    }

    /// Total bytes in live log files.
    pub fn size(&self) -> u64 {
        self.state.lock().sizes.values().sum()
    }

    /// Number of live log files.
    pub fn file_count(&self) -> usize {
        self.state.lock().sizes.len()
    }

    /// Starts a new log file and returns its start position.
    ///
    /// Row changes still held for unopened maps are rewritten at the start
    /// of the new file, so they survive the removal of older files.
    pub fn rotate(&self) -> CoreResult<LogPosition> {
        let mut state = self.state.lock();
        state.backend.sync()?;

        let next = state.file + 1;
        let mut backend = self.fs.open(&log_file_name(next))?;
        if backend.size()? > 0 {
            backend.truncate(0)?;
        }
        let carried = self.encode_pending()?;
        write_all(backend.as_mut(), &carried, true)?;

        state.file = next;
        state.backend = backend;
        state.sizes.insert(next, carried.len() as u64);
        state.unsynced = false;
        state.last_sync = Instant::now();
        tracing::debug!(file = next, carried = carried.len(), "redo log rotated");
        Ok(LogPosition::new(next, 0))
    }

    fn encode_pending(&self) -> CoreResult<Vec<u8>> {
        let pending = self.pending.lock();
        let mut ops: Vec<(&str, &PendingRecord)> = pending
            .iter()
            .flat_map(|(map, records)| records.iter().map(move |r| (map.as_str(), r)))
            .collect();
        ops.sort_by_key(|(_, r)| r.commit_id);

        let mut buf = Vec::new();
        for group in ops.chunk_by(|a, b| a.1.commit_id == b.1.commit_id) {
            let commit_id = group[0].1.commit_id;
            for (map, record) in group {
                let record = match &record.op {
                    PendingOp::Put { key, value } => RedoRecord::Put {
                        txid: commit_id,
                        map: (*map).to_string(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                    PendingOp::Remove { key } => RedoRecord::Remove {
                        txid: commit_id,
                        map: (*map).to_string(),
                        key: key.clone(),
                    },
                };
                record.encode_into(&mut buf)?;
            }
            RedoRecord::Commit {
                txid: commit_id,
                commit_id,
            }
            .encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Deletes log files that end before `position`.
    pub fn remove_before(&self, position: LogPosition) -> CoreResult<usize> {
        let mut state = self.state.lock();
        let current = state.file;
        let victims: Vec<u64> = state
            .sizes
            .keys()
            .copied()
            .filter(|&id| id < position.file && id != current)
            .collect();
        for id in &victims {
            self.fs.remove(&log_file_name(*id))?;
            state.sizes.remove(id);
        }
        if !victims.is_empty() {
            tracing::debug!(files = victims.len(), "redo log files removed");
        }
        Ok(victims.len())
    }

    /// Takes the held row changes of `map`, in commit order.
    pub fn take_pending(&self, map: &str) -> Vec<PendingRecord> {
        self.pending.lock().remove(map).unwrap_or_default()
    }

    /// Puts back changes taken by [`RedoLog::take_pending`] that could not
    /// be applied.
    pub fn restore_pending(&self, map: &str, mut records: Vec<PendingRecord>) {
        let mut pending = self.pending.lock();
        let slot = pending.entry(map.to_string()).or_default();
        records.append(slot);
        *slot = records;
    }

    /// Forgets held changes of a dropped map.
    pub fn discard_pending(&self, map: &str) {
        self.pending.lock().remove(map);
    }

    /// Names of maps with held changes, sorted.
    pub fn pending_maps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Reads every record of every log file, for inspection tools.
    pub fn scan(fs: &dyn FileSystem) -> CoreResult<Vec<(LogPosition, RedoRecord)>> {
        let mut ids: Vec<u64> = fs.list()?.iter().filter_map(|n| log_file_id(n)).collect();
        ids.sort_unstable();
        let mut out = Vec::new();
        for id in ids {
            let backend = fs.open(&log_file_name(id))?;
            for item in RedoRecordIterator::new(backend.as_ref(), 0)? {
                let (offset, record) = item?;
                out.push((LogPosition::new(id, offset), record));
            }
        }
        Ok(out)
    }
}

fn hold_committed(
    pending: &mut HashMap<String, Vec<PendingRecord>>,
    replay: &mut Replay,
    commit_id: TransactionId,
    records: Vec<RedoRecord>,
) {
    for record in records {
        match record {
            RedoRecord::Put { map, key, value, .. } => {
                replay.records += 1;
                pending.entry(map).or_default().push(PendingRecord {
                    commit_id,
                    op: PendingOp::Put { key, value },
                });
            }
            RedoRecord::Remove { map, key, .. } => {
                replay.records += 1;
                pending.entry(map).or_default().push(PendingRecord {
                    commit_id,
                    op: PendingOp::Remove { key },
                });
            }
            RedoRecord::DropMap { map, .. } => {
                pending.remove(&map);
                if !replay.dropped_maps.contains(&map) {
                    replay.dropped_maps.push(map);
                }
            }
            RedoRecord::Commit { .. } => {}
        }
    }
}

fn write_all(backend: &mut dyn StorageBackend, buf: &[u8], sync: bool) -> StorageResult<()> {
    if !buf.is_empty() {
        backend.append(buf)?;
    }
    if sync {
        backend.sync()
    } else {
        backend.flush()
    }
}

impl fmt::Debug for RedoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RedoLog")
            .field("policy", &self.policy)
            .field("file", &state.file)
            .field("files", &state.sizes.len())
            .finish_non_exhaustive()
    }
}
