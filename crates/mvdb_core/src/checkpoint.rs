//! Checkpoints: persisting maps and trimming the redo log.
//!
//! One cycle compacts sparse chunks, rotates the redo log and captures
//! every open map under the exclusive commit gate, writes the captured
//! pages into a new chunk with the manifest, removes redo files below the
//! new mark and deletes chunks no live transaction can reach.
//!
//! A failed cycle leaves the previous manifest and log in place; retired
//! pages go back to their maps and the next tick tries again.

use crate::engine::EngineShared;
use crate::error::CoreResult;
use crate::storage::PersistContext;
use crate::types::{CheckpointMark, ChunkId, LogPosition, TransactionId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A countdown the caller can wait on.
#[derive(Debug)]
pub struct Latch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    /// A latch that opens after `count` count-downs.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrements the count, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Remaining count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Blocks until the count reaches zero or `timeout` passes. Returns
    /// true if the latch opened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// What one checkpoint did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Chunk written, `None` if nothing was dirty.
    pub chunk: Option<ChunkId>,
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
    /// Redo position recovery now starts from.
    pub mark: LogPosition,
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Cycles that completed.
    pub completed: u64,
    /// Cycles that failed.
    pub failed: u64,
    /// Report of the last completed cycle.
    pub last: Option<CheckpointReport>,
}

/// Decides when to checkpoint and runs the cycle.
pub struct CheckpointService {
    running: Mutex<()>,
    requested: AtomicBool,
    last_run: Mutex<Instant>,
    interval: Duration,
    max_log_size: u64,
    stats: Mutex<CheckpointStats>,
}

impl CheckpointService {
    pub(crate) fn new(interval: Duration, max_log_size: u64) -> Self {
        Self {
            running: Mutex::new(()),
            requested: AtomicBool::new(false),
            last_run: Mutex::new(Instant::now()),
            interval,
            max_log_size,
            stats: Mutex::new(CheckpointStats::default()),
        }
    }

    /// Asks for a checkpoint on the next tick.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    /// True if a run was requested and has not happened yet.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> CheckpointStats {
        self.stats.lock().clone()
    }

    pub(crate) fn is_due(&self, log_size: u64) -> bool {
        self.is_requested()
            || (!self.interval.is_zero() && self.last_run.lock().elapsed() >= self.interval)
            || log_size > self.max_log_size
    }

    /// Runs a checkpoint if one is due and none is running, logging
    /// failures.
    pub(crate) fn tick(&self, engine: &EngineShared) {
        if !self.is_due(engine.redo.size()) {
            return;
        }
        let Some(running) = self.running.try_lock() else {
            return;
        };
        // Another caller may have finished a cycle since the first check.
        if !self.is_due(engine.redo.size()) {
            return;
        }
        if let Err(e) = self.run_exclusive(engine, running) {
            tracing::warn!(error = %e, "checkpoint failed, retrying on next tick");
        }
    }

    /// Runs one cycle now.
    pub(crate) fn run(&self, engine: &EngineShared) -> CoreResult<CheckpointReport> {
        let running = self.running.lock();
        self.run_exclusive(engine, running)
    }

    fn run_exclusive(
        &self,
        engine: &EngineShared,
        _running: MutexGuard<'_, ()>,
    ) -> CoreResult<CheckpointReport> {
        self.requested.store(false, Ordering::Release);
        let started = Instant::now();
        let result = self.cycle(engine);
        *self.last_run.lock() = Instant::now();

        let mut stats = self.stats.lock();
        match &result {
            Ok(report) => {
                stats.completed += 1;
                stats.last = Some(report.clone());
                tracing::info!(
                    chunk = ?report.chunk,
                    pages = report.pages,
                    compacted = report.compacted_pages,
                    released = report.released_pages,
                    log_files_removed = report.log_files_removed,
                    chunks_deleted = report.chunks_deleted,
                    mark = %report.mark,
                    elapsed = ?started.elapsed(),
                    "checkpoint complete"
                );
            }
            Err(_) => {
                stats.failed += 1;
                self.requested.store(true, Ordering::Release);
            }
        }
        result
    }

    fn cycle(&self, engine: &EngineShared) -> CoreResult<CheckpointReport> {
        let compacted_pages = engine.storage.compact()?;

        let (mark, capture, last_transaction_id) = {
            let _gate = engine.commit_gate.write();
            let mark = engine.redo.rotate()?;
            (mark, engine.storage.capture(), engine.manager.last_id())
        };

        let previous = engine.storage.checkpoint_mark();
        let outcome = engine.storage.persist(
            capture,
            PersistContext {
                last_transaction_id,
                mark: Some(CheckpointMark {
                    last_gc_meta_id: previous.last_gc_meta_id + 1,
                    log_position: mark,
                }),
                gc_clock: engine.manager.next_id(),
            },
        )?;

        let log_files_removed = engine.redo.remove_before(mark)?;
        let oldest = engine
            .manager
            .oldest_active_transaction_id()
            .map(TransactionId::as_u64);
        let chunks_deleted = engine.storage.collect_garbage(oldest)?;

        Ok(CheckpointReport {
            chunk: outcome.chunk,
            pages: outcome.pages,
            compacted_pages,
            released_pages: outcome.released,
            log_files_removed,
            chunks_deleted,
            mark,
        })
    }
}

impl fmt::Debug for CheckpointService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointService")
            .field("interval", &self.interval)
            .field("max_log_size", &self.max_log_size)
            .field("requested", &self.is_requested())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn latch_opens_at_zero() {
        let latch = Arc::new(Latch::new(2));
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        let l = Arc::clone(&latch);
        let waiter = thread::spawn(move || l.wait());
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        latch.count_down();
        waiter.join().unwrap();
        assert_eq!(latch.count(), 0);
        assert!(latch.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn due_on_request_interval_or_log_size() {
        let service = CheckpointService::new(Duration::ZERO, 1024);
        assert!(!service.is_due(0));
        assert!(service.is_due(1025));
        service.request();
        assert!(service.is_due(0));

        let periodic = CheckpointService::new(Duration::from_millis(1), u64::MAX);
        thread::sleep(Duration::from_millis(5));
        assert!(periodic.is_due(0));
    }
}
