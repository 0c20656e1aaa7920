//! Registry of live transactions.

use crate::types::{IsolationLevel, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct LiveTransaction {
    snapshot: Option<TransactionId>,
}

/// Ids, snapshots and row-release signalling for all live transactions.
///
/// Transaction ids and commit ids come from one counter. Live transactions
/// are registered in one table per scheduler, each behind its own mutex.
///
/// A repeatable-read transaction's snapshot is its own id: it sees exactly
/// the commits with a smaller id. Commit ids still being applied are
/// tracked so such a transaction starts only once every smaller commit
/// is fully visible.
pub struct TransactionManager {
    next_id: AtomicU64,
    tables: Vec<Mutex<HashMap<TransactionId, LiveTransaction>>>,
    /// Commit ids being applied, and the active repeatable-read snapshots
    /// with their reference counts. One mutex orders id allocation against
    /// both.
    commits: Mutex<CommitState>,
    commit_done: Condvar,
    released: Mutex<u64>,
    release_signal: Condvar,
}

#[derive(Debug, Default)]
struct CommitState {
    in_flight: BTreeSet<TransactionId>,
    snapshots: BTreeMap<TransactionId, usize>,
}

impl CommitState {
    fn release_snapshot(&mut self, snapshot: TransactionId) {
        if let Some(count) = self.snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                self.snapshots.remove(&snapshot);
            }
        }
    }
}

impl TransactionManager {
    /// Creates a manager whose first id follows `last_id`, with one table
    /// per scheduler.
    pub fn new(last_id: TransactionId, schedulers: usize) -> Self {
        Self {
            next_id: AtomicU64::new(last_id.as_u64() + 1),
            tables: (0..schedulers.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            commits: Mutex::new(CommitState::default()),
            commit_done: Condvar::new(),
            released: Mutex::new(0),
            release_signal: Condvar::new(),
        }
    }

    fn table(&self, scheduler: usize) -> &Mutex<HashMap<TransactionId, LiveTransaction>> {
        &self.tables[scheduler % self.tables.len()]
    }

    /// Allocates an id and registers the transaction. For repeatable read,
    /// returns the snapshot after waiting for smaller in-flight commits.
    pub fn register(
        &self,
        isolation: IsolationLevel,
        scheduler: usize,
    ) -> (TransactionId, Option<TransactionId>) {
        let (id, snapshot) = match isolation {
            IsolationLevel::ReadCommitted => {
                let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
                (id, None)
            }
            IsolationLevel::RepeatableRead => {
                let mut commits = self.commits.lock();
                let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
                *commits.snapshots.entry(id).or_insert(0) += 1;
                while commits.in_flight.range(..id).next().is_some() {
                    self.commit_done.wait(&mut commits);
                }
                (id, Some(id))
            }
        };
        self.table(scheduler)
            .lock()
            .insert(id, LiveTransaction { snapshot });
        (id, snapshot)
    }

    /// Moves the snapshot of repeatable-read transaction `id` past every
    /// commit so far, including its own. Waits for smaller in-flight
    /// commits like [`register`](Self::register). Returns `None` for a
    /// read-committed or unknown transaction.
    pub fn advance_snapshot(&self, id: TransactionId, scheduler: usize) -> Option<TransactionId> {
        let mut table = self.table(scheduler).lock();
        let live = table.get_mut(&id)?;
        let old = live.snapshot?;
        let mut commits = self.commits.lock();
        let snapshot = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        *commits.snapshots.entry(snapshot).or_insert(0) += 1;
        commits.release_snapshot(old);
        live.snapshot = Some(snapshot);
        drop(table);
        while commits.in_flight.range(..snapshot).next().is_some() {
            self.commit_done.wait(&mut commits);
        }
        Some(snapshot)
    }

    /// Removes a finished transaction.
    pub fn deregister(&self, id: TransactionId, scheduler: usize) {
        let removed = self.table(scheduler).lock().remove(&id);
        if let Some(LiveTransaction {
            snapshot: Some(snapshot),
        }) = removed
        {
            self.commits.lock().release_snapshot(snapshot);
        }
    }

    /// Allocates a commit id and marks it in flight.
    pub fn begin_commit(&self) -> TransactionId {
        let mut commits = self.commits.lock();
        let id = TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        commits.in_flight.insert(id);
        id
    }

    /// Marks a commit id as fully applied (or abandoned).
    pub fn end_commit(&self, commit_id: TransactionId) {
        self.commits.lock().in_flight.remove(&commit_id);
        self.commit_done.notify_all();
    }

    /// Oldest active repeatable-read snapshot; committed history needed by
    /// it must be retained.
    pub fn retain_floor(&self) -> Option<TransactionId> {
        self.commits.lock().snapshots.keys().next().copied()
    }

    /// Newest active repeatable-read snapshot.
    pub fn max_repeatable_read_transaction_id(&self) -> Option<TransactionId> {
        self.commits.lock().snapshots.keys().next_back().copied()
    }

    /// Number of active repeatable-read transactions.
    pub fn repeatable_read_count(&self) -> usize {
        self.commits.lock().snapshots.values().sum()
    }

    /// Smallest id among live transactions.
    pub fn oldest_active_transaction_id(&self) -> Option<TransactionId> {
        self.tables
            .iter()
            .filter_map(|t| t.lock().keys().min().copied())
            .min()
    }

    /// True if `id` is registered.
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.tables.iter().any(|t| t.lock().contains_key(&id))
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.tables.iter().map(|t| t.lock().len()).sum()
    }

    /// Highest id handed out so far.
    pub fn last_id(&self) -> TransactionId {
        TransactionId::new(self.next_id.load(Ordering::SeqCst) - 1)
    }

    /// The next id to be handed out; used as the chunk GC clock.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Counter bumped whenever some transaction releases rows.
    pub fn release_generation(&self) -> u64 {
        *self.released.lock()
    }

    /// Signals that rows were released by a commit or rollback.
    pub fn rows_released(&self) {
        *self.released.lock() += 1;
        self.release_signal.notify_all();
    }

    /// Waits until rows are released after generation `seen`, or until
    /// `deadline`. Returns false on timeout.
    pub fn wait_release(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = self.released.lock();
        while *generation == seen {
            if self
                .release_signal
                .wait_until(&mut generation, deadline)
                .timed_out()
            {
                return *generation != seen;
            }
        }
        true
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ids_continue_after_last_and_are_shared_with_commits() {
        let manager = TransactionManager::new(TransactionId::new(10), 2);
        let (a, snapshot) = manager.register(IsolationLevel::ReadCommitted, 0);
        assert_eq!(a, TransactionId::new(11));
        assert_eq!(snapshot, None);
        let commit = manager.begin_commit();
        assert_eq!(commit, TransactionId::new(12));
        manager.end_commit(commit);
        let (b, _) = manager.register(IsolationLevel::ReadCommitted, 1);
        assert_eq!(b, TransactionId::new(13));
        assert_eq!(manager.last_id(), TransactionId::new(13));
    }

    #[test]
    fn tables_are_partitioned_by_scheduler() {
        let manager = TransactionManager::new(TransactionId::ZERO, 2);
        let (a, _) = manager.register(IsolationLevel::ReadCommitted, 0);
        let (b, _) = manager.register(IsolationLevel::ReadCommitted, 1);
        assert_eq!(manager.tables[0].lock().len(), 1);
        assert_eq!(manager.tables[1].lock().len(), 1);
        assert_eq!(manager.oldest_active_transaction_id(), Some(a));
        manager.deregister(a, 0);
        assert_eq!(manager.oldest_active_transaction_id(), Some(b));
        assert!(!manager.is_active(a));
        manager.deregister(b, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn repeatable_read_snapshots_set_floor() {
        let manager = TransactionManager::new(TransactionId::ZERO, 1);
        assert_eq!(manager.retain_floor(), None);
        let (a, sa) = manager.register(IsolationLevel::RepeatableRead, 0);
        let (b, _) = manager.register(IsolationLevel::RepeatableRead, 0);
        assert_eq!(sa, Some(a));
        assert_eq!(manager.retain_floor(), Some(a));
        assert_eq!(manager.max_repeatable_read_transaction_id(), Some(b));
        assert_eq!(manager.repeatable_read_count(), 2);
        manager.deregister(a, 0);
        assert_eq!(manager.retain_floor(), Some(b));
        manager.deregister(b, 0);
        assert_eq!(manager.retain_floor(), None);
    }

    #[test]
    fn advanced_snapshot_replaces_the_old_one() {
        let manager = TransactionManager::new(TransactionId::ZERO, 1);
        let (reader, snapshot) = manager.register(IsolationLevel::RepeatableRead, 0);
        let commit = manager.begin_commit();
        manager.end_commit(commit);

        let advanced = manager.advance_snapshot(reader, 0).unwrap();
        assert!(advanced > commit);
        assert_ne!(Some(advanced), snapshot);
        assert_eq!(manager.retain_floor(), Some(advanced));
        assert_eq!(manager.repeatable_read_count(), 1);

        let (plain, _) = manager.register(IsolationLevel::ReadCommitted, 0);
        assert_eq!(manager.advance_snapshot(plain, 0), None);

        manager.deregister(reader, 0);
        assert_eq!(manager.retain_floor(), None);
    }

    #[test]
    fn repeatable_read_begin_waits_for_older_commits() {
        let manager = Arc::new(TransactionManager::new(TransactionId::ZERO, 1));
        let commit = manager.begin_commit();

        let m = Arc::clone(&manager);
        let reader = thread::spawn(move || m.register(IsolationLevel::RepeatableRead, 0));
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        manager.end_commit(commit);
        let (id, snapshot) = reader.join().unwrap();
        assert!(id > commit);
        assert_eq!(snapshot, Some(id));
    }

    #[test]
    fn release_wait_wakes_or_times_out() {
        let manager = Arc::new(TransactionManager::new(TransactionId::ZERO, 1));
        let seen = manager.release_generation();
        let start = Instant::now();
        assert!(!manager.wait_release(seen, start + Duration::from_millis(10)));

        let m = Arc::clone(&manager);
        let waiter =
            thread::spawn(move || m.wait_release(seen, Instant::now() + Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        manager.rows_released();
        assert!(waiter.join().unwrap());
        assert!(manager.wait_release(seen, Instant::now()));
    }
}
