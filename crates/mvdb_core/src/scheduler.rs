//! Cooperative schedulers.
//!
//! A [`Scheduler`] runs [`Task`]s from its ready queue. A task that finds a
//! row locked (`try_put` failing with [`CoreError::Locked`]) reports
//! [`TaskStatus::Blocked`], usually through [`TaskStatus::blocked_by`], and
//! is parked until the holder ends or the lock timeout passes. Each pass also ticks
//! the scheduler's periodic [`Service`]s (redo sync, checkpoints).
//!
//! Worker threads are optional: without them, callers drive
//! [`SchedulerPool::run_once`].

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What a task reports after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task is finished.
    Done,
    /// Run again on the next pass.
    Yield,
    /// Waiting for `holder` to release a row.
    Blocked {
        /// Transaction holding the row.
        holder: TransactionId,
    },
}

impl TaskStatus {
    /// `Blocked` on the holder if `error` is a row lock, `None` for any
    /// other error.
    pub fn blocked_by(error: &CoreError) -> Option<Self> {
        error.blocked_on().map(|holder| Self::Blocked { holder })
    }
}

/// A unit of cooperative work.
pub trait Task: Send {
    /// Runs one step.
    fn run(&mut self) -> TaskStatus;

    /// Called instead of [`run`](Task::run) when the task stayed blocked
    /// for longer than the lock timeout. The task is dropped afterwards.
    fn timed_out(&mut self) {}
}

impl<F> Task for F
where
    F: FnMut() -> TaskStatus + Send,
{
    fn run(&mut self) -> TaskStatus {
        self()
    }
}

/// Periodic work ticked on every scheduler pass.
pub trait Service: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Does whatever is due. Must be cheap when nothing is.
    fn tick(&self);
}

struct Parked {
    task: Box<dyn Task>,
    holder: TransactionId,
    deadline: Instant,
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<Box<dyn Task>>,
    parked: Vec<Parked>,
    /// Passes in progress.
    passes: usize,
    /// Holders that ended during the current passes.
    released: Vec<TransactionId>,
}

/// A run queue with parked tasks and periodic services.
pub struct Scheduler {
    id: usize,
    lock_timeout: Duration,
    queues: Mutex<Queues>,
    services: Mutex<Vec<Arc<dyn Service>>>,
    signal: Condvar,
}

impl Scheduler {
    fn new(id: usize, lock_timeout: Duration) -> Self {
        Self {
            id,
            lock_timeout,
            queues: Mutex::new(Queues::default()),
            services: Mutex::new(Vec::new()),
            signal: Condvar::new(),
        }
    }

    /// Scheduler id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queues a task.
    pub fn submit(&self, task: Box<dyn Task>) {
        self.queues.lock().ready.push_back(task);
        self.signal.notify_one();
    }

    /// Adds a periodic service.
    pub fn add_service(&self, service: Arc<dyn Service>) {
        self.services.lock().push(service);
    }

    /// Tasks ready to run.
    pub fn queued(&self) -> usize {
        self.queues.lock().ready.len()
    }

    /// Tasks waiting for a row.
    pub fn parked(&self) -> usize {
        self.queues.lock().parked.len()
    }

    /// Runs one pass: ticks services, expires parked tasks, then runs every
    /// task that was ready when the pass started. Returns the number of
    /// tasks run.
    pub fn run_once(&self) -> usize {
        let services = self.services.lock().clone();
        for service in &services {
            service.tick();
        }

        let now = Instant::now();
        let (expired, batch) = {
            let mut queues = self.queues.lock();
            let (expired, waiting): (Vec<Parked>, Vec<Parked>) = queues
                .parked
                .drain(..)
                .partition(|p| p.deadline <= now);
            queues.parked = waiting;
            queues.passes += 1;
            (expired, std::mem::take(&mut queues.ready))
        };
        for mut parked in expired {
            tracing::debug!(scheduler = self.id, holder = %parked.holder, "blocked task timed out");
            parked.task.timed_out();
        }

        let ran = batch.len();
        for mut task in batch {
            match task.run() {
                TaskStatus::Done => {}
                TaskStatus::Yield => self.queues.lock().ready.push_back(task),
                TaskStatus::Blocked { holder } => {
                    let mut queues = self.queues.lock();
                    if queues.released.contains(&holder) {
                        // The holder ended while the task ran; retry.
                        queues.ready.push_back(task);
                    } else {
                        queues.parked.push(Parked {
                            task,
                            holder,
                            deadline: Instant::now() + self.lock_timeout,
                        });
                    }
                }
            }
        }

        let mut queues = self.queues.lock();
        queues.passes -= 1;
        if queues.passes == 0 {
            queues.released.clear();
        }
        ran
    }

    /// Moves tasks blocked on `holder` back to the ready queue.
    pub(crate) fn wake(&self, holder: TransactionId) {
        let mut queues = self.queues.lock();
        if queues.passes > 0 {
            queues.released.push(holder);
        }
        let (woken, waiting): (Vec<Parked>, Vec<Parked>) =
            queues.parked.drain(..).partition(|p| p.holder == holder);
        queues.parked = waiting;
        let woke = !woken.is_empty();
        queues.ready.extend(woken.into_iter().map(|p| p.task));
        drop(queues);
        if woke {
            self.signal.notify_one();
        }
    }

    fn wait_for_work(&self, timeout: Duration) {
        let mut queues = self.queues.lock();
        if queues.ready.is_empty() {
            self.signal.wait_for(&mut queues, timeout);
        }
    }

    fn notify(&self) {
        self.signal.notify_all();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.lock();
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("ready", &queues.ready.len())
            .field("parked", &queues.parked.len())
            .finish_non_exhaustive()
    }
}

/// A fixed set of schedulers, optionally backed by worker threads.
pub struct SchedulerPool {
    schedulers: Vec<Arc<Scheduler>>,
    tick: Duration,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerPool {
    /// Creates `count` schedulers (at least one).
    pub fn new(count: usize, lock_timeout: Duration, tick: Duration) -> Self {
        Self {
            schedulers: (0..count.max(1))
                .map(|id| Arc::new(Scheduler::new(id, lock_timeout)))
                .collect(),
            tick,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of schedulers.
    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    /// Always false; a pool has at least one scheduler.
    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    /// The scheduler for `index`, wrapping around.
    pub fn scheduler(&self, index: usize) -> &Arc<Scheduler> {
        &self.schedulers[index % self.schedulers.len()]
    }

    /// Queues a task on the scheduler for `index`.
    pub fn submit(&self, index: usize, task: Box<dyn Task>) {
        self.scheduler(index).submit(task);
    }

    /// Runs one pass on every scheduler. Returns the number of tasks run.
    pub fn run_once(&self) -> usize {
        self.schedulers.iter().map(|s| s.run_once()).sum()
    }

    /// Wakes tasks blocked on `holder` everywhere.
    pub fn wake_all(&self, holder: TransactionId) {
        for scheduler in &self.schedulers {
            scheduler.wake(holder);
        }
    }

    /// True while worker threads are running.
    pub fn has_workers(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Spawns one worker thread per scheduler. Does nothing if they run
    /// already.
    pub fn start_workers(&self) -> CoreResult<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Release);
        for scheduler in &self.schedulers {
            let scheduler = Arc::clone(scheduler);
            let shutdown = Arc::clone(&self.shutdown);
            let tick = self.tick;
            let handle = thread::Builder::new()
                .name(format!("mvdb-scheduler-{}", scheduler.id()))
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        if scheduler.run_once() == 0 {
                            scheduler.wait_for_work(tick);
                        }
                    }
                })?;
            workers.push(handle);
        }
        tracing::debug!(workers = workers.len(), "scheduler workers started");
        Ok(())
    }

    /// Stops and joins the worker threads.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        for scheduler in &self.schedulers {
            scheduler.notify();
        }
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("scheduler worker panicked");
            }
        }
        tracing::debug!("scheduler workers stopped");
    }
}

impl fmt::Debug for SchedulerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerPool")
            .field("schedulers", &self.schedulers)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        ticks: AtomicUsize,
    }

    impl Service for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn tasks_run_yield_and_finish() {
        let pool = SchedulerPool::new(2, Duration::from_secs(1), Duration::from_millis(1));
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        pool.submit(
            0,
            Box::new(move || {
                if r.fetch_add(1, Ordering::SeqCst) < 2 {
                    TaskStatus::Yield
                } else {
                    TaskStatus::Done
                }
            }),
        );
        assert_eq!(pool.scheduler(0).queued(), 1);
        assert_eq!(pool.run_once(), 1);
        assert_eq!(pool.run_once(), 1);
        assert_eq!(pool.run_once(), 1);
        assert_eq!(pool.run_once(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(pool.scheduler(2).id(), 0);
    }

    #[test]
    fn blocked_task_resumes_when_holder_releases() {
        let pool = SchedulerPool::new(1, Duration::from_secs(60), Duration::from_millis(1));
        let holder = TransactionId::new(7);
        let released = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (r, d) = (Arc::clone(&released), Arc::clone(&done));
        pool.submit(
            0,
            Box::new(move || {
                if r.load(Ordering::SeqCst) {
                    d.store(true, Ordering::SeqCst);
                    TaskStatus::Done
                } else {
                    TaskStatus::Blocked { holder }
                }
            }),
        );
        pool.run_once();
        assert_eq!(pool.scheduler(0).parked(), 1);
        pool.run_once();
        assert_eq!(pool.scheduler(0).parked(), 1);

        pool.wake_all(TransactionId::new(8));
        assert_eq!(pool.scheduler(0).parked(), 1);

        released.store(true, Ordering::SeqCst);
        pool.wake_all(holder);
        assert_eq!(pool.scheduler(0).parked(), 0);
        pool.run_once();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn holder_ending_during_the_run_requeues_the_task() {
        let pool = Arc::new(SchedulerPool::new(
            1,
            Duration::from_secs(60),
            Duration::from_millis(1),
        ));
        let holder = TransactionId::new(7);
        let runs = Arc::new(AtomicUsize::new(0));
        let (p, r) = (Arc::clone(&pool), Arc::clone(&runs));
        pool.submit(
            0,
            Box::new(move || {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    return TaskStatus::Done;
                }
                // Another transaction ends, then the holder.
                p.wake_all(TransactionId::new(8));
                p.wake_all(holder);
                TaskStatus::Blocked { holder }
            }),
        );
        pool.run_once();
        assert_eq!(pool.scheduler(0).parked(), 0);
        assert_eq!(pool.scheduler(0).queued(), 1);
        pool.run_once();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn only_row_locks_block() {
        let holder = TransactionId::new(3);
        let locked = CoreError::Locked {
            map: "t".into(),
            key: "1".into(),
            holder,
        };
        assert_eq!(TaskStatus::blocked_by(&locked), Some(TaskStatus::Blocked { holder }));
        assert_eq!(TaskStatus::blocked_by(&CoreError::write_conflict("t", &1)), None);
    }

    #[test]
    fn blocked_task_times_out() {
        struct Stuck {
            timed_out: Arc<AtomicBool>,
        }
        impl Task for Stuck {
            fn run(&mut self) -> TaskStatus {
                TaskStatus::Blocked {
                    holder: TransactionId::new(1),
                }
            }
            fn timed_out(&mut self) {
                self.timed_out.store(true, Ordering::SeqCst);
            }
        }

        let pool = SchedulerPool::new(1, Duration::ZERO, Duration::from_millis(1));
        let flag = Arc::new(AtomicBool::new(false));
        pool.submit(
            0,
            Box::new(Stuck {
                timed_out: Arc::clone(&flag),
            }),
        );
        pool.run_once();
        assert_eq!(pool.scheduler(0).parked(), 1);
        pool.run_once();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(pool.scheduler(0).parked(), 0);
    }

    #[test]
    fn services_tick_every_pass() {
        let pool = SchedulerPool::new(1, Duration::from_secs(1), Duration::from_millis(1));
        let counter = Arc::new(Counter {
            ticks: AtomicUsize::new(0),
        });
        pool.scheduler(0).add_service(Arc::clone(&counter) as Arc<dyn Service>);
        pool.run_once();
        pool.run_once();
        assert_eq!(counter.ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn workers_drain_queues() {
        let pool = SchedulerPool::new(2, Duration::from_secs(1), Duration::from_millis(1));
        pool.start_workers().unwrap();
        assert!(pool.has_workers());
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let c = Arc::clone(&count);
            pool.submit(
                i,
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    TaskStatus::Done
                }),
            );
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        pool.shutdown();
        assert!(!pool.has_workers());
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
