//! Stress tests for mvdb.
//!
//! These runners drive an engine under heavy load and concurrent access.
//! Each returns a [`StressTestResult`] that tests assert on and that can be
//! printed or exported as JSON for comparisons across runs.

use mvdb_codec::Value;
use mvdb_core::{CoreError, TransactionEngine, TransactionOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }

    /// The result as a JSON object.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Failed to serialize stress result")
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Size of each value in bytes.
    pub value_size: usize,
    /// Number of distinct keys.
    pub key_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            value_size: 256,
            key_count: 1_000,
        }
    }
}

fn key(i: usize, config: &StressConfig) -> Value {
    Value::Int((i % config.key_count.max(1)) as i64)
}

fn payload(config: &StressConfig) -> Value {
    Value::Bytes(vec![0xAB; config.value_size])
}

/// Run a sequential write stress test, one transaction per write.
pub fn stress_sequential_writes(engine: &TransactionEngine, config: &StressConfig) -> StressTestResult {
    let data = payload(config);
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match engine.run_transaction(TransactionOptions::default(), |txn| {
            txn.open_map::<Value>("stress")?.put(key(i, config), data.clone())?;
            Ok(())
        }) {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a mixed read/write/remove stress test.
pub fn stress_mixed_operations(engine: &TransactionEngine, config: &StressConfig) -> StressTestResult {
    let data = payload(config);
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let k = key(i, config);
        let result = engine.run_transaction(TransactionOptions::default(), |txn| {
            let map = txn.open_map::<Value>("stress")?;
            match i % 3 {
                0 => map.put(k.clone(), data.clone()).map(|_| ()),
                1 => map.get(&k).map(|_| ()),
                _ => map.remove(&k).map(|_| ()),
            }
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run a transaction abort stress test. Every other transaction fails
/// on purpose after writing.
pub fn stress_transaction_aborts(engine: &TransactionEngine, config: &StressConfig) -> StressTestResult {
    let data = payload(config);
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let should_fail = i % 2 == 0;
        let result = engine.run_transaction(TransactionOptions::default(), |txn| {
            txn.open_map::<Value>("stress")?.put(key(i, config), data.clone())?;
            if should_fail {
                Err(CoreError::invalid_operation("intentional abort"))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Increments `config.key_count` hot counters from `config.threads`
/// threads. Returns the run result and the sum of all counters, which
/// equals the number of successful increments when no update was lost.
pub fn stress_contended_counters(
    engine: &TransactionEngine,
    config: &StressConfig,
) -> (StressTestResult, i64) {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let ops_per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let k = key(t * ops_per_thread + i, config);
                    let result = engine.run_transaction(TransactionOptions::default(), |txn| {
                        let map = txn.open_map::<Value>("counters")?;
                        // Take the row lock before reading.
                        let current = map.put(k.clone(), Value::Null)?;
                        let next = current.and_then(|v| v.as_int()).unwrap_or(0) + 1;
                        map.put(k.clone(), Value::Int(next))?;
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );

    let txn = engine
        .begin(TransactionOptions::default())
        .expect("Failed to begin transaction");
    let total = txn
        .open_map::<Value>("counters")
        .expect("Failed to open map")
        .cursor(None, None)
        .expect("Failed to open cursor")
        .map(|entry| entry.map(|(_, v)| v.as_int().unwrap_or(0)))
        .sum::<Result<i64, _>>()
        .expect("Failed to read counters");
    txn.rollback().expect("Failed to roll back");
    (result, total)
}

/// Runs writers and checkpoints side by side. Each operation is one
/// write transaction; every `operations / 10` writes a checkpoint runs.
pub fn stress_writes_with_checkpoints(
    engine: &TransactionEngine,
    config: &StressConfig,
) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();
    let data = payload(config);
    let ops_per_thread = config.operations / config.threads.max(1);

    thread::scope(|scope| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            let data = &data;
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let k = key(t * ops_per_thread + i, config);
                    let result = engine.run_transaction(TransactionOptions::default(), |txn| {
                        txn.open_map::<Value>("stress")?.put(k.clone(), data.clone())?;
                        Ok(())
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..10 {
                if engine.checkpoint().is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                thread::sleep(Duration::from_millis(2));
            }
        });
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
