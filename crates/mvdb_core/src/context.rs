//! Process-wide engine context.
//!
//! Shared services that would otherwise be global statics live here and are
//! handed to storage and pages explicitly. The context is created when an
//! engine (or a standalone [`crate::Storage`]) opens and dropped with it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks memory held by lazily decoded pages.
#[derive(Debug, Default)]
pub struct MemoryPool {
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryPool {
    /// Adds `bytes` to the pool.
    pub fn charge(&self, bytes: usize) {
        let used = self.used.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(used, Ordering::AcqRel);
    }

    /// Returns `bytes` to the pool.
    pub fn release(&self, bytes: usize) {
        // Saturate rather than wrap if accounting ever goes out of balance.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Highest value `used` has reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// Shared services injected into storage and pages.
#[derive(Debug, Default)]
pub struct EngineContext {
    memory: MemoryPool,
}

impl EngineContext {
    /// Creates a fresh context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The page memory pool.
    pub fn memory(&self) -> &MemoryPool {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release_track_peak() {
        let pool = MemoryPool::default();
        pool.charge(100);
        pool.charge(50);
        pool.release(120);
        assert_eq!(pool.used(), 30);
        assert_eq!(pool.peak(), 150);
    }

    #[test]
    fn release_never_underflows() {
        let pool = MemoryPool::default();
        pool.charge(10);
        pool.release(25);
        assert_eq!(pool.used(), 0);
    }
}
