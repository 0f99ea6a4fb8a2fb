//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for cache and event log operations.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Records that produced an event.
    records_applied: AtomicU64,
    /// Records dropped because the cached version is identical.
    duplicates: AtomicU64,
    /// Records dropped because the cached version is newer.
    stale: AtomicU64,
    /// Records dropped for missing kind or name.
    invalid: AtomicU64,
    /// Events appended to the log.
    events_pushed: AtomicU64,
    /// Events evicted from the log.
    events_evicted: AtomicU64,
    /// Updates held back by the compliance throttle.
    throttled: AtomicU64,
}

impl CacheStats {
    /// Create new cache statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied record.
    #[inline]
    pub fn record_applied(&self) {
        self.records_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an equal-version re-delivery.
    #[inline]
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an out-of-order record.
    #[inline]
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected record.
    #[inline]
    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event pushed to the log.
    #[inline]
    pub fn record_pushed(&self) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event evicted from the log.
    #[inline]
    pub fn record_evicted(&self) {
        self.events_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an update suppressed by the throttle.
    #[inline]
    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Total applied records.
    #[inline]
    pub fn records_applied(&self) -> u64 {
        self.records_applied.load(Ordering::Relaxed)
    }

    /// Total duplicate records.
    #[inline]
    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Total stale records.
    #[inline]
    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    /// Total invalid records.
    #[inline]
    pub fn invalid(&self) -> u64 {
        self.invalid.load(Ordering::Relaxed)
    }

    /// Total events pushed.
    #[inline]
    pub fn events_pushed(&self) -> u64 {
        self.events_pushed.load(Ordering::Relaxed)
    }

    /// Total events evicted.
    #[inline]
    pub fn events_evicted(&self) -> u64 {
        self.events_evicted.load(Ordering::Relaxed)
    }

    /// Total throttled updates.
    #[inline]
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// Share of incoming records that were re-deliveries (0.0 to 1.0).
    pub fn duplicate_rate(&self) -> f64 {
        let duplicates = self.duplicates() as f64;
        let total = duplicates + self.records_applied() as f64;
        if total == 0.0 {
            0.0
        } else {
            duplicates / total
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.records_applied.store(0, Ordering::Relaxed);
        self.duplicates.store(0, Ordering::Relaxed);
        self.stale.store(0, Ordering::Relaxed);
        self.invalid.store(0, Ordering::Relaxed);
        self.events_pushed.store(0, Ordering::Relaxed);
        self.events_evicted.store(0, Ordering::Relaxed);
        self.throttled.store(0, Ordering::Relaxed);
    }
}
