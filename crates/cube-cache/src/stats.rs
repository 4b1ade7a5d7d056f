//! Cache statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for cache behaviour.
///
/// `hits` counts every cache-served result; roll-ups and coalesced waits are
/// also counted separately.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    /// Hits answered by re-aggregating a finer entry
    rollup_hits: AtomicU64,
    misses: AtomicU64,
    /// Callers that waited on another caller's build
    coalesced: AtomicU64,
    evictions: AtomicU64,
    /// Entries dropped because their TTL elapsed
    expirations: AtomicU64,
    /// Entries dropped by invalidation
    invalidated: AtomicU64,
    /// Results refused for exceeding the per-table row limit
    refused_puts: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollup_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.rollup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidated(&self, count: u64) {
        self.invalidated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_refused_put(&self) {
        self.refused_puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn rollup_hits(&self) -> u64 {
        self.rollup_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn invalidated(&self) -> u64 {
        self.invalidated.load(Ordering::Relaxed)
    }

    pub fn refused_puts(&self) -> u64 {
        self.refused_puts.load(Ordering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get total requests (hits + misses)
    pub fn total_requests(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Reset all statistics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.rollup_hits,
            &self.misses,
            &self.coalesced,
            &self.evictions,
            &self.expirations,
            &self.invalidated,
            &self.refused_puts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Clone for CacheStats {
    fn clone(&self) -> Self {
        Self {
            hits: AtomicU64::new(self.hits()),
            rollup_hits: AtomicU64::new(self.rollup_hits()),
            misses: AtomicU64::new(self.misses()),
            coalesced: AtomicU64::new(self.coalesced()),
            evictions: AtomicU64::new(self.evictions()),
            expirations: AtomicU64::new(self.expirations()),
            invalidated: AtomicU64::new(self.invalidated()),
            refused_puts: AtomicU64::new(self.refused_puts()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = CacheStats::new();

        stats.record_hit();
        stats.record_rollup_hit();
        stats.record_coalesced();
        stats.record_miss();

        assert_eq!(stats.hits(), 3);
        assert_eq!(stats.rollup_hits(), 1);
        assert_eq!(stats.coalesced(), 1);
        assert_eq!(stats.misses(), 1);
        assert_eq!(stats.total_requests(), 4);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats::new();

        // Empty stats should return 0.0
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_rollup_hit();
        stats.record_miss();
        stats.record_miss();

        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_and_clone() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_eviction();
        stats.record_invalidated(4);

        let cloned = stats.clone();
        stats.reset();

        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.invalidated(), 0);
        assert_eq!(cloned.hits(), 1);
        assert_eq!(cloned.evictions(), 1);
        assert_eq!(cloned.invalidated(), 4);
    }
}
