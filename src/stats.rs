//! Store-wide counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated on the request path.
#[derive(Debug)]
pub struct StoreStats {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    external_hits: AtomicU64,
    pooled: AtomicU64,
    stores: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
    bypasses: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for StoreStats {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! record {
    ($($(#[$meta:meta])* $name:ident => $field:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl StoreStats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            external_hits: AtomicU64::new(0),
            pooled: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    record! {
        /// Counts every request that reached the store, bypassed or not.
        record_request => requests,
        record_hit => hits,
        record_miss => misses,
        record_external_hit => external_hits,
        record_pooled => pooled,
        record_store => stores,
        record_refresh => refreshes,
        record_refresh_failure => refresh_failures,
        record_bypass => bypasses,
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let external_hits = self.external_hits.load(Ordering::Relaxed);
        let pooled = self.pooled.load(Ordering::Relaxed);
        let bypasses = self.bypasses.load(Ordering::Relaxed);

        // Bypassed requests never had a chance to hit.
        let cacheable = requests.saturating_sub(bypasses);
        let served = hits + external_hits + pooled;
        let hit_rate = if cacheable > 0 {
            served as f64 / cacheable as f64
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            external_hits,
            pooled,
            stores: self.stores.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypasses,
            hit_rate,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub external_hits: u64,
    pub pooled: u64,
    pub stores: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub bypasses: u64,
    /// Share of cacheable requests answered without a new upstream fetch.
    pub hit_rate: f64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_excludes_bypassed_requests() {
        let stats = StoreStats::new();
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_bypass();
        stats.record_miss();
        stats.record_hit();
        stats.record_pooled();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.bypasses, 1);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_serialize() {
        let snapshot = StoreStats::default().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["evictions"], 0);
        assert_eq!(json["refresh_failures"], 0);
    }
}
