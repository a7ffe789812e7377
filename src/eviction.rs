//! Memory-pressure eviction.

use std::sync::Arc;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::logging::CacheEventType;
use crate::store::CacheStore;

/// Source of the process's resident memory figure.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident set size in bytes, or `None` when it cannot be measured.
    fn resident_bytes(&self) -> Option<u64>;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> Option<u64> + Send + Sync + 'static,
{
    fn resident_bytes(&self) -> Option<u64> {
        self()
    }
}

/// Reads `VmRSS` from `/proc/self/status`. Reports nothing off Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// What a [`CacheStore::free_memory`] pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<CacheKey>,
    pub freed_bytes: u64,
}

impl EvictionReport {
    pub fn evicted_count(&self) -> usize {
        self.evicted.len()
    }
}

/// Result of one memory check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCheck {
    /// The probe had no figure.
    Unavailable,
    WithinThreshold { resident: u64 },
    Evicted { resident: u64, report: EvictionReport },
}

impl CacheStore {
    /// Evicts entries until at least `target` body bytes are freed or nothing
    /// evictable is left.
    ///
    /// Least-hit entries go first; among equal hit counts the larger body goes
    /// first. Pending entries are never evicted since their fetch is still
    /// feeding pooled callers.
    pub fn free_memory(&self, target: u64) -> EvictionReport {
        let mut candidates: Vec<(Arc<CacheEntry>, u64, u64)> = self
            .entries()
            .iter()
            .filter(|item| item.value().is_servable())
            .map(|item| {
                let entry = item.value().clone();
                let hits = entry.hits();
                let size = entry.body_len() as u64;
                (entry, hits, size)
            })
            .collect();
        candidates.sort_by(|(_, a_hits, a_size), (_, b_hits, b_size)| {
            a_hits.cmp(b_hits).then(b_size.cmp(a_size))
        });

        let mut report = EvictionReport::default();
        for (entry, hits, size) in candidates {
            if report.freed_bytes >= target {
                break;
            }
            if !self.discard(&entry) {
                continue;
            }
            tracing::debug!(key = %entry.key(), hits, size_bytes = size, "evicted");
            self.emit(CacheEventType::Evict, entry.key(), |event| {
                event.with_hits(hits).with_size(size as usize)
            });
            report.freed_bytes += size;
            report.evicted.push(entry.key().clone());
        }

        self.stats().record_evictions(report.evicted.len() as u64);
        #[cfg(feature = "metrics")]
        counter!("tower_proxy_cache.evicted").increment(report.evicted.len() as u64);
        report
    }

    /// Samples resident memory and frees the overshoot when it is above the
    /// configured threshold.
    pub fn check_memory(&self) -> MemoryCheck {
        let Some(resident) = self.probe().resident_bytes() else {
            tracing::debug!("resident memory unavailable; skipping check");
            return MemoryCheck::Unavailable;
        };

        let threshold = self.config().memory_threshold();
        if resident <= threshold {
            return MemoryCheck::WithinThreshold { resident };
        }

        let overshoot = resident - threshold;
        let report = self.free_memory(overshoot);
        tracing::warn!(
            resident,
            threshold,
            evicted = report.evicted_count(),
            freed_bytes = report.freed_bytes,
            "memory threshold exceeded; evicted entries"
        );
        MemoryCheck::Evicted { resident, report }
    }
}
