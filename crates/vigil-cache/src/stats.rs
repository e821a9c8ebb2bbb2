//! Cache counters

use crate::tier::CacheTier;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub coalesced: AtomicU64,
    pub failures: AtomicU64,
    pub evictions: AtomicU64,
    pub hot_hits: AtomicU64,
    pub warm_hits: AtomicU64,
    pub cold_hits: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_tier(&self, tier: CacheTier) {
        Self::bump(match tier {
            CacheTier::Hot => &self.hot_hits,
            CacheTier::Warm => &self.warm_hits,
            CacheTier::Cold => &self.cold_hits,
        });
    }

    pub fn snapshot(&self, entries: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries,
            hits,
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses,
            refreshes: self.refreshes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            tier_hits: BTreeMap::from([
                (CacheTier::Hot, self.hot_hits.load(Ordering::Relaxed)),
                (CacheTier::Warm, self.warm_hits.load(Ordering::Relaxed)),
                (CacheTier::Cold, self.cold_hits.load(Ordering::Relaxed)),
            ]),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Point-in-time view of cache activity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Lookups answered by a fresh entry
    pub hits: u64,
    /// Failed refreshes answered by a last-known-good entry
    pub stale_hits: u64,
    /// Lookups that needed a refresh (started one or joined one)
    pub misses: u64,
    /// Refresh invocations actually started
    pub refreshes: u64,
    /// Callers that joined a refresh another caller started
    pub coalesced: u64,
    pub failures: u64,
    pub evictions: u64,
    /// Fresh hits split by the tier of the entry's TTL
    pub tier_hits: BTreeMap<CacheTier, u64>,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}
