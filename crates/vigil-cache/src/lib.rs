//! Vigil Cache - TTL memoization for perception probes
//!
//! This crate provides:
//! - Per-key TTLs with named presets (hot / warm / cold)
//! - Single-flight refresh: one probe call per stale key, however many callers
//! - Last-known-good fallback when a refresh fails, bounded by max staleness
//! - Optional LRU capacity bound for per-scope keys
//! - An injectable clock for deterministic expiry tests

pub mod cache;
pub mod clock;
pub mod stats;
pub mod tier;

pub use cache::{Aborted, CacheEntry, CacheOptions, Lookup, TieredCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use stats::CacheStats;
pub use tier::CacheTier;
