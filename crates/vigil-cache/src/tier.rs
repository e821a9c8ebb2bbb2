//! Named TTL presets
//!
//! Hot data is re-read often, cold data rarely. A probe can be configured
//! with a tier instead of an explicit TTL.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// 10 second TTL
    Hot,
    /// 60 second TTL
    Warm,
    /// 300 second TTL
    Cold,
}

impl CacheTier {
    pub fn ttl(self) -> Duration {
        match self {
            CacheTier::Hot => Duration::from_secs(10),
            CacheTier::Warm => Duration::from_secs(60),
            CacheTier::Cold => Duration::from_secs(300),
        }
    }

    /// The tier an arbitrary TTL falls into: up to 10s is hot, up to 60s
    /// warm, anything longer cold.
    pub fn for_ttl(ttl: Duration) -> Self {
        if ttl <= CacheTier::Hot.ttl() {
            CacheTier::Hot
        } else if ttl <= CacheTier::Warm.ttl() {
            CacheTier::Warm
        } else {
            CacheTier::Cold
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Hot => "hot",
            CacheTier::Warm => "warm",
            CacheTier::Cold => "cold",
        }
    }
}

impl Default for CacheTier {
    fn default() -> Self {
        CacheTier::Warm
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
