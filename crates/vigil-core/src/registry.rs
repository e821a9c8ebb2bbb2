//! Probe registry
//!
//! Set up once at startup. After that, only the enabled flags change, and
//! they are atomics so toggling never waits on a query in progress.

use crate::probe::{ProbeAdapter, ProbeKey};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// One registered probe
pub struct RegisteredProbe {
    pub key: ProbeKey,
    pub adapter: ProbeAdapter,
    pub ttl: Duration,
    /// Cache one entry per query scope instead of one global entry
    pub scoped: bool,
    enabled: AtomicBool,
}

impl RegisteredProbe {
    pub fn new(key: ProbeKey, adapter: ProbeAdapter, ttl: Duration, scoped: bool, enabled: bool) -> Self {
        Self {
            key,
            adapter,
            ttl,
            scoped,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn cache_key(&self, scope: Option<&str>) -> String {
        self.key.cache_key(if self.scoped { scope } else { None })
    }

    pub fn info(&self) -> ProbeInfo {
        ProbeInfo {
            key: self.key.clone(),
            enabled: self.is_enabled(),
            scoped: self.scoped,
            ttl_secs: self.ttl.as_secs_f64(),
            timeout_ms: self.adapter.timeout().as_millis() as u64,
            description: self.adapter.describe().to_string(),
        }
    }
}

/// Listing view of a registered probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeInfo {
    pub key: ProbeKey,
    pub enabled: bool,
    pub scoped: bool,
    pub ttl_secs: f64,
    pub timeout_ms: u64,
    pub description: String,
}

#[derive(Default)]
pub struct Registry {
    probes: RwLock<BTreeMap<ProbeKey, Arc<RegisteredProbe>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a probe. Returns the previous registration, if any.
    pub fn insert(&self, probe: RegisteredProbe) -> Option<Arc<RegisteredProbe>> {
        let mut probes = self.probes.write().unwrap_or_else(PoisonError::into_inner);
        probes.insert(probe.key.clone(), Arc::new(probe))
    }

    pub fn get(&self, key: &str) -> Option<Arc<RegisteredProbe>> {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        probes.get(key).cloned()
    }

    /// Flip a probe's enabled flag. Returns false if the key is unknown.
    pub fn set_enabled(&self, key: &str, enabled: bool) -> bool {
        match self.get(key) {
            Some(probe) => {
                probe.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// All probes in key order
    pub fn all(&self) -> Vec<Arc<RegisteredProbe>> {
        let probes = self.probes.read().unwrap_or_else(PoisonError::into_inner);
        probes.values().cloned().collect()
    }

    pub fn list(&self) -> Vec<ProbeInfo> {
        self.all().iter().map(|probe| probe.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.probes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
