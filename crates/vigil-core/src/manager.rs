//! Perception manager
//!
//! Owns the probe registry and the cache. A query resolves every requested
//! probe concurrently: fresh cache entries answer immediately, expired ones
//! trigger one refresh per key, and a probe that fails or runs out of time
//! only degrades its own entry in the snapshot.

use crate::assembler::{DerivedField, SnapshotAssembler, SnapshotMeta};
use crate::config::PerceptionConfig;
use crate::context::{ProbeContext, QueryContext};
use crate::history::{HealthScore, History, HistoryPoint};
use crate::probe::{Probe, ProbeAdapter, ProbeFailure, ProbeKey, ProbeOutput};
use crate::registry::{ProbeInfo, RegisteredProbe, Registry};
use crate::snapshot::{Snapshot, SnapshotEntry};
use crate::{PerceptionError, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;
use vigil_cache::{CacheStats, CacheTier, Clock, SystemClock, TieredCache};

/// Everything needed to register one probe.
///
/// Unset values fall back to the manager's configuration. Settings listed
/// for the probe in the configuration file win over values set here.
pub struct ProbeRegistration {
    pub key: ProbeKey,
    pub probe: Arc<dyn Probe>,
    pub ttl: Option<Duration>,
    pub timeout: Option<Duration>,
    pub scoped: bool,
    pub enabled: bool,
}

impl ProbeRegistration {
    pub fn new(key: impl Into<ProbeKey>, probe: Arc<dyn Probe>) -> Self {
        Self {
            key: key.into(),
            probe,
            ttl: None,
            timeout: None,
            scoped: false,
            enabled: true,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tier(self, tier: CacheTier) -> Self {
        self.ttl(tier.ttl())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cache one entry per query scope
    pub fn scoped(mut self) -> Self {
        self.scoped = true;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Manager-level counters plus the cache's
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub queries: u64,
    pub probes_registered: usize,
    pub probes_enabled: usize,
    pub cache: CacheStats,
    /// Oldest first
    pub history: Vec<HistoryPoint>,
    pub health: HealthScore,
}

pub struct PerceptionManager {
    registry: Registry,
    cache: TieredCache<ProbeOutput, ProbeFailure>,
    limiter: Arc<Semaphore>,
    assembler: SnapshotAssembler,
    clock: Arc<dyn Clock>,
    config: PerceptionConfig,
    queries: AtomicU64,
    history: Mutex<History>,
}

impl PerceptionManager {
    pub fn new(config: PerceptionConfig) -> Result<Self> {
        Self::from_config(config, Arc::new(SystemClock))
    }

    pub fn from_config(config: PerceptionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let cache = TieredCache::new(Arc::clone(&clock), config.cache_options());
        Ok(Self {
            registry: Registry::new(),
            cache,
            limiter: Arc::new(Semaphore::new(config.max_in_flight)),
            assembler: SnapshotAssembler::new(),
            history: Mutex::new(History::new(clock.now())),
            clock,
            config,
            queries: AtomicU64::new(0),
        })
    }

    pub fn with_derived(mut self, field: DerivedField) -> Self {
        self.assembler.add(field);
        self
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    /// Register a global probe
    pub fn register(&self, key: impl Into<ProbeKey>, probe: Arc<dyn Probe>, ttl: Duration, enabled: bool) -> Result<()> {
        self.register_with(ProbeRegistration::new(key, probe).ttl(ttl).enabled(enabled))
    }

    /// Register a probe whose cache entries are kept per query scope
    pub fn register_scoped(&self, key: impl Into<ProbeKey>, probe: Arc<dyn Probe>, ttl: Duration) -> Result<()> {
        self.register_with(ProbeRegistration::new(key, probe).ttl(ttl).scoped())
    }

    pub fn register_with(&self, registration: ProbeRegistration) -> Result<()> {
        let ProbeRegistration {
            key,
            probe,
            ttl,
            timeout,
            scoped,
            enabled,
        } = registration;
        if !key.is_valid() {
            return Err(PerceptionError::InvalidKey(key.to_string()));
        }

        let settings = self.config.settings(key.as_str());
        let ttl = settings
            .and_then(|s| s.ttl())
            .or(ttl)
            .unwrap_or_else(|| self.config.default_ttl());
        let timeout = settings
            .and_then(|s| s.timeout())
            .or(timeout)
            .unwrap_or_else(|| self.config.probe_timeout());
        let enabled = settings.and_then(|s| s.enabled).unwrap_or(enabled);

        let adapter = ProbeAdapter::new(probe, timeout);
        let replaced = self
            .registry
            .insert(RegisteredProbe::new(key.clone(), adapter, ttl, scoped, enabled))
            .is_some();

        tracing::info!(
            probe = %key,
            ttl_secs = ttl.as_secs_f64(),
            timeout_ms = timeout.as_millis() as u64,
            scoped,
            enabled,
            replaced,
            "registered probe"
        );
        Ok(())
    }

    /// Takes effect for the next query. A refresh already running for the
    /// probe still completes and is cached.
    pub fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        if !self.registry.set_enabled(key, enabled) {
            return Err(PerceptionError::NotRegistered(ProbeKey::from(key)));
        }
        tracing::info!(probe = key, enabled, "probe toggled");
        Ok(())
    }

    pub fn is_enabled(&self, key: &str) -> Result<bool> {
        self.registry
            .get(key)
            .map(|probe| probe.is_enabled())
            .ok_or_else(|| PerceptionError::NotRegistered(ProbeKey::from(key)))
    }

    /// Re-apply per-probe settings to probes already registered.
    ///
    /// Only the `probes` section is honored; cache limits and the concurrency
    /// bound are fixed when the manager is built.
    pub fn apply_config(&self, config: &PerceptionConfig) -> Result<()> {
        config.validate()?;
        for (name, settings) in &config.probes {
            let Some(current) = self.registry.get(name) else {
                tracing::debug!(probe = %name, "settings for unregistered probe ignored");
                continue;
            };
            let adapter = match settings.timeout() {
                Some(timeout) => ProbeAdapter::new(current.adapter.probe(), timeout),
                None => current.adapter.clone(),
            };
            let updated = RegisteredProbe::new(
                current.key.clone(),
                adapter,
                settings.ttl().unwrap_or(current.ttl),
                current.scoped,
                settings.enabled.unwrap_or_else(|| current.is_enabled()),
            );
            self.registry.insert(updated);
            tracing::info!(probe = %name, "probe settings reapplied");
        }
        Ok(())
    }

    /// Resolve the given probes into one snapshot.
    ///
    /// Unknown keys are an error; disabled keys are skipped and listed in
    /// `Snapshot::disabled`. Duplicates are resolved once.
    pub async fn query<I, K>(&self, keys: I, ctx: &QueryContext) -> Result<Snapshot>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut probes = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            let probe = self
                .registry
                .get(key)
                .ok_or_else(|| PerceptionError::NotRegistered(ProbeKey::from(key)))?;
            probes.insert(probe.key.clone(), probe);
        }
        Ok(self.collect(probes.into_values().collect(), ctx).await)
    }

    /// Resolve every registered probe
    pub async fn query_all(&self, ctx: &QueryContext) -> Snapshot {
        self.collect(self.registry.all(), ctx).await
    }

    async fn collect(&self, probes: Vec<Arc<RegisteredProbe>>, ctx: &QueryContext) -> Snapshot {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let query_id = Uuid::new_v4();
        let taken_at = self.clock.wall();
        // A deadline too far out to represent means no deadline
        let deadline = Instant::now().checked_add(ctx.deadline.unwrap_or_else(|| self.config.query_timeout()));
        let scope = ctx.scope.as_deref();

        let span = tracing::debug_span!("perception_query", %query_id, scope = scope.unwrap_or("-"));
        async {
            let (enabled, disabled): (Vec<_>, Vec<_>) = probes.into_iter().partition(|probe| probe.is_enabled());
            let disabled: BTreeSet<ProbeKey> = disabled.into_iter().map(|probe| probe.key.clone()).collect();

            let resolved = join_all(enabled.into_iter().map(|probe| async move {
                let entry = self.resolve(&probe, scope, query_id, deadline).await;
                (probe.key.clone(), entry)
            }))
            .await;

            let snapshot = self.assembler.assemble(
                SnapshotMeta {
                    query_id,
                    scope: ctx.scope.clone(),
                    taken_at,
                },
                resolved,
                disabled,
            );
            tracing::debug!(
                entries = snapshot.len(),
                failures = snapshot.failures().count(),
                skipped = snapshot.disabled.len(),
                "snapshot assembled"
            );
            snapshot
        }
        .instrument(span)
        .await
    }

    async fn resolve(
        &self,
        probe: &RegisteredProbe,
        scope: Option<&str>,
        query_id: Uuid,
        deadline: Option<Instant>,
    ) -> SnapshotEntry {
        let cache_key = probe.cache_key(scope);
        let probe_ctx = ProbeContext {
            probe: probe.key.clone(),
            scope: if probe.scoped { scope.map(str::to_string) } else { None },
            query_id,
        };
        let adapter = probe.adapter.clone();
        let limiter = Arc::clone(&self.limiter);

        let lookup = self.cache.get_or_refresh(&cache_key, probe.ttl, move || async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|_| ProbeFailure::Error("probe limiter closed".to_string()))?;
            adapter.invoke(&probe_ctx).await
        });

        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, lookup).await,
            None => Ok(lookup.await),
        };
        match outcome {
            Ok(Ok(lookup)) => {
                if let Some(error) = &lookup.refresh_error {
                    tracing::warn!(
                        probe = %probe.key,
                        age_secs = lookup.age.as_secs_f64(),
                        error = %error,
                        "probe refresh failed, serving last known value"
                    );
                }
                SnapshotEntry::value(lookup.value, lookup.fresh, lookup.age, lookup.produced_wall)
            }
            Ok(Err(failure)) => {
                tracing::warn!(probe = %probe.key, error = %failure, "probe produced no value");
                SnapshotEntry::failure(failure)
            }
            Err(_) => match self.cache.peek(&cache_key) {
                Some(lookup) => {
                    tracing::warn!(probe = %probe.key, "query deadline reached, serving cached value");
                    SnapshotEntry::value(lookup.value, false, lookup.age, lookup.produced_wall)
                }
                None => {
                    tracing::warn!(probe = %probe.key, "query deadline reached with nothing cached");
                    SnapshotEntry::failure(ProbeFailure::Timeout)
                }
            },
        }
    }

    /// Drop the cached value of one probe. For scoped probes, `scope`
    /// selects which entry.
    pub fn invalidate(&self, key: &str, scope: Option<&str>) -> Result<bool> {
        let probe = self
            .registry
            .get(key)
            .ok_or_else(|| PerceptionError::NotRegistered(ProbeKey::from(key)))?;
        Ok(self.cache.invalidate(&probe.cache_key(scope)))
    }

    /// Drop every cached value belonging to `scope`, e.g. after new activity
    /// in that conversation. Returns how many entries were dropped.
    pub fn invalidate_scope(&self, scope: &str) -> usize {
        let dropped = self
            .cache
            .invalidate_where(|key| key.split_once('@').map_or(false, |(_, s)| s == scope));
        tracing::debug!(scope, dropped, "invalidated scope");
        dropped
    }

    pub fn probes(&self) -> Vec<ProbeInfo> {
        self.registry.list()
    }

    /// Append a point to the rolling history used by `stats().health`
    pub fn record_history(&self) -> HistoryPoint {
        let cache = self.cache.stats();
        let queries = self.queries.load(Ordering::Relaxed);
        let point = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(self.clock.now(), self.clock.wall(), queries, &cache);
        tracing::debug!(
            hit_rate = point.hit_rate,
            entries = point.cache_entries,
            queries_per_minute = point.queries_per_minute,
            "recorded history point"
        );
        point
    }

    pub fn stats(&self) -> ManagerStats {
        let probes = self.registry.all();
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner).points();
        ManagerStats {
            queries: self.queries.load(Ordering::Relaxed),
            probes_registered: probes.len(),
            probes_enabled: probes.iter().filter(|probe| probe.is_enabled()).count(),
            cache: self.cache.stats(),
            health: HealthScore::assess(&history, self.config.max_entries),
            history,
        }
    }
}
