//! Per-key TTL cache with single-flight refresh and stale fallback
//!
//! Every entry carries its own TTL. An expired entry is never dropped just
//! for being old: it stays around as last-known-good so a failed refresh can
//! still answer. Concurrent lookups of the same missing or expired key share
//! one refresh, which runs on its own task so callers that give up early do
//! not cancel it.

use crate::clock::Clock;
use crate::stats::{CacheStats, Counters};
use crate::tier::CacheTier;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Handed to waiters when a refresh task dies without settling
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("refresh task aborted before producing a result")]
pub struct Aborted;

/// A stored value and when it was produced
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub produced_at: Instant,
    pub produced_wall: DateTime<Utc>,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.produced_at)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        self.age(now) <= self.ttl
    }
}

/// The answer to a lookup
#[derive(Debug, Clone)]
pub struct Lookup<V, E> {
    pub value: V,
    pub fresh: bool,
    pub age: Duration,
    pub produced_wall: DateTime<Utc>,
    /// Present when a refresh failed and `value` is the last-known-good one
    pub refresh_error: Option<E>,
}

impl<V: Clone, E> Lookup<V, E> {
    fn from_entry(entry: &CacheEntry<V>, now: Instant, refresh_error: Option<E>) -> Self {
        Self {
            value: entry.value.clone(),
            fresh: refresh_error.is_none() && entry.is_fresh(now),
            age: entry.age(now),
            produced_wall: entry.produced_wall,
            refresh_error,
        }
    }
}

/// Cache limits
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// LRU-evict once more than this many keys are held
    pub max_entries: Option<usize>,
    /// How far past its TTL an entry may still be served as a fallback.
    /// `None` serves it regardless of age.
    pub max_staleness: Option<Duration>,
}

type Settled<V, E> = Result<CacheEntry<V>, E>;

struct Flight<V, E> {
    id: u64,
    rx: watch::Receiver<Option<Settled<V, E>>>,
}

struct Slot<V, E> {
    entry: Option<CacheEntry<V>>,
    flight: Option<Flight<V, E>>,
    last_access: u64,
}

impl<V, E> Slot<V, E> {
    fn empty(tick: u64) -> Self {
        Self {
            entry: None,
            flight: None,
            last_access: tick,
        }
    }
}

struct State<V, E> {
    slots: HashMap<String, Slot<V, E>>,
    tick: u64,
    next_flight: u64,
}

impl<V, E> State<V, E> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

struct Shared<V, E> {
    state: Mutex<State<V, E>>,
    clock: Arc<dyn Clock>,
    options: CacheOptions,
    counters: Counters,
}

impl<V, E> Shared<V, E> {
    fn lock(&self) -> MutexGuard<'_, State<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn servable(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        match self.options.max_staleness {
            Some(max) => entry.age(now) <= entry.ttl.saturating_add(max),
            None => true,
        }
    }

    /// Drop least-recently-used values until within capacity. Only keys
    /// holding a value count. Keys with a refresh in flight, and `keep`, are
    /// never chosen.
    fn evict_over_capacity(&self, state: &mut State<V, E>, keep: &str) {
        let Some(max) = self.options.max_entries else {
            return;
        };
        while state.slots.values().filter(|slot| slot.entry.is_some()).count() > max {
            let victim = state
                .slots
                .iter()
                .filter(|(k, slot)| k.as_str() != keep && slot.entry.is_some() && slot.flight.is_none())
                .min_by_key(|(_, slot)| slot.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    state.slots.remove(&k);
                    Counters::bump(&self.counters.evictions);
                    tracing::debug!(key = %k, "evicted least recently used cache key");
                }
                None => break,
            }
        }
    }
}

impl<V: Clone, E> Shared<V, E> {
    /// Record a finished refresh and clear its in-flight marker
    fn settle(&self, key: &str, flight_id: u64, ttl: Duration, result: Result<V, E>) -> Settled<V, E> {
        let mut state = self.lock();
        match result {
            Ok(value) => {
                let entry = CacheEntry {
                    key: key.to_string(),
                    value,
                    produced_at: self.clock.now(),
                    produced_wall: self.clock.wall(),
                    ttl,
                };
                let tick = state.next_tick();
                let slot = state
                    .slots
                    .entry(key.to_string())
                    .or_insert_with(|| Slot::empty(tick));
                slot.entry = Some(entry.clone());
                if slot.flight.as_ref().map(|f| f.id) == Some(flight_id) {
                    slot.flight = None;
                }
                self.evict_over_capacity(&mut state, key);
                Ok(entry)
            }
            Err(e) => {
                Counters::bump(&self.counters.failures);
                Self::end_flight(&mut state, key, flight_id);
                Err(e)
            }
        }
    }
}

impl<V, E> Shared<V, E> {
    /// Clear our in-flight marker. A slot left with neither a value nor a
    /// flight is removed.
    fn end_flight(state: &mut State<V, E>, key: &str, flight_id: u64) {
        let Some(slot) = state.slots.get_mut(key) else {
            return;
        };
        if slot.flight.as_ref().map(|f| f.id) == Some(flight_id) {
            slot.flight = None;
        }
        if slot.entry.is_none() && slot.flight.is_none() {
            state.slots.remove(key);
        }
    }
}

/// Owns the sending half of a flight. Dropping it without settling (the
/// refresh panicked) clears the in-flight marker before waiters wake.
struct FlightGuard<V, E> {
    shared: Arc<Shared<V, E>>,
    key: String,
    id: u64,
    tx: Option<watch::Sender<Option<Settled<V, E>>>>,
}

impl<V, E> Drop for FlightGuard<V, E> {
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        let mut state = self.shared.lock();
        Shared::<V, E>::end_flight(&mut state, &self.key, self.id);
        tracing::warn!(key = %self.key, "refresh task aborted");
    }
}

enum Plan<V, E> {
    Hit(Lookup<V, E>),
    Join(watch::Receiver<Option<Settled<V, E>>>),
    Lead {
        id: u64,
        tx: watch::Sender<Option<Settled<V, E>>>,
        rx: watch::Receiver<Option<Settled<V, E>>>,
    },
}

/// Key → entry store with per-entry TTLs.
///
/// Cheap to clone; clones share the same storage.
pub struct TieredCache<V, E> {
    shared: Arc<Shared<V, E>>,
}

impl<V, E> Clone for TieredCache<V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, E> TieredCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Aborted> + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, options: CacheOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slots: HashMap::new(),
                    tick: 0,
                    next_flight: 0,
                }),
                clock,
                options,
                counters: Counters::default(),
            }),
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.shared.options
    }

    /// Return the fresh entry for `key`, or run `refresh` to produce one.
    ///
    /// Concurrent callers for the same stale key share a single `refresh`.
    /// If the refresh fails and an older entry is still within the staleness
    /// bound, that entry is returned with `fresh == false`.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, ttl: Duration, refresh: F) -> Result<Lookup<V, E>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = &self.shared;
        let plan = {
            let mut state = shared.lock();
            let now = shared.clock.now();
            let tick = state.next_tick();
            let slot = state
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Slot::empty(tick));
            slot.last_access = tick;

            let hit = slot
                .entry
                .as_ref()
                .filter(|entry| entry.is_fresh(now))
                .map(|entry| (Lookup::from_entry(entry, now, None), CacheTier::for_ttl(entry.ttl)));
            let joined = slot.flight.as_ref().map(|flight| flight.rx.clone());

            if let Some((lookup, tier)) = hit {
                Counters::bump(&shared.counters.hits);
                shared.counters.bump_tier(tier);
                Plan::Hit(lookup)
            } else if let Some(rx) = joined {
                Counters::bump(&shared.counters.misses);
                Counters::bump(&shared.counters.coalesced);
                Plan::Join(rx)
            } else {
                Counters::bump(&shared.counters.misses);
                Counters::bump(&shared.counters.refreshes);
                let (tx, rx) = watch::channel(None);
                let id = state.next_flight;
                state.next_flight += 1;
                if let Some(slot) = state.slots.get_mut(key) {
                    slot.flight = Some(Flight { id, rx: rx.clone() });
                }
                Plan::Lead { id, tx, rx }
            }
        };

        let mut rx = match plan {
            Plan::Hit(lookup) => {
                tracing::trace!(key, "cache hit");
                return Ok(lookup);
            }
            Plan::Join(rx) => {
                tracing::debug!(key, "joining in-flight refresh");
                rx
            }
            Plan::Lead { id, tx, rx } => {
                tracing::debug!(key, ttl_secs = ttl.as_secs_f64(), "starting refresh");
                self.spawn_refresh(key.to_string(), id, ttl, tx, refresh());
                rx
            }
        };

        let settled = rx.wait_for(|s| s.is_some()).await.ok().and_then(|s| s.clone());
        let outcome = settled.unwrap_or_else(|| Err(E::from(Aborted)));

        match outcome {
            Ok(entry) => Ok(Lookup::from_entry(&entry, shared.clock.now(), None)),
            Err(e) => self.stale_fallback(key, e),
        }
    }

    fn spawn_refresh<Fut>(
        &self,
        key: String,
        id: u64,
        ttl: Duration,
        tx: watch::Sender<Option<Settled<V, E>>>,
        refresh: Fut,
    ) where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut guard = FlightGuard {
                shared: Arc::clone(&shared),
                key,
                id,
                tx: Some(tx),
            };
            let result = refresh.await;
            let settled = shared.settle(&guard.key, id, ttl, result);
            if let Some(tx) = guard.tx.take() {
                tx.send_replace(Some(settled));
            }
        });
    }

    fn stale_fallback(&self, key: &str, error: E) -> Result<Lookup<V, E>, E> {
        let shared = &self.shared;
        let state = shared.lock();
        let now = shared.clock.now();
        match state.slots.get(key).and_then(|slot| slot.entry.as_ref()) {
            Some(entry) if shared.servable(entry, now) => {
                Counters::bump(&shared.counters.stale_hits);
                tracing::debug!(key, age_secs = entry.age(now).as_secs_f64(), "serving last-known-good value");
                Ok(Lookup::from_entry(entry, now, Some(error)))
            }
            _ => Err(error),
        }
    }

    /// Read without refreshing. Expired entries are returned with
    /// `fresh == false` as long as they are within the staleness bound.
    pub fn peek(&self, key: &str) -> Option<Lookup<V, E>> {
        let shared = &self.shared;
        let state = shared.lock();
        let now = shared.clock.now();
        let entry = state.slots.get(key)?.entry.as_ref()?;
        if entry.is_fresh(now) || shared.servable(entry, now) {
            Some(Lookup::from_entry(entry, now, None))
        } else {
            None
        }
    }

    /// Whether a refresh for `key` is currently running
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.shared
            .lock()
            .slots
            .get(key)
            .map_or(false, |slot| slot.flight.is_some())
    }

    /// Forget the stored value for `key`. A running refresh still lands.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.shared.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return false;
        };
        let had_entry = slot.entry.take().is_some();
        if slot.flight.is_none() {
            state.slots.remove(key);
        }
        had_entry
    }

    /// Forget every stored value whose key matches. Returns how many were dropped.
    pub fn invalidate_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut state = self.shared.lock();
        let mut dropped = 0;
        state.slots.retain(|key, slot| {
            if !predicate(key) {
                return true;
            }
            if slot.entry.take().is_some() {
                dropped += 1;
            }
            slot.flight.is_some()
        });
        dropped
    }

    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.slots.retain(|_, slot| {
            slot.entry = None;
            slot.flight.is_some()
        });
    }

    /// Number of keys holding a value
    pub fn len(&self) -> usize {
        self.shared
            .lock()
            .slots
            .values()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.counters.snapshot(self.len())
    }
}
