//! TTL + capacity cache.
//!
//! [`TtlCache`] is a keyed store where every entry expires after a per-entry
//! TTL and an optional capacity bound evicts the oldest-inserted key (FIFO,
//! not an LRU). Expiry is not timer-driven: a min-heap of
//! `(expires_at, generation, key)` is swept against the injected [`Clock`] at
//! the top of every operation, so tests advance a [`ManualClock`] instead of
//! sleeping and production pays for expiry only when the cache is touched.
//! Re-setting a key bumps its generation, which invalidates any older heap
//! entry for that key; that is the analogue of cancelling its expiry timer.
//!
//! [`FetchCache`] layers an async loader on top for fetch-on-miss use.
//!
//! [`ManualClock`]: crate::clock::ManualClock

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::clock::{Clock, MonotonicClock};
use crate::error::StageError;

/// Default entry TTL: one hour.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Explicit `delete` call.
    Requested,
    /// The entry's TTL elapsed.
    TtlExpired,
    /// The entry was the oldest key when capacity was exceeded.
    CapacityExceeded,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RemovalReason::Requested => "Requested",
            RemovalReason::TtlExpired => "TTL expired",
            RemovalReason::CapacityExceeded => "Capacity exceeded",
        };
        f.write_str(text)
    }
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit TTL.
    pub ttl: Duration,
    /// Maximum entry count; `None` means unbounded. `Some(0)` is valid and
    /// evicts every insert immediately (the cache stays empty).
    pub capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL, capacity: None }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Mutation and lookup counters. Cleared only by dropping the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub adds: u64,
    pub updates: u64,
    pub deletes: u64,
    pub expirations: u64,
    pub capacity_evictions: u64,
    pub clears: u64,
}

type KeyCallback = Box<dyn Fn(&str) + Send + Sync>;
type RemovalCallback = Box<dyn Fn(&str, RemovalReason) + Send + Sync>;
type ClearCallback = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_key_add: Option<KeyCallback>,
    on_key_update: Option<KeyCallback>,
    on_key_expire: Option<KeyCallback>,
    on_key_delete: Option<RemovalCallback>,
    on_capacity_exceeded: Option<KeyCallback>,
    on_clear: Option<ClearCallback>,
}

struct Entry<T> {
    value: T,
    /// Monotonic insertion sequence; preserved across updates so FIFO
    /// eviction tracks first insertion, not last write.
    inserted_seq: u64,
    expires_at: u64,
    generation: u64,
}

/// Keyed store with per-entry TTL and optional FIFO capacity eviction.
///
/// Single-owner (`&mut self`); shared use goes through the lock of whatever
/// owns the cache, as [`ThrottleStore`] does.
///
/// [`ThrottleStore`]: crate::throttle::ThrottleStore
pub struct TtlCache<T> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: HashMap<String, Entry<T>>,
    /// FIFO insertion order; stale pairs (seq no longer live) are skipped
    /// lazily during eviction scans.
    insertion: VecDeque<(u64, String)>,
    /// Pending expirations; stale pairs are skipped when popped.
    expiry: BinaryHeap<Reverse<(u64, u64, String)>>,
    next_seq: u64,
    next_generation: u64,
    callbacks: Callbacks,
    stats: CacheStats,
}

impl<T> TtlCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            entries: HashMap::new(),
            insertion: VecDeque::new(),
            expiry: BinaryHeap::new(),
            next_seq: 0,
            next_generation: 0,
            callbacks: Callbacks::default(),
            stats: CacheStats::default(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_key_add(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_key_add = Some(Box::new(f));
        self
    }

    pub fn on_key_update(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_key_update = Some(Box::new(f));
        self
    }

    pub fn on_key_expire(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_key_expire = Some(Box::new(f));
        self
    }

    pub fn on_key_delete(mut self, f: impl Fn(&str, RemovalReason) + Send + Sync + 'static) -> Self {
        self.callbacks.on_key_delete = Some(Box::new(f));
        self
    }

    pub fn on_capacity_exceeded(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_capacity_exceeded = Some(Box::new(f));
        self
    }

    pub fn on_clear(mut self, f: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.callbacks.on_clear = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Live entry count (expired-but-unswept entries excluded).
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries.values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical presence check; does not touch hit/miss counters.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries.get(key).is_some_and(|e| e.expires_at > now)
    }

    /// Insert or update with the configured default TTL.
    pub fn set(&mut self, key: impl Into<String>, value: T) {
        let ttl = self.config.ttl;
        self.set_with_ttl(key, value, ttl);
    }

    /// Insert or update, (re)arming the entry's expiry for `ttl` from now.
    pub fn set_with_ttl(&mut self, key: impl Into<String>, value: T, ttl: Duration) {
        self.sweep();
        let key = key.into();
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let generation = self.next_generation;
        self.next_generation += 1;

        let existed = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.expires_at = expires_at;
                entry.generation = generation;
                true
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries.insert(
                    key.clone(),
                    Entry { value, inserted_seq: seq, expires_at, generation },
                );
                self.insertion.push_back((seq, key.clone()));
                false
            }
        };
        self.expiry.push(Reverse((expires_at, generation, key.clone())));

        if let Some(capacity) = self.config.capacity {
            if self.entries.len() > capacity {
                self.evict_oldest();
            }
        }

        if existed {
            self.stats.updates += 1;
            if let Some(cb) = &self.callbacks.on_key_update {
                cb(&key);
            }
        } else {
            self.stats.adds += 1;
            if let Some(cb) = &self.callbacks.on_key_add {
                cb(&key);
            }
        }
    }

    /// Look up a key, counting a hit or miss.
    pub fn get(&mut self, key: &str) -> Option<&T> {
        self.sweep();
        if self.entries.contains_key(key) {
            self.stats.hits += 1;
            self.entries.get(key).map(|e| &e.value)
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Look up a key without counting or sweeping.
    pub fn peek(&self, key: &str) -> Option<&T> {
        let now = self.clock.now_millis();
        self.entries.get(key).filter(|e| e.expires_at > now).map(|e| &e.value)
    }

    /// Remove a key. Returns `false` (and fires nothing) if absent.
    pub fn delete(&mut self, key: &str, reason: RemovalReason) -> bool {
        self.sweep();
        self.remove_entry(key, reason)
    }

    /// Re-arm an existing key's expiry for `ttl` from now. Returns presence.
    pub fn set_key_ttl(&mut self, key: &str, ttl: Duration) -> bool {
        self.sweep();
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let generation = self.next_generation;
        self.next_generation += 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                entry.generation = generation;
                self.expiry.push(Reverse((expires_at, generation, key.to_string())));
                true
            }
            None => false,
        }
    }

    /// Drop every entry and pending expiration in one step.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.insertion.clear();
        self.expiry.clear();
        self.stats.clears += 1;
        tracing::debug!(count, "cache cleared");
        if let Some(cb) = &self.callbacks.on_clear {
            cb(count);
        }
    }

    pub fn get_many(&mut self, keys: &[&str]) -> Vec<Option<T>>
    where
        T: Clone,
    {
        keys.iter().map(|key| self.get(key).cloned()).collect()
    }

    pub fn set_many(&mut self, pairs: Vec<(String, T)>) {
        let ttl = self.config.ttl;
        self.set_many_with_ttl(pairs, ttl);
    }

    pub fn set_many_with_ttl(&mut self, pairs: Vec<(String, T)>, ttl: Duration) {
        for (key, value) in pairs {
            self.set_with_ttl(key, value, ttl);
        }
    }

    pub fn delete_many(&mut self, keys: &[&str], reason: RemovalReason) -> Vec<bool> {
        keys.iter().map(|key| self.delete(key, reason)).collect()
    }

    /// Process every expiration due at the current clock reading.
    ///
    /// Called internally by every operation; exposed so an idle cache can be
    /// drained on an external tick.
    pub fn purge_expired(&mut self) {
        self.sweep();
    }

    fn sweep(&mut self) {
        let now = self.clock.now_millis();
        while let Some(Reverse((expires_at, _, _))) = self.expiry.peek() {
            if *expires_at > now {
                break;
            }
            let Some(Reverse((_, generation, key))) = self.expiry.pop() else {
                break;
            };
            let live = self.entries.get(&key).is_some_and(|e| e.generation == generation);
            if live {
                self.expire_key(&key);
            }
        }
    }

    fn expire_key(&mut self, key: &str) {
        self.stats.expirations += 1;
        if let Some(cb) = &self.callbacks.on_key_expire {
            cb(key);
        }
        self.remove_entry(key, RemovalReason::TtlExpired);
    }

    fn evict_oldest(&mut self) {
        while let Some((seq, key)) = self.insertion.front().cloned() {
            let live = self.entries.get(&key).is_some_and(|e| e.inserted_seq == seq);
            self.insertion.pop_front();
            if !live {
                continue;
            }
            self.stats.capacity_evictions += 1;
            tracing::debug!(key = %key, "cache capacity exceeded, evicting oldest key");
            if let Some(cb) = &self.callbacks.on_capacity_exceeded {
                cb(&key);
            }
            self.remove_entry(&key, RemovalReason::CapacityExceeded);
            break;
        }
    }

    fn remove_entry(&mut self, key: &str, reason: RemovalReason) -> bool {
        if self.entries.remove(key).is_some() {
            self.stats.deletes += 1;
            if let Some(cb) = &self.callbacks.on_key_delete {
                cb(key, reason);
            }
            true
        } else {
            false
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// FetchCache
// ============================================================================

/// Error from a [`FetchCache`] loader.
pub type FetchError = StageError;

type Loader<T> = Box<dyn Fn(String) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;
type FetchTimingCallback = Box<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct FetchTotals {
    successes: u64,
    failures: u64,
    total_ms: u64,
    lowest_ms: Option<u64>,
    highest_ms: Option<u64>,
}

/// Loader timing and outcome counters for a [`FetchCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchStats {
    /// Loader invocations that resolved a value.
    pub successes: u64,
    /// Loader invocations that failed.
    pub failures: u64,
    pub total_ms: u64,
    pub lowest_ms: Option<u64>,
    pub highest_ms: Option<u64>,
    /// Mean loader runtime over all invocations.
    pub average_ms: Option<f64>,
}

/// Fetch-on-miss wrapper around [`TtlCache`].
///
/// The miss path (lookup, load, store) runs under one async mutex, so two
/// concurrent misses for the same key resolve to a single loader call
/// followed by a hit. The lock is held across the loader's `await`; loaders
/// are expected to be short-lived fetches.
pub struct FetchCache<T> {
    cache: tokio::sync::Mutex<TtlCache<T>>,
    loader: Loader<T>,
    clock: Arc<dyn Clock>,
    totals: std::sync::Mutex<FetchTotals>,
    on_fetch: Option<KeyCallback>,
    on_fetch_success: Option<FetchTimingCallback>,
    on_fetch_error: Option<FetchTimingCallback>,
}

impl<T: Clone + Send> FetchCache<T> {
    pub fn new<F, Fut>(config: CacheConfig, loader: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Self {
            cache: tokio::sync::Mutex::new(TtlCache::new(config).with_clock(Arc::clone(&clock))),
            loader: Box::new(move |key| Box::pin(loader(key))),
            clock,
            totals: std::sync::Mutex::new(FetchTotals::default()),
            on_fetch: None,
            on_fetch_success: None,
            on_fetch_error: None,
        }
    }

    /// Override the clock for both loader timing and entry expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Arc::clone(&clock);
        self.cache = tokio::sync::Mutex::new(
            std::mem::replace(
                self.cache.get_mut(),
                TtlCache::new(CacheConfig::default()),
            )
            .with_clock(clock),
        );
        self
    }

    /// Called when a miss is about to invoke the loader.
    pub fn on_fetch(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_fetch = Some(Box::new(f));
        self
    }

    /// Called with the loader runtime (ms) after a successful load.
    pub fn on_fetch_success(mut self, f: impl Fn(&str, u64) + Send + Sync + 'static) -> Self {
        self.on_fetch_success = Some(Box::new(f));
        self
    }

    /// Called with the loader runtime (ms) after a failed load.
    pub fn on_fetch_error(mut self, f: impl Fn(&str, u64) + Send + Sync + 'static) -> Self {
        self.on_fetch_error = Some(Box::new(f));
        self
    }

    /// Return the cached value, or run the loader and cache its result.
    pub async fn get_or_fetch(&self, key: &str) -> Result<T, FetchError> {
        let mut cache = self.cache.lock().await;
        if let Some(value) = cache.get(key) {
            return Ok(value.clone());
        }

        if let Some(cb) = &self.on_fetch {
            cb(key);
        }
        let start = self.clock.now_millis();
        let outcome = (self.loader)(key.to_string()).await;
        let elapsed = self.clock.now_millis().saturating_sub(start);
        self.record_fetch(elapsed, outcome.is_ok());

        match outcome {
            Ok(value) => {
                if let Some(cb) = &self.on_fetch_success {
                    cb(key, elapsed);
                }
                cache.set(key, value.clone());
                Ok(value)
            }
            Err(err) => {
                if let Some(cb) = &self.on_fetch_error {
                    cb(key, elapsed);
                }
                tracing::debug!(key = %key, error = %err, "fetch loader failed");
                Err(err)
            }
        }
    }

    pub async fn get_many_or_fetch(&self, keys: &[&str]) -> Vec<Result<T, FetchError>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get_or_fetch(key).await);
        }
        results
    }

    /// Hit/miss/mutation counters of the underlying cache.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.lock().await.stats()
    }

    pub fn fetch_stats(&self) -> FetchStats {
        let totals = self.totals.lock().unwrap();
        let attempts = totals.successes + totals.failures;
        FetchStats {
            successes: totals.successes,
            failures: totals.failures,
            total_ms: totals.total_ms,
            lowest_ms: totals.lowest_ms,
            highest_ms: totals.highest_ms,
            average_ms: if attempts == 0 {
                None
            } else {
                Some(totals.total_ms as f64 / attempts as f64)
            },
        }
    }

    fn record_fetch(&self, elapsed: u64, success: bool) {
        let mut totals = self.totals.lock().unwrap();
        if success {
            totals.successes += 1;
        } else {
            totals.failures += 1;
        }
        totals.total_ms += elapsed;
        totals.lowest_ms = Some(totals.lowest_ms.map_or(elapsed, |low| low.min(elapsed)));
        totals.highest_ms = Some(totals.highest_ms.map_or(elapsed, |high| high.max(elapsed)));
    }
}
