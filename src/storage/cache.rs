//! In-memory read-through cache for query results.
//!
//! Entries are keyed by normalized SQL plus the ordered parameter values and
//! expire after a per-entry TTL. Expired entries are dropped lazily on lookup
//! and by a periodic sweep. When the entry count exceeds the configured cap,
//! the oldest inserted entry is evicted. Lookups use `peek`, so hits never
//! refresh an entry's position.
//!
//! The cache is write-never: nothing invalidates an entry when the rows
//! behind it change. Callers choose a TTL that matches their staleness
//! tolerance, or pass a zero TTL to bypass the cache for one call.

use super::sqlite::acquire_lock;
use crate::Result;
use lru::LruCache;
use rusqlite::types::Value;
use serde::Serialize;
use std::fmt::Write as _;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Rows returned by a cached query, one `Vec<Value>` per row.
pub type CachedRows = Vec<Vec<Value>>;

/// Deterministic key for a query and its parameters.
///
/// SQL whitespace is collapsed so formatting differences share an entry.
/// Every component is length-prefixed and every parameter is tagged with its
/// type, so `Integer(1)` and `Text("1")`, or `["a,b"]` and `["a", "b"]`,
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds a key from SQL text and ordered parameter values.
    #[must_use]
    pub fn new(sql: &str, params: &[Value]) -> Self {
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut key = String::with_capacity(normalized.len() + params.len() * 16);
        let _ = write!(key, "{}:{normalized}", normalized.len());
        for param in params {
            let _ = match param {
                Value::Null => write!(key, "|n"),
                Value::Integer(i) => write!(key, "|i{i}"),
                Value::Real(r) => write!(key, "|r{:016x}", r.to_bits()),
                Value::Text(t) => write!(key, "|t{}:{t}", t.len()),
                Value::Blob(b) => {
                    let _ = write!(key, "|b{}:", b.len());
                    b.iter().try_for_each(|byte| write!(key, "{byte:02x}"))
                },
            };
        }
        Self(key)
    }

    /// Returns the serialized key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cache tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL callers use when they have no better value.
    pub default_ttl: Duration,
    /// Entry cap; the oldest inserted entry is evicted beyond it.
    pub max_entries: usize,
    /// Period of the expired-entry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 256,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from a live entry.
    pub hits: u64,
    /// Lookups that ran the compute function.
    pub misses: u64,
    /// Entries dropped for capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries currently stored.
    pub entries: usize,
}

struct CacheEntry {
    rows: Arc<CachedRows>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Read-through query result cache.
pub struct QueryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueryCache {
    /// Creates an empty cache. A `max_entries` of zero is treated as one.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the default TTL.
    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Returns the cached rows for `key`, or runs `compute` and stores its
    /// result for `ttl`.
    ///
    /// A zero `ttl` bypasses the cache entirely. Concurrent misses on the
    /// same key each run `compute`; the last result stored wins.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `compute`. Errors are never cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<Arc<CachedRows>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedRows>>,
    {
        if ttl.is_zero() {
            return compute().await.map(Arc::new);
        }

        if let Some(rows) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("query_cache_hits_total").increment(1);
            return Ok(rows);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("query_cache_misses_total").increment(1);
        let rows = Arc::new(compute().await?);
        self.insert(key.clone(), Arc::clone(&rows), ttl);
        Ok(rows)
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<CachedRows>> {
        let mut entries = acquire_lock(&self.entries);
        let now = Instant::now();
        match entries.peek(key) {
            Some(entry) if !entry.is_expired(now) => Some(Arc::clone(&entry.rows)),
            Some(_) => {
                entries.pop(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                None
            },
            None => None,
        }
    }

    fn insert(&self, key: CacheKey, rows: Arc<CachedRows>, ttl: Duration) {
        let entry = CacheEntry {
            rows,
            inserted_at: Instant::now(),
            ttl,
        };
        let mut entries = acquire_lock(&self.entries);
        // An existing entry for the key is replaced outright so the
        // replacement counts as the newest insertion.
        entries.pop(&key);
        if let Some((evicted, _)) = entries.push(key, entry) {
            tracing::trace!(key = %evicted.as_str(), "Evicted oldest cache entry");
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("query_cache_evictions_total").increment(1);
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = acquire_lock(&self.entries);
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        drop(entries);

        let purged = expired.len();
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Spawns the periodic expired-entry sweep.
    ///
    /// The task holds a weak reference and exits when the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = cache.len(), "Swept expired cache entries");
                }
            }
        })
    }

    /// Returns the number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.entries).len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
