//! Response Cache with TTL and LRU Eviction
//!
//! Memoizes successful results of idempotent calls. Properties:
//!
//! - **Capacity bound**: never more than `max_entries`; inserting a new key
//!   into a full cache evicts exactly the least recently used entry
//! - **Lazy expiry**: TTL is checked on access; an expired entry reads as a
//!   miss but stays resident so it can be served as a stale fallback
//! - **Sweeping**: an optional background task drops entries that expired
//!   more than `stale_grace` ago
//! - **Last writer wins** for concurrent `set` on the same key
//!
//! # Key Normalization
//!
//! A [`CacheKey`] is the hex SHA-256 of `category \0 method \0 params`, where
//! params are rendered as canonical JSON: object keys sorted recursively and
//! every string trimmed with internal whitespace runs collapsed to a single
//! space. `{"sql": "SELECT  1 "}` and `{"sql":"SELECT 1"}` share a key.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::registry::{method_matches, Category};

/// Smallest TTL accepted; keeps `expires_at > created_at`
const MIN_TTL: Duration = Duration::from_millis(1);

// ============================================================================
// Cache Key
// ============================================================================

/// Deterministic key for a `(category, method, params)` triple
#[derive(Clone, Debug)]
pub struct CacheKey {
    digest: String,
    category: Category,
    method: String,
}

impl CacheKey {
    /// Build the key for a call
    #[must_use]
    pub fn new(category: Category, method: &str, params: &Value) -> Self {
        let canonical = normalize_params(params).to_string();

        let mut hasher = Sha256::new();
        hasher.update(category.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(method.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());

        Self {
            digest: hex::encode(hasher.finalize()),
            category,
            method: method.to_string(),
        }
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.digest
    }

    /// Method this key was built for
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Category this key was built for
    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for CacheKey {}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

/// Canonical form of call parameters
#[must_use]
pub fn normalize_params(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in fields {
                sorted.insert(key.clone(), normalize_params(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_params).collect()),
        Value::String(s) => Value::String(s.split_whitespace().collect::<Vec<_>>().join(" ")),
        other => other.clone(),
    }
}

// ============================================================================
// Configuration / Stats
// ============================================================================

/// Cache configuration
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Capacity bound
    pub max_entries: usize,
    /// TTL used by [`CacheLayer::set`]
    pub default_ttl: Duration,
    /// Background sweep period, `None` disables the sweeper
    pub sweep_interval: Option<Duration>,
    /// How long an expired entry stays available for stale-on-error
    pub stale_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Some(Duration::from_secs(60)),
            stale_grace: Duration::from_secs(600),
        }
    }
}

/// Point-in-time cache statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Resident entries (fresh and expired)
    pub total_entries: usize,
    /// Capacity bound
    pub max_entries: usize,
    /// Fresh hits
    pub hits: u64,
    /// Misses, including expired reads
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 before any lookup
    pub hit_rate: f64,
    /// Entries dropped to make room
    pub eviction_count: u64,
    /// Entries dropped by the sweeper
    pub expired_count: u64,
}

struct CacheEntry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

// ============================================================================
// Cache Layer
// ============================================================================

/// Bounded TTL cache shared by all dispatch calls
///
/// One lock guards the whole store so eviction follows a single global
/// recency order. Lookups and writes are O(1) under the lock, and no
/// lock spans an `.await`.
pub struct CacheLayer {
    config: CacheConfig,
    store: Mutex<LruCache<CacheKey, CacheEntry>>,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheLayer {
    /// Create a cache
    #[must_use]
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            store: Mutex::new(LruCache::unbounded()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh value for `key`, counting a hit or a miss
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();
        let mut store = self.store.lock();

        let fresh = store.peek(key).map(|entry| entry.expires_at > now);
        match fresh {
            Some(true) => {
                let entry = store.get_mut(key)?;
                entry.hit_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Any resident value for `key`, ignoring TTL
    ///
    /// Does not touch recency or any counter; stale serves are counted by
    /// the metrics aggregator.
    pub fn get_stale(&self, key: &CacheKey) -> Option<Value> {
        self.store.lock().peek(key).map(|entry| entry.value.clone())
    }

    /// Number of fresh reads served for `key`
    pub fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        self.store.lock().peek(key).map(|entry| entry.hit_count)
    }

    /// Store with the default TTL
    pub fn set(&self, key: CacheKey, value: Value) {
        self.set_with_ttl(key, value, self.config.default_ttl);
    }

    /// Store with an explicit TTL
    pub fn set_with_ttl(&self, key: CacheKey, value: Value, ttl: Duration) {
        if self.config.max_entries == 0 {
            return;
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl.max(MIN_TTL),
            hit_count: 0,
        };

        let mut store = self.store.lock();
        if !store.contains(&key) && store.len() >= self.config.max_entries {
            if let Some((evicted, _)) = store.pop_lru() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(method = evicted.method(), "Evicted least recently used cache entry");
            }
        }
        store.put(key, entry);
    }

    /// Drop entries whose method (or category label) matches `pattern`
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut store = self.store.lock();
        let doomed: Vec<CacheKey> = store
            .iter()
            .filter(|(key, _)| {
                method_matches(pattern, key.method()) || pattern == key.category().as_str()
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            store.pop(key);
        }
        doomed.len()
    }

    /// Remove entries expired for longer than the stale grace window
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let grace = self.config.stale_grace;
        let mut store = self.store.lock();

        let doomed: Vec<CacheKey> = store
            .iter()
            .filter(|(_, entry)| entry.expires_at + grace <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            store.pop(key);
        }
        self.expirations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    /// Start the periodic sweep task if configured
    ///
    /// Holds only a weak reference, so dropping the cache ends the task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let Some(period) = self.config.sweep_interval else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Release every entry and stop the sweeper
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.store.lock().clear();
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            total_entries: self.store.lock().len(),
            max_entries: self.config.max_entries,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            eviction_count: self.evictions.load(Ordering::Relaxed),
            expired_count: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Age of the entry for `key`
    pub fn age(&self, key: &CacheKey) -> Option<Duration> {
        let now = self.clock.now();
        self.store
            .lock()
            .peek(key)
            .map(|entry| now.saturating_duration_since(entry.created_at))
    }
}

impl Drop for CacheLayer {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
