//! Bounded, TTL-aware memoization of extraction payloads.
//!
//! Entries are immutable once written; a second `put` for the same key
//! replaces the entry and moves it to the back of the eviction queue.
//! Eviction order is FIFO by most recent write, which keeps it
//! deterministic for a given sequence of operations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Configuration for the result cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied by [`ResultCache::put_default`].
    pub default_ttl: Duration,

    /// Maximum number of live entries.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    /// 10 minute TTL, 500 entries.
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(600),
            max_entries: 500,
        }
    }
}

/// One memoized payload. `expires_at` is `None` when the TTL does not fit
/// the clock, which keeps the entry until it is evicted or invalidated.
#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    payload: serde_json::Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Snapshot of cache counters for reporting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Write order, oldest first. Holds exactly the keys of `entries`.
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Thread-safe result cache guarded by a single mutex.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned cache mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the payload for `key` if present and not expired.
    ///
    /// Expired entries are removed on the spot and count as a miss.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut inner = self.lock_inner();

        let lookup = inner
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(now), entry.payload.clone()));

        match lookup {
            Some((false, payload)) => {
                inner.hits += 1;
                Some(payload)
            }
            Some((true, _)) => {
                inner.remove(key);
                inner.misses += 1;
                tracing::debug!(key = %short_key(key), "Cache entry expired");
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Stores `payload` under `key` for `ttl`.
    pub fn put(&self, key: impl Into<String>, payload: serde_json::Value, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.lock_inner();

        // Overwrite supersedes the old entry rather than mutating it.
        inner.remove(&key);

        if inner.entries.len() >= self.config.max_entries {
            let purged = inner.purge_expired(now);
            inner.evictions += purged as u64;
        }
        while inner.entries.len() >= self.config.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.evictions += 1;
            tracing::debug!(key = %short_key(&oldest), "Evicted oldest cache entry");
        }

        if self.config.max_entries == 0 {
            return;
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                payload,
                expires_at: now.checked_add(ttl),
            },
        );
    }

    /// Stores `payload` with the configured default TTL.
    pub fn put_default(&self, key: impl Into<String>, payload: serde_json::Value) {
        self.put(key, payload, self.config.default_ttl);
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock_inner()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock_inner().remove(key).is_some()
    }

    /// Number of stored entries, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock_inner();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_entries: self.config.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn short_key(key: &str) -> String {
    key.chars().take(12).collect()
}
