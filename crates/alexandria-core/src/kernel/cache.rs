//! Keyed TTL Cache
//!
//! Bounded (LRU) cache over `<kind>:<id>[:<sub>]` string keys with per-kind
//! TTLs and wildcard pattern invalidation. Wraps hot reads: embeddings,
//! search results, graph neighborhoods, user profiles.
//!
//! Get/set are lock-cheap (single mutex over the LRU); invalidation is
//! best-effort and counts what it dropped.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::CacheTtls;
use crate::kernel::clock::Clock;

/// Cache counters for the monitoring surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups that returned a live entry
    pub hits: u64,
    /// Lookups that missed or hit an expired entry
    pub misses: u64,
    /// Entries dropped by pattern invalidation
    pub invalidations: u64,
    /// Current entry count (may include not-yet-expired stale entries)
    pub size: usize,
}

struct CacheEntry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Keyed TTL cache with pattern delete.
pub struct TtlCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttls: CacheTtls,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl TtlCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize, ttls: CacheTtls, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttls,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Store a value under `key` with the TTL configured for its kind prefix.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        let ttl = self.ttls.for_key(key);
        self.put_with_ttl(key, value, ttl);
    }

    /// Store a value with an explicit TTL in seconds.
    pub fn put_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        let expires_at = self.clock.now() + Duration::seconds(ttl_secs as i64);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.put(key.to_string(), CacheEntry { value, expires_at });
    }

    /// Fetch and deserialize a live entry. Expired entries count as misses
    /// and are dropped on access.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");

        let found = entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at > now));

        match found {
            Some((value, true)) => {
                drop(entries);
                self.hits.fetch_add(1, Ordering::Relaxed);
                serde_json::from_value(value).ok()
            }
            Some((_, false)) => {
                entries.pop(key);
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Drop one key. Returns true when it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let dropped = entries.pop(key).is_some();
        if dropped {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        dropped
    }

    /// Drop every key matching a `*`-wildcard pattern, e.g. `resource:{id}:*`
    /// or `search_query:*`. Returns the number of entries dropped.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let matching: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key_matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        self.invalidations
            .fetch_add(matching.len() as u64, Ordering::Relaxed);
        matching.len()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let size = self.entries.lock().expect("cache lock poisoned").len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size,
        }
    }
}

/// Match a key against a pattern where `*` spans any run of characters.
fn key_matches(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut remainder = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            // Anchored suffix
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

// ============================================================================
// TESTS
// ============================================================================
