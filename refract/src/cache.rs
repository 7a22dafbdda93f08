//! In-memory derivative cache with LRU eviction and per-entry TTL.
//!
//! Freshly produced derivatives land here before the asynchronous storage
//! write-back finishes, so collapsed waiters and follow-up requests can be
//! served without touching the backend. Entries hold fully buffered,
//! detached responses; reads hand out copies.

use crate::response::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    response: Response,
    expires_at: Instant,
    last_accessed: Instant,
}

/// Count-bounded cache of produced derivatives.
pub struct DerivativeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DerivativeCache {
    /// Creates a cache holding at most `capacity` entries. A zero capacity
    /// disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns a detached copy of the cached response, if present and not
    /// expired. Expired entries are reaped on access.
    pub fn get(&self, key: &str) -> Option<Response> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at <= now => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                entry.last_accessed = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.response.copy())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a response under `key` for `ttl`. The response should already
    /// be a detached copy; the cache never hands out the stored instance
    /// itself.
    pub fn set(&self, key: &str, response: Response, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        // Reap expired entries before considering eviction.
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() >= self.capacity && !entries.contains_key(key) {
            self.evict_lru(&mut entries);
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                response,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Removes least-recently-accessed entries until one slot is free.
    fn evict_lru(&self, entries: &mut HashMap<String, CacheEntry>) {
        while entries.len() >= self.capacity {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone())
            else {
                return;
            };
            entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Hit/miss/eviction counters.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}
