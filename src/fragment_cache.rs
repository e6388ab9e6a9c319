//! TTL cache for fetched fragments
//!
//! Consulted by the resolver before fetching when a tag has a non-zero TTL.
//! Entries are keyed by the rendered resource URL (plus key, if any) and
//! evicted least-recently-used first once the byte budget is exceeded.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Storage for fetched fragment bodies
pub trait FragmentCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;

    fn put(&self, key: &str, data: Bytes, ttl: Duration);

    fn remove(&self, key: &str) -> bool;

    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

/// Build the cache key for a rendered resource
pub fn fragment_key(url: &str, key: Option<&str>) -> String {
    match key {
        Some(k) => format!("{}#{}", url, k),
        None => url.to_string(),
    }
}

struct CacheEntry {
    data: Bytes,
    expires_at: Instant,
    last_accessed: Instant,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    size_bytes: usize,
}

/// In-memory [`FragmentCache`] with per-entry TTL and an LRU byte budget
pub struct MemoryFragmentCache {
    inner: RwLock<Inner>,
    max_size_bytes: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryFragmentCache {
    /// Unbounded cache
    pub fn new() -> Self {
        MemoryFragmentCache {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                size_bytes: 0,
            }),
            max_size_bytes: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache that evicts LRU entries to stay under `max_size_bytes`
    pub fn with_max_size(max_size_bytes: usize) -> Self {
        MemoryFragmentCache {
            max_size_bytes: Some(max_size_bytes),
            ..Self::new()
        }
    }

    fn cleanup_expired(inner: &mut Inner, now: Instant) {
        let mut removed_bytes = 0;
        inner.entries.retain(|_, entry| {
            if entry.expires_at <= now {
                removed_bytes += entry.data.len();
                false
            } else {
                true
            }
        });
        inner.size_bytes = inner.size_bytes.saturating_sub(removed_bytes);
    }

    fn evict_lru(inner: &mut Inner, needed_bytes: usize) {
        let mut by_age: Vec<_> = inner
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, last_accessed)| *last_accessed);

        let mut freed = 0;
        let mut removed = 0;
        for (key, _) in by_age {
            if freed >= needed_bytes {
                break;
            }
            if let Some(entry) = inner.entries.remove(&key) {
                freed += entry.data.len();
                removed += 1;
            }
        }
        inner.size_bytes = inner.size_bytes.saturating_sub(freed);
        debug!("LRU eviction: freed {} bytes by removing {} entries", freed, removed);
    }
}

impl Default for MemoryFragmentCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentCache for MemoryFragmentCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let result = match self.inner.write() {
            Ok(mut inner) => {
                let found = inner.entries.get_mut(key).map(|entry| {
                    if entry.expires_at > now {
                        entry.last_accessed = now;
                        Some(entry.data.clone())
                    } else {
                        None
                    }
                });
                match found {
                    Some(Some(data)) => Some(data),
                    Some(None) => {
                        if let Some(expired) = inner.entries.remove(key) {
                            inner.size_bytes = inner.size_bytes.saturating_sub(expired.data.len());
                        }
                        None
                    }
                    None => None,
                }
            }
            Err(e) => {
                warn!("Fragment cache lookup error: key={}, error={:?}", key, e);
                None
            }
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Fragment cache hit: {}", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn put(&self, key: &str, data: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let size = data.len();
        if self.max_size_bytes.is_some_and(|max| size > max) {
            debug!("Fragment {} ({} bytes) larger than cache, not stored", key, size);
            return;
        }

        let now = Instant::now();
        let Ok(mut inner) = self.inner.write() else {
            warn!("Failed to store fragment in cache: key={}", key);
            return;
        };

        if let Some(old) = inner.entries.remove(key) {
            inner.size_bytes = inner.size_bytes.saturating_sub(old.data.len());
        }

        if let Some(max) = self.max_size_bytes {
            if inner.size_bytes + size > max {
                Self::cleanup_expired(&mut inner, now);
            }
            if inner.size_bytes + size > max {
                let needed = inner.size_bytes + size - max;
                Self::evict_lru(&mut inner, needed);
            }
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
        inner.size_bytes += size;
    }

    fn remove(&self, key: &str) -> bool {
        match self.inner.write() {
            Ok(mut inner) => match inner.entries.remove(key) {
                Some(entry) => {
                    inner.size_bytes = inner.size_bytes.saturating_sub(entry.data.len());
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.entries.clear();
            inner.size_bytes = 0;
        }
    }

    fn stats(&self) -> CacheStats {
        let (total_entries, total_bytes) = self
            .inner
            .read()
            .map(|inner| (inner.entries.len(), inner.size_bytes))
            .unwrap_or((0, 0));
        CacheStats {
            total_entries,
            total_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
