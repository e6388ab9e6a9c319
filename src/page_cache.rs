//! Parsed-page cache and parse coalescing
//!
//! A page is identified by a fingerprint of its method, path and any
//! configured variation headers. The first request for a page scans its
//! body; the resulting [`Entities`] are cached so later requests skip the
//! scan. Concurrent first requests share a single scan through the
//! [`Coalescer`].

use crate::entity::Entities;
use crate::error::Result;
use crate::metrics::EsiMetrics;
use crate::scanner::ScannerPool;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Stable page identifier
pub type Fingerprint = u64;

/// Hash `method`, `path_and_query` and the values of `variation_headers`
///
/// Header names are matched case-insensitively; repeated headers are folded
/// in order.
pub fn fingerprint(
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    variation_headers: &[String],
) -> Fingerprint {
    let mut buf = Vec::with_capacity(64 + path_and_query.len());
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.push(0);
    buf.extend_from_slice(path_and_query.as_bytes());
    for name in variation_headers {
        let name = name.to_ascii_lowercase();
        buf.push(0);
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'=');
        for value in headers.get_all(name.as_str()) {
            buf.extend_from_slice(value.as_bytes());
            buf.push(b',');
        }
    }
    xxh3_64(&buf)
}

/// Whether cached tags still sit at the same offsets in `body`
pub fn matches_body(entities: &Entities, body: &[u8]) -> bool {
    entities.iter().all(|e| {
        let (start, end) = (e.tag_start(), e.tag_end());
        end <= body.len()
            && end >= start + 7
            && body[start..].starts_with(b"<esi:")
            && body[..end].ends_with(b"/>")
            && body[start + 5..end - 2] == *e.raw_tag()
    })
}

/// Concurrent map from fingerprint to parsed tags
pub trait PageCache: Send + Sync {
    fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Entities>>;

    fn insert(&self, fingerprint: Fingerprint, entities: Arc<Entities>);

    fn remove(&self, fingerprint: Fingerprint) -> bool;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`PageCache`] behind a single `RwLock`
#[derive(Default)]
pub struct LockedPageCache {
    pages: RwLock<HashMap<Fingerprint, Arc<Entities>>>,
}

impl LockedPageCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageCache for LockedPageCache {
    fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Entities>> {
        self.pages.read().ok()?.get(&fingerprint).cloned()
    }

    fn insert(&self, fingerprint: Fingerprint, entities: Arc<Entities>) {
        if let Ok(mut pages) = self.pages.write() {
            pages.insert(fingerprint, entities);
        }
    }

    fn remove(&self, fingerprint: Fingerprint) -> bool {
        self.pages
            .write()
            .map(|mut pages| pages.remove(&fingerprint).is_some())
            .unwrap_or(false)
    }

    fn clear(&self) {
        if let Ok(mut pages) = self.pages.write() {
            pages.clear();
        }
    }

    fn len(&self) -> usize {
        self.pages.read().map(|p| p.len()).unwrap_or(0)
    }
}

type Snapshot = Arc<HashMap<Fingerprint, Arc<Entities>>>;

#[derive(Default)]
struct Dirty {
    pages: HashMap<Fingerprint, Arc<Entities>>,
    misses: usize,
}

/// [`PageCache`] tuned for lookups vastly outnumbering inserts
///
/// Lookups read an immutable `clean` snapshot; the `RwLock` around it is
/// only held long enough to clone the `Arc`, and is written only when a new
/// snapshot is published. New pages go into a mutex-guarded `dirty` overlay.
/// Once lookups have missed the snapshot as many times as the overlay has
/// entries, the overlay is merged into a fresh snapshot.
///
/// Lock order: `dirty` before `clean`.
#[derive(Default)]
pub struct ReadMostlyPageCache {
    clean: RwLock<Snapshot>,
    dirty: Mutex<Dirty>,
    amended: AtomicBool,
}

impl ReadMostlyPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Snapshot {
        match self.clean.read() {
            Ok(clean) => clean.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, snapshot: HashMap<Fingerprint, Arc<Entities>>) {
        match self.clean.write() {
            Ok(mut clean) => *clean = Arc::new(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(snapshot),
        }
    }

    /// Merge the overlay into a new snapshot and apply `edit` to it
    fn promote_with(&self, dirty: &mut Dirty, edit: impl FnOnce(&mut HashMap<Fingerprint, Arc<Entities>>)) {
        let mut merged: HashMap<_, _> = (*self.snapshot()).clone();
        merged.extend(dirty.pages.drain());
        edit(&mut merged);
        dirty.misses = 0;
        self.amended.store(false, Ordering::Release);
        debug!("Promoted page cache snapshot ({} pages)", merged.len());
        self.publish(merged);
    }

    fn lock_dirty(&self) -> std::sync::MutexGuard<'_, Dirty> {
        self.dirty.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PageCache for ReadMostlyPageCache {
    fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Entities>> {
        if let Some(hit) = self.snapshot().get(&fingerprint) {
            return Some(hit.clone());
        }
        if !self.amended.load(Ordering::Acquire) {
            return None;
        }

        let mut dirty = self.lock_dirty();
        // a promotion may have happened while waiting for the lock
        if let Some(hit) = self.snapshot().get(&fingerprint) {
            return Some(hit.clone());
        }
        let found = dirty.pages.get(&fingerprint).cloned();
        dirty.misses += 1;
        if dirty.misses >= dirty.pages.len() {
            self.promote_with(&mut dirty, |_| {});
        }
        found
    }

    fn insert(&self, fingerprint: Fingerprint, entities: Arc<Entities>) {
        let mut dirty = self.lock_dirty();
        if self.snapshot().contains_key(&fingerprint) {
            // overwriting a clean entry must be visible to lock-free readers
            self.promote_with(&mut dirty, |pages| {
                pages.insert(fingerprint, entities);
            });
            return;
        }
        dirty.pages.insert(fingerprint, entities);
        self.amended.store(true, Ordering::Release);
    }

    fn remove(&self, fingerprint: Fingerprint) -> bool {
        let mut dirty = self.lock_dirty();
        let present =
            dirty.pages.contains_key(&fingerprint) || self.snapshot().contains_key(&fingerprint);
        if present {
            self.promote_with(&mut dirty, |pages| {
                pages.remove(&fingerprint);
            });
        }
        present
    }

    fn clear(&self) {
        let mut dirty = self.lock_dirty();
        dirty.pages.clear();
        self.promote_with(&mut dirty, |pages| pages.clear());
    }

    fn len(&self) -> usize {
        let dirty = self.lock_dirty();
        self.snapshot().len() + dirty.pages.len()
    }
}

/// Single-flight execution keyed by `K`
///
/// While a computation for a key is in flight, further callers for the same
/// key wait for it and receive a clone of its result instead of running
/// their own. The slot is dropped once the computation finishes, so the
/// next call after that runs again.
pub struct Coalescer<K, V> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Coalescer {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a run is already in flight
    ///
    /// # Returns
    /// The result and whether this caller ran `work` itself
    pub async fn run<F, Fut>(&self, key: K, work: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            inflight.entry(key.clone()).or_default().clone()
        };

        let mut leader = false;
        let value = cell
            .get_or_init(|| {
                leader = true;
                work()
            })
            .await
            .clone();

        if leader {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if inflight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(&key);
            }
        }

        (value, leader)
    }

    /// Number of keys with a computation in flight
    pub fn inflight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Cache-backed, coalesced page scanning
pub struct PageParser {
    cache: Arc<dyn PageCache>,
    coalescer: Coalescer<Fingerprint, Result<Arc<Entities>>>,
    scanners: ScannerPool,
    metrics: Arc<EsiMetrics>,
}

impl PageParser {
    pub fn new(cache: Arc<dyn PageCache>, max_tag_size: usize, metrics: Arc<EsiMetrics>) -> Self {
        PageParser {
            cache,
            coalescer: Coalescer::new(),
            scanners: ScannerPool::new(max_tag_size),
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    /// Scan and parse a body without touching the cache
    pub fn parse(&self, body: &[u8]) -> Result<Entities> {
        let mut entities = self.scanners.scan(body)?;
        let failed = entities.parse_all();
        self.metrics.record_parse();
        if failed > 0 {
            warn!("{} of {} ESI tags failed to parse", failed, entities.len());
        }
        Ok(entities)
    }

    /// Cached tags for `fingerprint`, scanning `body` if there are none
    ///
    /// A cached entry whose offsets no longer line up with `body` is
    /// discarded and the body rescanned. Errors are shared with every
    /// coalesced waiter but never cached.
    pub async fn get_or_parse(&self, fingerprint: Fingerprint, body: &[u8]) -> Result<Arc<Entities>> {
        if let Some(entities) = self.cache.get(fingerprint) {
            if matches_body(&entities, body) {
                self.metrics.record_page_cache_hit();
                return Ok(entities);
            }
            info!("Cached tags for page {:016x} are stale, rescanning", fingerprint);
            self.cache.remove(fingerprint);
        }
        self.metrics.record_page_cache_miss();

        let (result, leader) = self
            .coalescer
            .run(fingerprint, || async {
                // let concurrent misses for this page queue behind the scan
                tokio::task::yield_now().await;
                let entities = Arc::new(self.parse(body)?);
                self.cache.insert(fingerprint, entities.clone());
                debug!(
                    "Cached {} ESI tags for page {:016x}",
                    entities.len(),
                    fingerprint
                );
                Ok(entities)
            })
            .await;

        if !leader {
            self.metrics.record_coalesced_wait();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::scanner::DEFAULT_MAX_TAG_SIZE;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn entities(n: usize) -> Arc<Entities> {
        Arc::new(Entities::from(
            (0..n)
                .map(|i| Entity::new(Bytes::from_static(b"include src=\"a\""), i * 30, i * 30 + 22))
                .collect::<Vec<_>>(),
        ))
    }

    fn exercise(cache: &dyn PageCache) {
        assert!(cache.get(1).is_none());
        cache.insert(1, entities(1));
        cache.insert(2, entities(2));
        assert_eq!(cache.get(1).unwrap().len(), 1);
        assert_eq!(cache.get(2).unwrap().len(), 2);
        assert_eq!(cache.len(), 2);

        cache.insert(1, entities(3));
        assert_eq!(cache.get(1).unwrap().len(), 3);

        assert!(cache.remove(1));
        assert!(!cache.remove(1));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_locked_cache() {
        exercise(&LockedPageCache::new());
    }

    #[test]
    fn test_read_mostly_cache() {
        exercise(&ReadMostlyPageCache::new());
    }

    #[test]
    fn test_read_mostly_promotes_after_misses() {
        let cache = ReadMostlyPageCache::new();
        cache.insert(7, entities(1));
        assert!(cache.amended.load(Ordering::Acquire));

        // one miss against a one-entry overlay triggers promotion
        assert!(cache.get(7).is_some());
        assert!(!cache.amended.load(Ordering::Acquire));
        assert!(cache.snapshot().contains_key(&7));
        assert!(cache.get(7).is_some());
    }

    #[test]
    fn test_fingerprint_variation() {
        let mut headers = HeaderMap::new();
        headers.insert("accept-language", "de".parse().unwrap());
        let vary = vec!["Accept-Language".to_string()];

        let a = fingerprint(&Method::GET, "/p", &headers, &vary);
        let b = fingerprint(&Method::GET, "/p", &HeaderMap::new(), &vary);
        let c = fingerprint(&Method::GET, "/p", &headers, &[]);
        let d = fingerprint(&Method::GET, "/p", &HeaderMap::new(), &[]);
        let e = fingerprint(&Method::HEAD, "/p", &HeaderMap::new(), &[]);

        assert_ne!(a, b);
        assert_eq!(c, d);
        assert_ne!(d, e);
        assert_eq!(a, fingerprint(&Method::GET, "/p", &headers, &vary));
    }

    #[test]
    fn test_matches_body() {
        let body = b"ab<esi:include src=\"x\"/>cd";
        let parser = PageParser::new(
            Arc::new(LockedPageCache::new()),
            DEFAULT_MAX_TAG_SIZE,
            Arc::new(EsiMetrics::new()),
        );
        let entities = parser.parse(body).unwrap();
        assert!(matches_body(&entities, body));
        assert!(!matches_body(&entities, b"xxab<esi:include src=\"x\"/>cd"));
        assert!(!matches_body(&entities, b"short"));
    }

    #[tokio::test]
    async fn test_coalescer_single_run() {
        let coalescer: Arc<Coalescer<u64, usize>> = Arc::new(Coalescer::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let coalescer = coalescer.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    coalescer
                        .run(42, || async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            runs.fetch_add(1, Ordering::SeqCst) + 100
                        })
                        .await
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            let (value, leader) = task.await.unwrap();
            assert_eq!(value, 100);
            leaders += leader as usize;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert_eq!(coalescer.inflight(), 0);
    }

    #[tokio::test]
    async fn test_get_or_parse_caches() {
        let metrics = Arc::new(EsiMetrics::new());
        let parser = PageParser::new(
            Arc::new(ReadMostlyPageCache::new()),
            DEFAULT_MAX_TAG_SIZE,
            metrics.clone(),
        );
        let body = b"<esi:include src=\"memory://a\"/>";

        let first = parser.get_or_parse(9, body).await.unwrap();
        let second = parser.get_or_parse(9, body).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = metrics.get_stats();
        assert_eq!(stats.parses, 1);
        assert_eq!(stats.page_cache_hits, 1);
        assert_eq!(stats.page_cache_misses, 1);
    }

    #[tokio::test]
    async fn test_get_or_parse_concurrent_misses_share_scan() {
        let metrics = Arc::new(EsiMetrics::new());
        let parser = PageParser::new(
            Arc::new(LockedPageCache::new()),
            DEFAULT_MAX_TAG_SIZE,
            metrics.clone(),
        );
        let body = b"<esi:include src=\"memory://a\"/>";

        let results =
            futures::future::join_all((0..4).map(|_| parser.get_or_parse(5, body))).await;
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r.as_ref().unwrap(), first)));

        let stats = metrics.get_stats();
        assert_eq!(stats.parses, 1);
        assert_eq!(stats.page_cache_misses, 4);
        assert_eq!(stats.coalesced_waits, 3);
    }

    #[tokio::test]
    async fn test_get_or_parse_rescans_stale_entry() {
        let metrics = Arc::new(EsiMetrics::new());
        let parser = PageParser::new(
            Arc::new(LockedPageCache::new()),
            DEFAULT_MAX_TAG_SIZE,
            metrics.clone(),
        );
        parser
            .get_or_parse(3, b"<esi:include src=\"a\"/>")
            .await
            .unwrap();
        let moved = parser
            .get_or_parse(3, b"--<esi:include src=\"a\"/>")
            .await
            .unwrap();
        assert_eq!(moved[0].tag_start(), 2);
        assert_eq!(metrics.get_stats().parses, 2);
    }

    #[tokio::test]
    async fn test_parse_error_not_cached() {
        let parser = PageParser::new(
            Arc::new(LockedPageCache::new()),
            16,
            Arc::new(EsiMetrics::new()),
        );
        let body = b"<esi:include src=\"far-too-long-for-the-limit\"/>";
        assert!(parser.get_or_parse(5, body).await.is_err());
        assert!(parser.cache().get(5).is_none());
    }
}
