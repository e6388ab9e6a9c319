//! Resource resolution
//!
//! For each tag the resolver walks its resources in declaration order and
//! returns the first successful fetch. Resources whose breaker is open are
//! skipped, unless a cached fragment is available for them. A backend
//! failure is recorded on that resource's breaker. A caller-side
//! cancellation, or running out of request deadline, is not.

use crate::backend::{HandlerRegistry, ResourceArgs};
use crate::cancel::CancelSignal;
use crate::circuit_breaker::{Admission, BreakerPolicy};
use crate::config::EsiConfig;
use crate::entity::{is_returnable, Entities, Entity, HeaderPolicy};
use crate::error::{EsiError, Result};
use crate::fragment_cache::{fragment_key, FragmentCache};
use crate::metrics::EsiMetrics;
use crate::models::{DataTag, DataTags};
use crate::template::RequestInfo;
use bytes::Bytes;
use futures::future::join_all;
use http::HeaderMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Content for one tag plus the response headers it asked to return
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub content: Bytes,
    pub headers: HeaderMap,
}

/// Every tag of a page resolved
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub tags: DataTags,
    /// Headers collected through `returnheaders`, to add to the page response
    pub headers: HeaderMap,
    /// Tags rendered from their fallback
    pub fallbacks: usize,
}

pub struct ResourceResolver {
    registry: Arc<HandlerRegistry>,
    fragment_cache: Option<Arc<dyn FragmentCache>>,
    metrics: Arc<EsiMetrics>,
    policy: BreakerPolicy,
    default_timeout: Duration,
    default_ttl: Duration,
    max_body_size: usize,
}

impl ResourceResolver {
    pub fn new(registry: Arc<HandlerRegistry>, config: &EsiConfig) -> Self {
        ResourceResolver {
            registry,
            fragment_cache: None,
            metrics: Arc::new(EsiMetrics::new()),
            policy: config.breaker_policy(),
            default_timeout: config.default_timeout(),
            default_ttl: config.default_ttl(),
            max_body_size: config.max_body_size,
        }
    }

    pub fn with_fragment_cache(mut self, cache: Arc<dyn FragmentCache>) -> Self {
        self.fragment_cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EsiMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// `min(tag timeout or default, time left before the request deadline)`
    pub fn effective_timeout(&self, entity: &Entity, req: &RequestInfo) -> Duration {
        self.fetch_budget(entity, req).0
    }

    /// The effective timeout, and whether the request deadline is what bounds it
    fn fetch_budget(&self, entity: &Entity, req: &RequestInfo) -> (Duration, bool) {
        let timeout = if entity.timeout().is_zero() {
            self.default_timeout
        } else {
            entity.timeout()
        };
        match req.remaining() {
            Some(left) if left < timeout => (left, true),
            _ => (timeout, false),
        }
    }

    fn effective_ttl(&self, entity: &Entity) -> Duration {
        if entity.ttl().is_zero() {
            self.default_ttl
        } else {
            entity.ttl()
        }
    }

    /// Resolve one tag
    ///
    /// # Returns
    /// * `Ok(Resolved)` with the first successful resource's content
    /// * `Err(EsiError::Cancelled)` if the request was cancelled mid-fetch
    /// * `Err(EsiError::AllResourcesFailed)` carrying the tag's `onerror` text otherwise
    pub async fn resolve(
        &self,
        entity: &Entity,
        req: &RequestInfo,
        cancel: &CancelSignal,
    ) -> Result<Resolved> {
        let exhausted = |attempts| EsiError::AllResourcesFailed {
            tag: entity.describe(),
            attempts,
            on_error: entity.on_error().map(str::to_string),
        };

        if let Some(err) = entity.parse_error() {
            debug!("Skipping unparsable tag {}: {}", entity.describe(), err);
            return Err(exhausted(0));
        }
        if cancel.is_cancelled() {
            return Err(EsiError::Cancelled(entity.describe()));
        }

        let key = entity.key().map(|k| k.render(req, ""));
        let forwarded = select_headers(req.headers(), entity.forward_headers(), |_| true);
        let ttl = self.effective_ttl(entity);
        let mut attempts = 0;

        for resource in entity.resources() {
            let url = resource.value().render(req, "");
            let cache_key = fragment_key(&url, key.as_deref());

            if let Some(cache) = self.cached(ttl) {
                if let Some(content) = cache.get(&cache_key) {
                    self.metrics.record_fragment_cache_hit();
                    return Ok(Resolved {
                        content,
                        headers: HeaderMap::new(),
                    });
                }
            }

            let (timeout, deadline_bound) = self.fetch_budget(entity, req);
            if timeout.is_zero() {
                warn!(
                    "Request deadline passed before fetching resource {} of {}",
                    resource.index(),
                    entity.describe()
                );
                break;
            }

            let Some(admission) = resource.breaker().admit(&self.policy) else {
                debug!(
                    "Skipping resource {} of {}: circuit open ({} failures)",
                    resource.index(),
                    entity.describe(),
                    resource.breaker().failures()
                );
                self.metrics.record_breaker_skip();
                continue;
            };

            let handler = match self.registry.lookup(&url, resource.is_url()) {
                Ok(handler) => handler,
                Err(e) => {
                    warn!("No handler for {:?} in {}: {}", url, entity.describe(), e);
                    resource.breaker().release_probe(&admission);
                    continue;
                }
            };

            let args = ResourceArgs {
                url: url.clone(),
                key: key.clone(),
                timeout,
                max_body_size: self.max_body_size,
                headers: forwarded.clone(),
                method: req.method().to_string(),
                uri: req.uri().to_string(),
                remote: req.remote().to_string(),
            };

            attempts += 1;
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EsiError::Cancelled(url.clone())),
                fetched = tokio::time::timeout(timeout, handler.do_request(&args)) => match fetched {
                    Ok(result) => result,
                    Err(_) => Err(EsiError::Timeout(format!("{} exceeded {:?}", url, timeout))),
                },
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    resource.breaker().record_success();
                    self.metrics.record_fetch(true, elapsed);
                    debug!(
                        "Resolved {} from resource {} ({} bytes, {:?})",
                        entity.describe(),
                        resource.index(),
                        response.content.len(),
                        elapsed
                    );
                    if let Some(cache) = self.cached(ttl) {
                        cache.put(&cache_key, response.content.clone(), ttl);
                    }
                    return Ok(Resolved {
                        headers: select_headers(
                            &response.header,
                            entity.return_headers(),
                            is_returnable,
                        ),
                        content: response.content,
                    });
                }
                Err(e) if e.is_cancelled() => {
                    resource.breaker().release_probe(&admission);
                    self.metrics.record_cancelled_fetch();
                    debug!("Fetch of {} cancelled", url);
                    return Err(e);
                }
                Err(EsiError::Timeout(_)) if deadline_bound => {
                    // the request ran out of time, not the backend
                    resource.breaker().release_probe(&admission);
                    self.metrics.record_fetch(false, elapsed);
                    warn!(
                        "Request deadline reached while fetching resource {} of {}",
                        resource.index(),
                        entity.describe()
                    );
                    break;
                }
                Err(e) => {
                    self.metrics.record_fetch(false, elapsed);
                    if e.trips_breaker() {
                        resource.breaker().record_failure();
                    } else {
                        resource.breaker().release_probe(&admission);
                    }
                    warn!(
                        "Resource {} of {} failed ({} failures): {}",
                        resource.index(),
                        entity.describe(),
                        resource.breaker().failures(),
                        e
                    );
                }
            }
        }

        Err(exhausted(attempts))
    }

    fn cached(&self, ttl: Duration) -> Option<&Arc<dyn FragmentCache>> {
        if ttl.is_zero() {
            None
        } else {
            self.fragment_cache.as_ref()
        }
    }

    /// Resolve every tag of a page concurrently
    ///
    /// A tag whose condition is false, or that fails entirely, still yields a
    /// replacement (empty or its fallback), so the result covers every tag.
    /// Only cancellation fails the whole page.
    pub async fn resolve_all(
        &self,
        entities: &Entities,
        req: &RequestInfo,
        cancel: &CancelSignal,
    ) -> Result<Resolution> {
        let results = join_all(entities.iter().map(|entity| async move {
            if let Some(condition) = entity.condition() {
                if !condition.evaluate(req) {
                    debug!("Condition false for {}, removing tag", entity.describe());
                    return Ok((entity, Resolved::default(), false));
                }
            }
            match self.resolve(entity, req, cancel).await {
                Ok(resolved) => Ok((entity, resolved, false)),
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    let fallback = e.fallback_content().unwrap_or_default().to_string();
                    self.metrics.record_fallback();
                    Ok((
                        entity,
                        Resolved {
                            content: Bytes::from(fallback),
                            headers: HeaderMap::new(),
                        },
                        true,
                    ))
                }
            }
        }))
        .await;

        let mut tags = Vec::with_capacity(results.len());
        let mut headers = HeaderMap::new();
        let mut fallbacks = 0;
        for result in results {
            let (entity, resolved, fell_back) = result?;
            if fell_back {
                fallbacks += 1;
            }
            for (name, value) in resolved.headers.iter() {
                headers.append(name.clone(), value.clone());
            }
            tags.push(DataTag::new(entity.tag_start(), entity.tag_end(), resolved.content)?);
        }

        Ok(Resolution {
            tags: DataTags::new(tags)?,
            headers,
            fallbacks,
        })
    }
}

fn select_headers(
    source: &HeaderMap,
    policy: &HeaderPolicy,
    permitted: impl Fn(&str) -> bool,
) -> HeaderMap {
    if policy.is_empty() {
        return HeaderMap::new();
    }
    source
        .iter()
        .filter(|(name, _)| policy.allows(name.as_str()) && permitted(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryHandler, ResourceHandler, ResourceResponse};
    use crate::cancel::CancelHandle;
    use crate::fragment_cache::MemoryFragmentCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that fails every request with a backend error
    struct Failing(AtomicUsize);

    #[async_trait]
    impl ResourceHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn do_request(&self, args: &ResourceArgs) -> Result<ResourceResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(EsiError::HttpError(format!("{} is down", args.url)))
        }
    }

    /// Handler that never answers
    struct Hanging;

    #[async_trait]
    impl ResourceHandler for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn do_request(&self, _args: &ResourceArgs) -> Result<ResourceResponse> {
            std::future::pending().await
        }
    }

    fn request() -> RequestInfo {
        RequestInfo::new(http::Method::GET, "/page".parse().unwrap(), HeaderMap::new())
    }

    fn entity(raw: &'static str, start: usize) -> Entity {
        let mut e = Entity::new(Bytes::from_static(raw.as_bytes()), start, start + 10);
        let _ = e.parse_raw();
        e
    }

    fn registry(failing: Arc<Failing>) -> Arc<HandlerRegistry> {
        let memory: MemoryHandler = [("x", "X"), ("y", "Y")].into_iter().collect();
        let mut registry = HandlerRegistry::new();
        registry.register_scheme("memory", Arc::new(memory));
        registry.register_scheme("down", failing);
        registry.register_scheme("hang", Arc::new(Hanging));
        Arc::new(registry)
    }

    fn resolver(failing: Arc<Failing>) -> ResourceResolver {
        ResourceResolver::new(registry(failing), &EsiConfig::default())
    }

    #[tokio::test]
    async fn test_fallback_order() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let r = resolver(failing.clone());
        let e = entity(
            r#"include src="down://a" src="down://b" src="memory://x" src="memory://y""#,
            0,
        );

        let resolved = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(&resolved.content[..], b"X");
        assert_eq!(e.resources()[0].breaker().failures(), 1);
        assert_eq!(e.resources()[1].breaker().failures(), 1);
        assert_eq!(e.resources()[2].breaker().failures(), 0);
        assert_eq!(failing.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_failed_carries_onerror() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let e = entity(r#"include src="down://a" onerror="sorry""#, 0);

        let err = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, EsiError::AllResourcesFailed { attempts: 1, .. }));
        assert_eq!(err.fallback_content(), Some("sorry"));
    }

    #[tokio::test]
    async fn test_open_breaker_skips_resource() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let r = resolver(failing.clone());
        let e = entity(r#"include src="down://a" src="memory://y""#, 0);

        for _ in 0..r.policy().max_failures {
            e.resources()[0].breaker().record_failure();
        }
        let resolved = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(&resolved.content[..], b"Y");
        assert_eq!(failing.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_does_not_trip_breaker() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let e = entity(r#"include src="hang://slow" src="memory://x""#, 0);
        let handle = CancelHandle::new();
        let signal = handle.signal();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let req = request();
        let (result, _) = tokio::join!(r.resolve(&e, &req, &signal), canceller);

        assert!(matches!(result, Err(EsiError::Cancelled(_))));
        assert_eq!(e.resources()[0].breaker().failures(), 0);
    }

    #[tokio::test]
    async fn test_timeout_trips_breaker() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let e = entity(r#"include src="hang://slow" src="memory://y" timeout="20ms""#, 0);

        let resolved = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(&resolved.content[..], b"Y");
        assert_eq!(e.resources()[0].breaker().failures(), 1);
    }

    #[tokio::test]
    async fn test_effective_timeout_uses_deadline() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let e = entity(r#"include src="memory://x" timeout="10s""#, 0);
        let req = request().with_deadline(Instant::now() + Duration::from_secs(1));
        assert!(r.effective_timeout(&e, &req) <= Duration::from_secs(1));

        let e = entity(r#"include src="memory://x""#, 0);
        assert_eq!(r.effective_timeout(&e, &request()), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_unknown_scheme_does_not_trip_breaker() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let e = entity(r#"include src="gopher://a" src="nowhere" src="memory://x""#, 0);

        let resolved = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(&resolved.content[..], b"X");
        assert_eq!(e.resources()[0].breaker().failures(), 0);
        assert_eq!(e.resources()[1].breaker().failures(), 0);
    }

    #[tokio::test]
    async fn test_fragment_cache_used_with_ttl() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let cache = Arc::new(MemoryFragmentCache::new());
        let r = resolver(failing).with_fragment_cache(cache.clone());
        let e = entity(r#"include src="memory://x" ttl="1m""#, 0);

        r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(cache.get("memory://x"), Some(Bytes::from_static(b"X")));
        r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        // one direct lookup above plus the second resolve
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn test_cached_fragment_served_while_circuit_open() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let cache = Arc::new(MemoryFragmentCache::new());
        let r = resolver(failing.clone()).with_fragment_cache(cache.clone());
        let e = entity(r#"include src="down://a" src="memory://y" ttl="1m""#, 0);

        cache.put("down://a", Bytes::from_static(b"cached"), Duration::from_secs(60));
        for _ in 0..r.policy().max_failures {
            e.resources()[0].breaker().record_failure();
        }

        let resolved = r.resolve(&e, &request(), &CancelSignal::never()).await.unwrap();
        assert_eq!(&resolved.content[..], b"cached");
        assert_eq!(failing.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_passed_deadline_skips_fetch() {
        let failing = Arc::new(Failing(AtomicUsize::new(0)));
        let r = resolver(failing.clone());
        let e = entity(r#"include src="down://a" onerror="late""#, 0);
        let req = request().with_deadline(Instant::now());

        let err = r.resolve(&e, &req, &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, EsiError::AllResourcesFailed { attempts: 0, .. }));
        assert_eq!(err.fallback_content(), Some("late"));
        assert_eq!(failing.0.load(Ordering::SeqCst), 0);
        assert_eq!(e.resources()[0].breaker().failures(), 0);
    }

    #[tokio::test]
    async fn test_resolve_all_sorted_with_fallbacks_and_conditions() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let entities = Entities::from(vec![
            entity(r#"include src="memory://y""#, 40),
            entity(r#"include src="down://a" onerror="n/a""#, 0),
            entity(r#"include src="memory://x" condition="false""#, 20),
        ]);

        let resolution = r
            .resolve_all(&entities, &request(), &CancelSignal::never())
            .await
            .unwrap();
        let tags: Vec<_> = resolution
            .tags
            .iter()
            .map(|t| (t.start, t.data.clone()))
            .collect();
        assert_eq!(
            tags,
            vec![
                (0, Bytes::from_static(b"n/a")),
                (20, Bytes::new()),
                (40, Bytes::from_static(b"Y")),
            ]
        );
        assert_eq!(resolution.fallbacks, 1);
    }

    #[tokio::test]
    async fn test_resolve_all_parse_error_renders_fallback() {
        let r = resolver(Arc::new(Failing(AtomicUsize::new(0))));
        let entities = Entities::from(vec![entity(r#"include onerror="missing src""#, 0)]);
        let resolution = r
            .resolve_all(&entities, &request(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(&resolution.tags.as_slice()[0].data[..], b"missing src");
    }
}
