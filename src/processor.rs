//! Request-level ESI processing
//!
//! [`EsiProcessor`] owns every long-lived component (handler registry,
//! parsed-page cache, resolver, metrics) and exposes the two ways a page
//! can be served:
//!
//! - buffered: [`EsiProcessor::process_document`] takes the whole origin
//!   body and returns the finished page
//! - streamed: [`EsiProcessor::begin_stream`] returns a [`ResponsePlan`]
//!   whose headers only become available once the page's tag set is known,
//!   and whose [`StreamInjector`] then rewrites the body chunk by chunk
//!
//! # Example
//!
//! ```rust,no_run
//! use pingora_esi::{CancelSignal, EsiConfig, EsiProcessor, RequestInfo};
//! use bytes::Bytes;
//! use http::{HeaderMap, Method};
//!
//! # async fn example() -> pingora_esi::Result<()> {
//! let processor = EsiProcessor::from_config(EsiConfig::default())?;
//! let req = RequestInfo::new(Method::GET, "/index.html".parse().unwrap(), HeaderMap::new());
//! let body = Bytes::from_static(b"<p><esi:include src=\"http://fragments/nav\"/></p>");
//! let page = processor
//!     .process_document(&req, &HeaderMap::new(), body, &CancelSignal::never())
//!     .await?;
//! println!("{} tags, {} fallbacks", page.tags, page.fallbacks);
//! # Ok(())
//! # }
//! ```

use crate::backend::HandlerRegistry;
use crate::cancel::CancelSignal;
use crate::config::{EsiConfig, PageCacheKind};
use crate::entity::{is_returnable, Entities};
use crate::error::{EsiError, Result};
use crate::fragment_cache::{FragmentCache, MemoryFragmentCache};
use crate::injector::{inject_content, looks_like_text, StreamInjector};
use crate::metrics::EsiMetrics;
use crate::models::DataTags;
use crate::page_cache::{
    fingerprint, Fingerprint, LockedPageCache, PageCache, PageParser, ReadMostlyPageCache,
};
use crate::request_analyzer::{declared_content_length, RequestAnalyzer};
use crate::resolver::{Resolution, ResourceResolver};
use crate::template::RequestInfo;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A page after buffered processing
#[derive(Debug, Clone)]
pub struct ProcessedPage {
    pub body: Bytes,
    /// Origin headers with Content-Length corrected and returned headers added
    pub headers: HeaderMap,
    /// Number of tags replaced
    pub tags: usize,
    /// Tags rendered from their fallback
    pub fallbacks: usize,
    /// The page was served unmodified because it could not be scanned
    pub degraded: bool,
}

#[derive(Debug)]
enum PlanState {
    /// Tag set not known yet
    Pending,
    Ready { tags: DataTags, returned: HeaderMap },
    /// Body passes through unchanged
    Bypass,
}

/// Deferred response headers for a streamed page
///
/// Headers can only be taken once the page's complete tag set is known
/// (possibly empty), because Content-Length depends on it.
#[derive(Debug)]
pub struct ResponsePlan {
    origin_headers: HeaderMap,
    state: PlanState,
    degraded: bool,
}

impl ResponsePlan {
    /// A plan whose tag set is still unknown
    pub fn pending(origin_headers: HeaderMap) -> Self {
        ResponsePlan {
            origin_headers,
            state: PlanState::Pending,
            degraded: false,
        }
    }

    /// A plan that leaves the body untouched
    pub fn passthrough(origin_headers: HeaderMap) -> Self {
        ResponsePlan {
            origin_headers,
            state: PlanState::Bypass,
            degraded: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self.state, PlanState::Pending)
    }

    pub fn is_bypassed(&self) -> bool {
        matches!(self.state, PlanState::Bypass)
    }

    /// The body could not be scanned and passes through unmodified
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Number of replacements that will be made
    pub fn tag_count(&self) -> usize {
        match &self.state {
            PlanState::Ready { tags, .. } => tags.len(),
            _ => 0,
        }
    }

    /// Fix the tag set for this response
    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.state = PlanState::Ready {
            tags: resolution.tags,
            returned: resolution.headers,
        };
    }

    /// Give up on injection and pass the body through
    pub fn bypass(&mut self) {
        self.state = PlanState::Bypass;
    }

    /// Sniff the first body chunk, bypassing injection for binary payloads
    ///
    /// Must be called before [`ResponsePlan::response_headers`] so a
    /// bypassed body keeps its original Content-Length.
    pub fn observe_first_chunk(&mut self, chunk: &[u8]) {
        if matches!(self.state, PlanState::Ready { .. }) && !chunk.is_empty() && !looks_like_text(chunk) {
            debug!("First chunk looks binary, bypassing injection");
            self.state = PlanState::Bypass;
        }
    }

    /// Headers to send to the client
    ///
    /// # Returns
    /// * `Err(EsiError::InternalError)` while the tag set is still pending
    /// * `Err(EsiError::NotValid)` if the tags do not fit the declared Content-Length
    pub fn response_headers(&self) -> Result<HeaderMap> {
        match &self.state {
            PlanState::Pending => Err(EsiError::InternalError(
                "response headers requested before the tag set is known".to_string(),
            )),
            PlanState::Bypass => Ok(self.origin_headers.clone()),
            PlanState::Ready { tags, returned } => {
                rewrite_headers(&self.origin_headers, tags, returned)
            }
        }
    }

    /// Injector for the response body
    pub fn into_injector(self) -> Result<StreamInjector> {
        match self.state {
            PlanState::Pending => Err(EsiError::InternalError(
                "injector requested before the tag set is known".to_string(),
            )),
            PlanState::Bypass => Ok(StreamInjector::bypass()),
            PlanState::Ready { tags, .. } => Ok(StreamInjector::new(tags)),
        }
    }
}

/// Apply the replacements' effect on the origin headers
fn rewrite_headers(origin: &HeaderMap, tags: &DataTags, returned: &HeaderMap) -> Result<HeaderMap> {
    let mut headers = origin.clone();
    if let Some(original) = declared_content_length(origin) {
        let adjusted = tags.adjust_content_length(original)?;
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(adjusted));
    }
    for (name, value) in returned.iter() {
        if is_returnable(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    Ok(headers)
}

/// Owns the engine's long-lived state and runs it per request
pub struct EsiProcessor {
    config: Arc<EsiConfig>,
    registry: Arc<HandlerRegistry>,
    parser: PageParser,
    resolver: ResourceResolver,
    analyzer: RequestAnalyzer,
    fragment_cache: Option<Arc<dyn FragmentCache>>,
    metrics: Arc<EsiMetrics>,
}

impl EsiProcessor {
    /// Assemble a processor around an existing registry
    pub fn new(config: EsiConfig, registry: HandlerRegistry) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let metrics = Arc::new(EsiMetrics::new());

        let page_cache: Arc<dyn PageCache> = match config.page_cache.kind {
            PageCacheKind::Locked => Arc::new(LockedPageCache::new()),
            PageCacheKind::ReadMostly => Arc::new(ReadMostlyPageCache::new()),
        };

        let fragment_cache: Option<Arc<dyn FragmentCache>> = if config.fragment_cache.enabled {
            Some(Arc::new(MemoryFragmentCache::with_max_size(
                config.fragment_cache.max_size_bytes,
            )))
        } else {
            None
        };

        let mut resolver =
            ResourceResolver::new(registry.clone(), &config).with_metrics(metrics.clone());
        if let Some(cache) = &fragment_cache {
            resolver = resolver.with_fragment_cache(cache.clone());
        }

        info!(
            "ESI processor ready: page_cache={:?}, fragment_cache={}, {:?}",
            config.page_cache.kind,
            fragment_cache.is_some(),
            registry
        );

        EsiProcessor {
            parser: PageParser::new(page_cache, config.max_tag_size, metrics.clone()),
            analyzer: RequestAnalyzer::new(config.clone()),
            config,
            registry,
            resolver,
            fragment_cache,
            metrics,
        }
    }

    /// Validate `config` and build the registry it describes
    pub fn from_config(config: EsiConfig) -> Result<Self> {
        config.validate()?;
        let registry = HandlerRegistry::from_config(&config)?;
        Ok(Self::new(config, registry))
    }

    pub fn config(&self) -> &EsiConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn page_cache(&self) -> &Arc<dyn PageCache> {
        self.parser.cache()
    }

    pub fn fragment_cache(&self) -> Option<&Arc<dyn FragmentCache>> {
        self.fragment_cache.as_ref()
    }

    pub fn analyzer(&self) -> &RequestAnalyzer {
        &self.analyzer
    }

    pub fn metrics(&self) -> &Arc<EsiMetrics> {
        &self.metrics
    }

    /// Page fingerprint for a request
    pub fn fingerprint(&self, req: &RequestInfo) -> Fingerprint {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        fingerprint(
            req.method(),
            path,
            req.headers(),
            &self.config.page_variation_headers,
        )
    }

    /// Parsed tags for the request's page, scanning `body` on a miss
    pub async fn get_or_parse(&self, req: &RequestInfo, body: &[u8]) -> Result<Arc<Entities>> {
        self.parser.get_or_parse(self.fingerprint(req), body).await
    }

    pub async fn resolve_all(
        &self,
        entities: &Entities,
        req: &RequestInfo,
        cancel: &CancelSignal,
    ) -> Result<Resolution> {
        self.resolver.resolve_all(entities, req, cancel).await
    }

    /// Process a fully buffered origin body
    ///
    /// A body that cannot be scanned (binary, or containing an oversized
    /// tag) is returned unmodified with `degraded` set when scanning failed.
    ///
    /// # Returns
    /// * `Err(EsiError::Cancelled)` if the client went away mid-resolution
    pub async fn process_document(
        &self,
        req: &RequestInfo,
        origin_headers: &HeaderMap,
        body: Bytes,
        cancel: &CancelSignal,
    ) -> Result<ProcessedPage> {
        self.metrics.record_bytes_from_origin(body.len() as u64);

        let unchanged = |degraded| ProcessedPage {
            headers: origin_headers.clone(),
            body: body.clone(),
            tags: 0,
            fallbacks: 0,
            degraded,
        };

        if !looks_like_text(&body) {
            debug!("Body of {} looks binary, skipping ESI", req.path());
            return Ok(unchanged(false));
        }

        let entities = match self.get_or_parse(req, &body).await {
            Ok(entities) => entities,
            Err(e @ EsiError::MalformedTag { .. }) => {
                warn!("Serving {} unmodified: {}", req.path(), e);
                self.metrics.record_degraded();
                return Ok(unchanged(true));
            }
            Err(e) => return Err(e),
        };
        if entities.is_empty() {
            return Ok(unchanged(false));
        }

        let resolution = self.resolve_all(&entities, req, cancel).await?;
        let headers = rewrite_headers(origin_headers, &resolution.tags, &resolution.headers)?;
        let out = inject_content(&body, &resolution.tags)?;
        self.metrics
            .record_bytes_injected(resolution.tags.injected_len() as u64);

        debug!(
            "Processed {}: {} tags, {} fallbacks, {} -> {} bytes",
            req.path(),
            resolution.tags.len(),
            resolution.fallbacks,
            body.len(),
            out.len()
        );

        Ok(ProcessedPage {
            body: out,
            headers,
            tags: resolution.tags.len(),
            fallbacks: resolution.fallbacks,
            degraded: false,
        })
    }

    /// Start a streamed response
    ///
    /// When the page's tags are already cached they are resolved here and
    /// the plan comes back ready: headers can be sent and the body streamed
    /// through the injector. Cached tags are trusted as-is; a deploy that
    /// moves them must be followed by a purge. Otherwise the plan stays
    /// pending and the caller finishes it with [`EsiProcessor::complete_plan`].
    ///
    /// HEAD responses pass through without a Content-Length, since the
    /// final length is unknown without resolving the page.
    pub async fn begin_stream(
        &self,
        req: &RequestInfo,
        origin_headers: HeaderMap,
        cancel: &CancelSignal,
    ) -> Result<ResponsePlan> {
        if req.method() == Method::HEAD {
            let mut headers = origin_headers;
            headers.remove(header::CONTENT_LENGTH);
            return Ok(ResponsePlan::passthrough(headers));
        }

        let mut plan = ResponsePlan::pending(origin_headers);
        let fp = self.fingerprint(req);
        if let Some(entities) = self.page_cache().get(fp) {
            self.metrics.record_page_cache_hit();
            let resolution = self.resolve_all(&entities, req, cancel).await?;
            debug!(
                "Streaming {} with {} cached tags",
                req.path(),
                resolution.tags.len()
            );
            plan.set_resolution(resolution);
        }
        Ok(plan)
    }

    /// Finish a pending plan from the buffered origin body
    pub async fn complete_plan(
        &self,
        plan: &mut ResponsePlan,
        req: &RequestInfo,
        body: &[u8],
        cancel: &CancelSignal,
    ) -> Result<()> {
        if plan.is_ready() {
            return Ok(());
        }
        if !looks_like_text(body) {
            plan.bypass();
            return Ok(());
        }

        match self.get_or_parse(req, body).await {
            Ok(entities) => {
                let resolution = self.resolve_all(&entities, req, cancel).await?;
                plan.set_resolution(resolution);
                Ok(())
            }
            Err(e @ EsiError::MalformedTag { .. }) => {
                warn!("Serving {} unmodified: {}", req.path(), e);
                self.metrics.record_degraded();
                plan.bypass();
                plan.degraded = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release backend resources
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
