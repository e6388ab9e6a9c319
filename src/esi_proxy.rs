//! Pingora proxy service with ESI processing
//!
//! ESI-eligible requests are answered from `request_filter`: the origin
//! response is fetched with `reqwest`, run through the [`EsiProcessor`] and
//! written back through the session. Every other request is proxied to the
//! upstream unchanged. `PURGE` requests are answered locally when purging
//! is enabled.
//!
//! ```text
//! Client ──► request_filter ──► eligible? ──no──► upstream_peer ──► Origin
//!                                   │
//!                                  yes
//!                                   ▼
//!                  fetch origin ─► plan ─► resolve ─► inject ─► Client
//! ```

use crate::cancel::CancelHandle;
use crate::config::EsiConfig;
use crate::error::EsiError;
use crate::injector::StreamInjector;
use crate::processor::EsiProcessor;
use crate::purge_handler::{is_purge, PurgeHandler};
use crate::purge_metrics::PurgeMetrics;
use crate::template::RequestInfo;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const USER_AGENT: &str = "Pingora-ESI/1.0";

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Main ESI proxy structure
pub struct EsiProxy {
    processor: Arc<EsiProcessor>,
    purge: Option<PurgeHandler>,
    client: reqwest::Client,
}

/// Per-request context
#[derive(Debug)]
pub struct EsiContext {
    path: String,
    esi: bool,
    status: Option<u16>,
    tags: usize,
    degraded: bool,
    bytes_to_client: u64,
    started: Instant,
}

impl Default for EsiContext {
    fn default() -> Self {
        EsiContext {
            path: String::new(),
            esi: false,
            status: None,
            tags: 0,
            degraded: false,
            bytes_to_client: 0,
            started: Instant::now(),
        }
    }
}

impl EsiContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the response went through the ESI engine
    pub fn is_esi(&self) -> bool {
        self.esi
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn tags(&self) -> usize {
        self.tags
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client
    }

    fn add_bytes(&mut self, n: usize) {
        self.bytes_to_client += n as u64;
    }
}

impl EsiProxy {
    /// Create a proxy around an existing processor
    pub fn new(processor: Arc<EsiProcessor>) -> crate::Result<Self> {
        let config = processor.config();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.default_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .no_gzip()
            .build()
            .map_err(|e| EsiError::ConfigError(format!("Failed to build origin client: {}", e)))?;

        info!("Creating EsiProxy");
        info!("  Upstream: {}", config.upstream_address);
        info!("  ESI patterns: {:?}", config.esi_patterns);

        Ok(EsiProxy {
            processor,
            purge: None,
            client,
        })
    }

    /// Build processor, purge handler and proxy from configuration
    pub fn from_config(config: EsiConfig) -> crate::Result<Self> {
        let purge_config = config.purge.clone().filter(|p| p.enabled);
        let processor = Arc::new(EsiProcessor::from_config(config)?);
        let mut proxy = Self::new(processor.clone())?;

        if let Some(purge) = purge_config {
            let mut handler = PurgeHandler::new(
                processor.page_cache().clone(),
                processor.config().page_variation_headers.clone(),
            );
            if let Some(token) = purge.auth_token {
                handler = handler.with_auth(token);
            }
            if purge.enable_metrics {
                match PurgeMetrics::new() {
                    Ok(metrics) => handler = handler.with_metrics(Arc::new(metrics)),
                    Err(e) => warn!("Purge metrics unavailable: {}", e),
                }
            }
            info!("  PURGE enabled");
            proxy = proxy.with_purge(handler);
        }

        Ok(proxy)
    }

    pub fn with_purge(mut self, handler: PurgeHandler) -> Self {
        self.purge = Some(handler);
        self
    }

    pub fn processor(&self) -> &Arc<EsiProcessor> {
        &self.processor
    }

    fn origin_url(&self, path_and_query: &str) -> String {
        format!(
            "http://{}{}",
            self.processor.config().upstream_address,
            path_and_query
        )
    }

    async fn handle_purge(&self, session: &mut Session, ctx: &mut EsiContext) -> Result<bool> {
        let Some(handler) = &self.purge else {
            return Ok(false);
        };

        let req_header = session.req_header();
        let mut builder = http::Request::builder()
            .method(req_header.method.clone())
            .uri(req_header.uri.clone());
        for (name, value) in req_header.headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder.body(()).map_err(|e| {
            warn!("Malformed purge request: {}", e);
            Error::new(ErrorType::InternalError)
        })?;

        let response = handler.handle_purge(&request).map_err(to_pingora)?;
        let (parts, body) = response.into_parts();
        let body = http_body_util::BodyExt::collect(body)
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();

        write_head(session, parts.status, &parts.headers, ctx).await?;
        ctx.add_bytes(body.len());
        session.write_response_body(Some(body), true).await?;
        Ok(true)
    }

    /// Fetch the page from the origin and answer the client
    async fn serve_esi(&self, session: &mut Session, ctx: &mut EsiContext) -> Result<()> {
        let processor = &self.processor;
        let config = processor.config();
        let req_header = session.req_header();

        let path_and_query = req_header
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let remote = session
            .client_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let req = RequestInfo::new(
            req_header.method.clone(),
            req_header.uri.clone(),
            req_header.headers.clone(),
        )
        .with_remote(remote)
        .with_deadline(Instant::now() + config.default_timeout());

        let cancel = CancelHandle::new();
        let signal = cancel.signal();

        let mut origin = match self
            .client
            .request(req.method().clone(), self.origin_url(&path_and_query))
            .headers(origin_request_headers(req.headers()))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Origin request failed for {}: {}", ctx.path(), e);
                return write_error(session, StatusCode::BAD_GATEWAY, ctx).await;
            }
        };

        let status = origin.status();
        let headers = client_response_headers(origin.headers());

        if !processor.analyzer().should_process_response(status, &headers) {
            debug!("Origin response for {} not eligible, streaming as-is", ctx.path());
            write_head(session, status, &headers, ctx).await?;
            return stream_rest(session, &mut origin, StreamInjector::bypass(), Bytes::new(), ctx)
                .await;
        }

        ctx.esi = true;
        let mut plan = processor
            .begin_stream(&req, headers, &signal)
            .await
            .map_err(to_pingora)?;

        let pending = if plan.is_ready() {
            let first = next_chunk(&mut origin, ctx).await?.unwrap_or_default();
            plan.observe_first_chunk(&first);
            first
        } else {
            let mut body = BytesMut::new();
            let mut overflow = false;
            while let Some(chunk) = next_chunk(&mut origin, ctx).await? {
                body.extend_from_slice(&chunk);
                if body.len() > config.max_body_size {
                    warn!(
                        "Body of {} exceeds {} bytes, passing through",
                        ctx.path(),
                        config.max_body_size
                    );
                    overflow = true;
                    break;
                }
            }
            let body = body.freeze();
            processor.metrics().record_bytes_from_origin(body.len() as u64);
            if overflow {
                plan.bypass();
            } else {
                processor
                    .complete_plan(&mut plan, &req, &body, &signal)
                    .await
                    .map_err(to_pingora)?;
            }
            body
        };

        ctx.tags = plan.tag_count();
        ctx.degraded = plan.is_degraded();
        let response_headers = plan.response_headers().map_err(to_pingora)?;
        let injector = plan.into_injector().map_err(to_pingora)?;
        processor
            .metrics()
            .record_bytes_injected(injector.tags().injected_len() as u64);

        write_head(session, status, &response_headers, ctx).await?;
        stream_rest(session, &mut origin, injector, pending, ctx).await
    }
}

#[async_trait]
impl ProxyHttp for EsiProxy {
    type CTX = EsiContext;

    fn new_ctx(&self) -> Self::CTX {
        EsiContext::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let (method, eligible) = {
            let req_header = session.req_header();
            ctx.path = req_header.uri.path().to_string();
            let eligible = self.processor.analyzer().should_process(
                &req_header.method,
                req_header.uri.path(),
                &req_header.headers,
            );
            (req_header.method.clone(), eligible)
        };

        if is_purge(&method) {
            return self.handle_purge(session, ctx).await;
        }
        if !eligible {
            return Ok(false);
        }

        info!("Processing ESI request: {} {}", method, ctx.path());
        self.serve_esi(session, ctx).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let (host, port) = parse_upstream(&self.processor.config().upstream_address);
        debug!("Upstream peer: {}:{}", host, port);
        Ok(Box::new(HttpPeer::new((host.as_str(), port), false, host.clone())))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let (host, _) = parse_upstream(&self.processor.config().upstream_address);
        upstream_request.insert_header("Host", host).map_err(|e| {
            warn!("Failed to insert Host header: {}", e);
            Error::new(ErrorType::InternalError)
        })?;
        upstream_request
            .insert_header("User-Agent", USER_AGENT)
            .map_err(|e| {
                warn!("Failed to insert User-Agent header: {}", e);
                Error::new(ErrorType::InternalError)
            })?;
        Ok(())
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        error!("Failed to connect to upstream for {}: {}", ctx.path(), e);
        e
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let metrics = self.processor.metrics();
        metrics.record_request(ctx.is_esi());
        metrics.record_request_duration(ctx.started.elapsed());
        metrics.record_bytes_to_client(ctx.bytes_to_client());

        if let Some(error) = e {
            error!("Request completed with error for {}: {}", ctx.path(), error);
        } else if ctx.is_esi() {
            info!(
                "ESI request completed for {}: status={:?}, tags={}, bytes={}, {:?}",
                ctx.path(),
                ctx.status(),
                ctx.tags(),
                ctx.bytes_to_client(),
                ctx.started.elapsed()
            );
            if ctx.is_degraded() {
                warn!("  Served unmodified after scan failure");
            }
        }
    }
}

fn to_pingora(e: EsiError) -> Box<Error> {
    let status = e.to_http_status();
    Error::because(ErrorType::HTTPStatus(status), "ESI processing failed", e)
}

/// Request headers to send to the origin
///
/// Hop-by-hop headers are dropped and the body is requested uncompressed
/// so it can be scanned.
pub fn origin_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(incoming);
    headers.remove(header::HOST);
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers
}

/// Origin response headers to pass on to the client
pub fn client_response_headers(origin: &HeaderMap) -> HeaderMap {
    strip_hop_by_hop(origin)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Split `host:port`, defaulting to port 80
pub fn parse_upstream(upstream: &str) -> (String, u16) {
    match upstream.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(80)),
        None => (upstream.to_string(), 80),
    }
}

async fn next_chunk(origin: &mut reqwest::Response, ctx: &EsiContext) -> Result<Option<Bytes>> {
    origin.chunk().await.map_err(|e| {
        error!("Error reading origin body for {}: {}", ctx.path(), e);
        Error::because(ErrorType::ReadError, "origin body", e)
    })
}

async fn write_head(
    session: &mut Session,
    status: StatusCode,
    headers: &HeaderMap,
    ctx: &mut EsiContext,
) -> Result<()> {
    let mut response = ResponseHeader::build(status.as_u16(), Some(headers.len()))?;
    for (name, value) in headers.iter() {
        response.append_header(name.as_str().to_string(), value.clone())?;
    }
    ctx.status = Some(status.as_u16());
    session.write_response_header(Box::new(response), false).await
}

async fn write_error(session: &mut Session, status: StatusCode, ctx: &mut EsiContext) -> Result<()> {
    let body = Bytes::from(status.canonical_reason().unwrap_or("Error").to_string());
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );
    write_head(session, status, &headers, ctx).await?;
    ctx.add_bytes(body.len());
    session.write_response_body(Some(body), true).await
}

/// Push `first` and the rest of the origin body through `injector`
async fn stream_rest(
    session: &mut Session,
    origin: &mut reqwest::Response,
    mut injector: StreamInjector,
    first: Bytes,
    ctx: &mut EsiContext,
) -> Result<()> {
    if !first.is_empty() {
        let out = injector.write(&first).map_err(to_pingora)?;
        ctx.add_bytes(out.len());
        session.write_response_body(Some(out), false).await?;
    }
    while let Some(chunk) = next_chunk(origin, ctx).await? {
        let out = injector.write(&chunk).map_err(to_pingora)?;
        ctx.add_bytes(out.len());
        session.write_response_body(Some(out), false).await?;
    }
    injector.finish().map_err(to_pingora)?;
    session.write_response_body(Some(Bytes::new()), true).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream() {
        assert_eq!(parse_upstream("origin:8080"), ("origin".to_string(), 8080));
        assert_eq!(parse_upstream("origin"), ("origin".to_string(), 80));
        assert_eq!(parse_upstream("origin:bad"), ("origin".to_string(), 80));
    }

    #[test]
    fn test_origin_request_headers() {
        let mut incoming = HeaderMap::new();
        incoming.insert("host", HeaderValue::from_static("example.com"));
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("accept-encoding", HeaderValue::from_static("gzip, br"));
        incoming.insert("cookie", HeaderValue::from_static("session=abc"));

        let headers = origin_request_headers(&incoming);
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers.get("accept-encoding").unwrap(), "identity");
        assert_eq!(headers.get("cookie").unwrap(), "session=abc");
        assert_eq!(headers.get("user-agent").unwrap(), USER_AGENT);
    }

    #[test]
    fn test_client_response_headers() {
        let mut origin = HeaderMap::new();
        origin.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        origin.insert("content-type", HeaderValue::from_static("text/html"));
        origin.append("set-cookie", HeaderValue::from_static("a=1"));
        origin.append("set-cookie", HeaderValue::from_static("b=2"));

        let headers = client_response_headers(&origin);
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_context_defaults() {
        let mut ctx = EsiContext::new();
        assert!(!ctx.is_esi());
        assert_eq!(ctx.status(), None);
        ctx.add_bytes(10);
        ctx.add_bytes(5);
        assert_eq!(ctx.bytes_to_client(), 15);
    }

    #[tokio::test]
    async fn test_from_config_with_purge() {
        let config = EsiConfig {
            purge: Some(crate::config::PurgeConfig {
                enabled: true,
                auth_token: Some("t".to_string()),
                enable_metrics: false,
            }),
            ..Default::default()
        };
        let proxy = EsiProxy::from_config(config).unwrap();
        assert!(proxy.purge.is_some());
        assert_eq!(
            proxy.origin_url("/a?b=1"),
            "http://127.0.0.1:8080/a?b=1".to_string()
        );
    }
}
