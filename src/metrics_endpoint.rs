//! Metrics HTTP endpoint
//!
//! Serves the [`EsiMetrics`] snapshot in Prometheus text format on its own
//! port, followed by anything registered with the default Prometheus
//! registry (purge counters).

use crate::metrics::{EsiMetrics, MetricsSnapshot};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<EsiMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use pingora_esi::metrics::EsiMetrics;
    /// use pingora_esi::metrics_endpoint::MetricsEndpoint;
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(EsiMetrics::new());
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<EsiMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Accept connections until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<EsiMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &EsiMetrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => {
            let mut body = format_prometheus_metrics(&metrics.get_stats());
            body.push_str(&gather_registry());
            text_response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                body,
            )
        }
        "/health" => text_response(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        ),
        "/" => text_response(
            StatusCode::OK,
            "text/plain; charset=utf-8",
            "pingora-esi metrics\n\n/metrics  Prometheus format metrics\n/health   health check\n"
                .to_string(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    }
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn gather_registry() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        warn!("Failed to encode registry metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP esi_{} {}", name, help);
    let _ = writeln!(out, "# TYPE esi_{} {}", name, kind);
    let _ = writeln!(out, "esi_{} {}\n", name, value);
}

/// Format a snapshot in Prometheus exposition format
fn format_prometheus_metrics(s: &MetricsSnapshot) -> String {
    let mut out = String::new();

    push_metric(&mut out, "requests_total", "counter", "Total number of requests seen", s.total_requests);
    push_metric(&mut out, "processed_requests_total", "counter", "Requests whose body went through ESI processing", s.processed_requests);
    push_metric(&mut out, "passthrough_requests_total", "counter", "Requests proxied without ESI processing", s.passthrough_requests);
    push_metric(&mut out, "degraded_requests_total", "counter", "Pages served unmodified after a scan failure", s.degraded_requests);

    push_metric(&mut out, "page_cache_hits_total", "counter", "Parsed page cache hits", s.page_cache_hits);
    push_metric(&mut out, "page_cache_misses_total", "counter", "Parsed page cache misses", s.page_cache_misses);
    push_metric(&mut out, "page_cache_hit_rate", "gauge", "Parsed page cache hit rate percentage", format!("{:.2}", s.page_cache_hit_rate()));
    push_metric(&mut out, "parses_total", "counter", "Page bodies scanned for tags", s.parses);
    push_metric(&mut out, "coalesced_waits_total", "counter", "Requests that waited on another request's scan", s.coalesced_waits);

    push_metric(&mut out, "fetches_total", "counter", "Resource fetches attempted", s.total_fetches);
    push_metric(&mut out, "failed_fetches_total", "counter", "Resource fetches that failed", s.failed_fetches);
    push_metric(&mut out, "cancelled_fetches_total", "counter", "Resource fetches abandoned on client cancel", s.cancelled_fetches);
    push_metric(&mut out, "fetch_failure_rate", "gauge", "Resource fetch failure rate percentage", format!("{:.2}", s.fetch_failure_rate()));
    push_metric(&mut out, "breaker_skips_total", "counter", "Resources skipped because their breaker was open", s.breaker_skips);
    push_metric(&mut out, "fallbacks_rendered_total", "counter", "Tags replaced by fallback content", s.fallbacks_rendered);
    push_metric(&mut out, "fragment_cache_hits_total", "counter", "Fragments served from the fragment cache", s.fragment_cache_hits);

    push_metric(&mut out, "bytes_from_origin_total", "counter", "Body bytes received from the origin", s.bytes_from_origin);
    push_metric(&mut out, "bytes_injected_total", "counter", "Fragment bytes spliced into pages", s.bytes_injected);
    push_metric(&mut out, "bytes_to_client_total", "counter", "Body bytes sent to clients", s.bytes_to_client);

    push_metric(&mut out, "request_duration_ms_avg", "gauge", "Average request duration in milliseconds", format!("{:.2}", s.avg_request_duration_ms()));
    push_metric(&mut out, "fetch_duration_ms_avg", "gauge", "Average resource fetch duration in milliseconds", format!("{:.2}", s.avg_fetch_duration_ms()));

    out
}
