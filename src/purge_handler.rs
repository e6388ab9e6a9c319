//! HTTP PURGE handler for parsed-page invalidation
//!
//! Parsed pages never expire on their own, so a deploy that moves tags
//! around must be followed by a purge.
//!
//! - `PURGE /path?query` drops the GET and HEAD fingerprints for that page
//! - `PURGE /` with `X-Purge-All: true` drops every parsed page

use crate::error::{EsiError, Result};
use crate::page_cache::{fingerprint, PageCache};
use crate::purge_metrics::PurgeMetrics;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// PURGE request handler
pub struct PurgeHandler {
    cache: Arc<dyn PageCache>,
    variation_headers: Vec<String>,
    auth_token: Option<String>,
    metrics: Option<Arc<PurgeMetrics>>,
}

/// PURGE response body
#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub success: bool,
    pub purged_count: usize,
    pub path: Option<String>,
    pub message: String,
}

/// Whether `method` is the PURGE extension method
pub fn is_purge(method: &Method) -> bool {
    method.as_str().eq_ignore_ascii_case("PURGE")
}

impl PurgeHandler {
    /// `variation_headers` must match the processor's so purged
    /// fingerprints line up with cached ones
    pub fn new(cache: Arc<dyn PageCache>, variation_headers: Vec<String>) -> Self {
        Self {
            cache,
            variation_headers,
            auth_token: None,
            metrics: None,
        }
    }

    /// Require `Authorization: Bearer <token>` (or `X-Purge-Token`)
    pub fn with_auth(mut self, auth_token: impl Into<String>) -> Self {
        self.auth_token = Some(auth_token.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PurgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle an HTTP PURGE request
    pub fn handle_purge<B>(&self, req: &Request<B>) -> Result<Response<Full<Bytes>>> {
        let started = Instant::now();

        if !is_purge(req.method()) {
            return self.error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only PURGE method is allowed",
            );
        }

        if let Err(reason) = self.check_auth(req) {
            if let Some(metrics) = &self.metrics {
                metrics.record_rejected(reason);
            }
            warn!("Rejected purge for {}: {}", req.uri(), reason);
            return self.error_response(
                StatusCode::UNAUTHORIZED,
                "Invalid or missing authentication token",
            );
        }

        let purge_all = req
            .headers()
            .get("x-purge-all")
            .and_then(|h| h.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        let (purged_count, path, message) = if purge_all {
            self.evict_all()
        } else {
            self.evict_page(req)
        };

        if let Some(metrics) = &self.metrics {
            let scope = if purge_all { "all" } else { "page" };
            metrics.record_purge(scope, purged_count, started.elapsed().as_secs_f64());
        }

        self.json_response(
            StatusCode::OK,
            &PurgeResponse {
                success: true,
                purged_count,
                path,
                message,
            },
        )
    }

    fn evict_all(&self) -> (usize, Option<String>, String) {
        let count = self.cache.len();
        self.cache.clear();
        info!("Purged all {} parsed pages", count);
        (count, None, format!("Purged all {} parsed pages", count))
    }

    /// Drop the GET and HEAD fingerprints of the request's page
    fn evict_page<B>(&self, req: &Request<B>) -> (usize, Option<String>, String) {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let count = [Method::GET, Method::HEAD]
            .iter()
            .map(|m| fingerprint(m, &path, req.headers(), &self.variation_headers))
            .filter(|fp| self.cache.remove(*fp))
            .count();

        let message = if count == 0 {
            format!("No parsed pages found for {}", path)
        } else {
            info!("Purged {} parsed pages for {}", count, path);
            format!("Purged {} parsed pages for {}", count, path)
        };
        (count, Some(path), message)
    }

    /// Returns the failure reason for metrics
    fn check_auth<B>(&self, req: &Request<B>) -> std::result::Result<(), &'static str> {
        let Some(expected) = &self.auth_token else {
            return Ok(());
        };

        let bearer = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));
        let token = bearer.or_else(|| {
            req.headers()
                .get("x-purge-token")
                .and_then(|h| h.to_str().ok())
        });

        match token {
            None => Err("missing_token"),
            Some(t) if t == expected => Ok(()),
            Some(_) => Err("invalid_token"),
        }
    }

    fn json_response(
        &self,
        status: StatusCode,
        body: &PurgeResponse,
    ) -> Result<Response<Full<Bytes>>> {
        let json = serde_json::to_string(body)
            .map_err(|e| EsiError::InternalError(format!("Failed to serialize response: {}", e)))?;

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("cache-control", "no-cache, no-store, must-revalidate")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| EsiError::InternalError(format!("Failed to build response: {}", e)))
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Result<Response<Full<Bytes>>> {
        self.json_response(
            status,
            &PurgeResponse {
                success: false,
                purged_count: 0,
                path: None,
                message: message.to_string(),
            },
        )
    }
}
