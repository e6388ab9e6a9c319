//! Decides which requests and origin responses get ESI processing

use crate::config::EsiConfig;
use http::{header, HeaderMap, Method, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Content types that may carry ESI tags
const TEXTUAL_TYPES: &[&str] = &[
    "text/",
    "application/xhtml+xml",
    "application/xml",
    "application/json",
    "application/javascript",
];

/// Analyzes requests and responses to determine if ESI processing applies
pub struct RequestAnalyzer {
    config: Arc<EsiConfig>,
}

impl RequestAnalyzer {
    pub fn new(config: Arc<EsiConfig>) -> Self {
        RequestAnalyzer { config }
    }

    /// Determine if a request is eligible for ESI processing
    ///
    /// # Logic
    /// Processing applies when:
    /// 1. The method is GET or HEAD
    /// 2. The request carries no Range header (offsets would not line up)
    /// 3. The path matches one of `esi_patterns` (or the list is empty)
    pub fn should_process(&self, method: &Method, path: &str, headers: &HeaderMap) -> bool {
        if method != Method::GET && method != Method::HEAD {
            debug!("ESI not applicable: method={} for path={}", method, path);
            return false;
        }

        if headers.contains_key(header::RANGE) {
            debug!("ESI not applicable: Range header present for path={}", path);
            return false;
        }

        if self.config.esi_patterns.is_empty() {
            return true;
        }

        let matches = self
            .config
            .esi_patterns
            .iter()
            .any(|p| pattern_matches(p, path));
        if !matches {
            debug!("ESI not applicable: path={} matches no esi_patterns", path);
        }
        matches
    }

    /// Determine if an origin response body should be scanned
    ///
    /// Only uncompressed 200 responses with a textual content type qualify.
    /// A missing Content-Type is treated as eligible; the injector's binary
    /// sniffing still guards the body.
    pub fn should_process_response(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        if status != StatusCode::OK {
            debug!("ESI not applicable: origin status {}", status);
            return false;
        }

        if let Some(encoding) = headers.get(header::CONTENT_ENCODING) {
            let encoding = encoding.to_str().unwrap_or("").trim();
            if !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity") {
                debug!("ESI not applicable: content-encoding {}", encoding);
                return false;
            }
        }

        match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            Some(content_type) => {
                let content_type = content_type.trim().to_ascii_lowercase();
                let textual = TEXTUAL_TYPES.iter().any(|t| content_type.starts_with(t));
                if !textual {
                    debug!("ESI not applicable: content-type {}", content_type);
                }
                textual
            }
            None => true,
        }
    }
}

/// The origin's declared Content-Length, if present and numeric
pub fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Glob-style match
///
/// - `*` matches any sequence of characters
/// - a pattern without `*` matches exactly or as a prefix
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return path.starts_with(pattern);
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = parts.split_first().unwrap_or((&"", &[]));
    let Some(mut remaining) = path.strip_prefix(first) else {
        return false;
    };

    let (last, middle) = rest.split_last().unwrap_or((&"", &[]));
    for part in middle {
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}
