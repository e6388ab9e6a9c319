//! HTTP resource handler

use super::{ResourceArgs, ResourceHandler, ResourceOptions, ResourceResponse};
use crate::error::{EsiError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::Client;
use std::time::Duration;
use url::Url;

/// Fetches `http://` and `https://` resources with a pooled client
///
/// When built from an alias with a base URL, the rendered key is resolved
/// relative to that base.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: Client,
    base: Option<Url>,
}

impl HttpHandler {
    pub fn new() -> Result<Self> {
        Ok(HttpHandler {
            client: build_client(DEFAULT_POOL_IDLE)?,
            base: None,
        })
    }

    /// Handler for an alias like `fragments: "http://frag.internal/v1/"`
    pub fn with_base(options: &ResourceOptions) -> Result<Self> {
        let base = Url::parse(&options.raw)
            .map_err(|e| EsiError::NotValid(format!("invalid base URL {:?}: {}", options.raw, e)))?;
        Ok(HttpHandler {
            client: build_client(options.max_idle)?,
            base: Some(base),
        })
    }

    fn target(&self, args: &ResourceArgs) -> Result<String> {
        match &self.base {
            None => Ok(args.url.clone()),
            Some(base) => {
                let key = args.key.as_deref().unwrap_or("");
                base.join(key)
                    .map(String::from)
                    .map_err(|e| EsiError::NotValid(format!("cannot join {:?} onto {}: {}", key, base, e)))
            }
        }
    }
}

const DEFAULT_POOL_IDLE: usize = 10;

fn build_client(pool_max_idle: usize) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(pool_max_idle)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| EsiError::BackendFatal(format!("failed to create HTTP client: {}", e)))
}

#[async_trait]
impl ResourceHandler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    async fn do_request(&self, args: &ResourceArgs) -> Result<ResourceResponse> {
        let url = self.target(args)?;
        let mut request = self.client.get(&url).headers(args.headers.clone());
        if !args.timeout.is_zero() {
            request = request.timeout(args.timeout);
        }

        let mut response = request.send().await.map_err(|e| map_reqwest(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EsiError::from_http_status(status.as_u16(), url));
        }

        if let Some(len) = response.content_length() {
            if len as usize > args.max_body_size {
                return Err(EsiError::HttpError(format!(
                    "{} declares {} bytes, limit is {}",
                    url, len, args.max_body_size
                )));
            }
        }

        let header = response.headers().clone();
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| map_reqwest(&url, e))? {
            if body.len() + chunk.len() > args.max_body_size {
                return Err(EsiError::HttpError(format!(
                    "{} body exceeds {} bytes",
                    url, args.max_body_size
                )));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!("Fetched {} ({} bytes)", url, body.len());
        Ok(ResourceResponse {
            header,
            content: body.freeze(),
        })
    }
}

fn map_reqwest(url: &str, err: reqwest::Error) -> EsiError {
    if err.is_timeout() {
        EsiError::Timeout(format!("{}: {}", url, err))
    } else {
        EsiError::HttpError(format!("Request to {} failed: {}", url, err))
    }
}
