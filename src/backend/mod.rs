//! Resource handlers and scheme dispatch
//!
//! Every `src` value is fetched through a [`ResourceHandler`]. URL values
//! (`scheme://...`) are dispatched on their scheme; anything else is an
//! alias naming a backend configured under `resources` in the config file.

pub mod http;
pub mod memory;
pub mod options;
pub mod shell;

pub use self::http::HttpHandler;
pub use self::memory::MemoryHandler;
pub use self::options::ResourceOptions;
pub use self::shell::ShellHandler;

use crate::config::EsiConfig;
use crate::error::{EsiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use ::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEME_SEPARATOR: &str = "://";

/// Everything a handler needs for one fetch
#[derive(Debug, Clone)]
pub struct ResourceArgs {
    /// Rendered resource URL, or the alias name for alias resources
    pub url: String,
    /// Rendered `key` attribute, if the tag has one
    pub key: Option<String>,
    pub timeout: Duration,
    pub max_body_size: usize,
    /// Inbound request headers selected by the tag's `forwardheaders`
    pub headers: HeaderMap,
    /// Inbound request line, for handlers that want request context
    pub method: String,
    pub uri: String,
    pub remote: String,
}

impl ResourceArgs {
    pub fn new(url: impl Into<String>, timeout: Duration, max_body_size: usize) -> Self {
        ResourceArgs {
            url: url.into(),
            key: None,
            timeout,
            max_body_size,
            headers: HeaderMap::new(),
            method: String::new(),
            uri: String::new(),
            remote: String::new(),
        }
    }

    /// The lookup key for key-value style backends
    ///
    /// Falls back to the part of the URL after the scheme when no `key` was given.
    pub fn lookup_key(&self) -> &str {
        if let Some(key) = &self.key {
            return key;
        }
        match self.url.split_once(SCHEME_SEPARATOR) {
            Some((_, rest)) => rest,
            None => &self.url,
        }
    }

    /// JSON form handed to external programs
    pub fn to_json(&self) -> serde_json::Value {
        let headers: HashMap<&str, &str> = self
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
            .collect();
        serde_json::json!({
            "url": self.url,
            "key": self.key,
            "timeout_ms": self.timeout.as_millis() as u64,
            "max_body_size": self.max_body_size,
            "headers": headers,
            "method": self.method,
            "uri": self.uri,
            "remote": self.remote,
        })
    }
}

/// Result of a successful fetch
#[derive(Debug, Clone, Default)]
pub struct ResourceResponse {
    pub header: HeaderMap,
    pub content: Bytes,
}

impl ResourceResponse {
    pub fn new(content: impl Into<Bytes>) -> Self {
        ResourceResponse {
            header: HeaderMap::new(),
            content: content.into(),
        }
    }
}

/// A backend that can fetch resource content
///
/// Implementations are shared across all in-flight requests and must be
/// safe for concurrent use.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn do_request(&self, args: &ResourceArgs) -> Result<ResourceResponse>;

    /// Release pooled connections or other backend state
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Split `scheme://rest`
///
/// # Returns
/// * `Err(EsiError::NotValid)` if there is no `://` or the scheme is empty
pub fn split_scheme(url: &str) -> Result<(&str, &str)> {
    match url.split_once(SCHEME_SEPARATOR) {
        Some((scheme, rest)) if !scheme.is_empty() => Ok((scheme, rest)),
        _ => Err(EsiError::NotValid(format!("not a resource URL: {:?}", url))),
    }
}

/// Build a handler for a configured backend
///
/// # Returns
/// * `Err(EsiError::NotSupported)` for schemes without a built-in client
pub fn build_handler(options: &ResourceOptions) -> Result<Arc<dyn ResourceHandler>> {
    match options.scheme.as_str() {
        "http" | "https" => Ok(Arc::new(HttpHandler::with_base(options)?)),
        "sh" => Ok(Arc::new(ShellHandler::from_options(options))),
        "memory" => Ok(Arc::new(MemoryHandler::new())),
        "redis" | "memcache" | "grpc" => Err(EsiError::NotSupported(format!(
            "no built-in {} client; register a handler for it",
            options.scheme
        ))),
        other => Err(EsiError::NotSupported(format!("unknown scheme: {}", other))),
    }
}

/// Scheme and alias tables
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    schemes: HashMap<String, Arc<dyn ResourceHandler>>,
    aliases: HashMap<String, Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `http` and `https` schemes
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        let http: Arc<dyn ResourceHandler> = Arc::new(HttpHandler::new()?);
        registry.register_scheme("http", http.clone());
        registry.register_scheme("https", http);
        Ok(registry)
    }

    /// Defaults plus one handler per configured alias
    ///
    /// The `sh` scheme is only registered when `allow_shell_urls` is set.
    /// A backend that cannot be built fails the whole registry so that
    /// misconfiguration surfaces at startup.
    pub fn from_config(config: &EsiConfig) -> Result<Self> {
        let mut registry = Self::with_defaults()?;
        if config.allow_shell_urls {
            warn!("sh:// URLs enabled: pages may run local programs");
            registry.register_scheme("sh", Arc::new(ShellHandler::new()));
        }
        for (alias, url) in &config.resources {
            let options = ResourceOptions::parse(url)?;
            let handler = build_handler(&options)?;
            info!("Registered resource alias {} ({})", alias, options.scheme);
            registry.register_alias(alias, handler);
        }
        Ok(registry)
    }

    pub fn register_scheme(&mut self, scheme: &str, handler: Arc<dyn ResourceHandler>) {
        self.schemes.insert(scheme.to_ascii_lowercase(), handler);
    }

    pub fn register_alias(&mut self, alias: &str, handler: Arc<dyn ResourceHandler>) {
        self.aliases.insert(alias.to_string(), handler);
    }

    /// Find the handler for a URL by scheme
    pub fn dispatch(&self, url: &str) -> Result<Arc<dyn ResourceHandler>> {
        let (scheme, _) = split_scheme(url)?;
        self.schemes
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| EsiError::NotSupported(format!("unsupported scheme: {}", scheme)))
    }

    /// Find the handler for a configured alias
    pub fn alias(&self, name: &str) -> Result<Arc<dyn ResourceHandler>> {
        self.aliases
            .get(name)
            .cloned()
            .ok_or_else(|| EsiError::NotSupported(format!("unknown resource alias: {}", name)))
    }

    /// Route a rendered resource value
    pub fn lookup(&self, value: &str, is_url: bool) -> Result<Arc<dyn ResourceHandler>> {
        if is_url {
            self.dispatch(value)
        } else {
            self.alias(value)
        }
    }

    /// Close every registered handler, logging failures
    pub async fn close_all(&self) {
        for (name, handler) in self.schemes.iter().chain(self.aliases.iter()) {
            match handler.close().await {
                Ok(()) => debug!("Closed resource handler {}", name),
                Err(e) => warn!("Failed to close resource handler {}: {}", name, e),
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.schemes.keys().collect();
        schemes.sort();
        let mut aliases: Vec<_> = self.aliases.keys().collect();
        aliases.sort();
        f.debug_struct("HandlerRegistry")
            .field("schemes", &schemes)
            .field("aliases", &aliases)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("redis://host:6379").unwrap(), ("redis", "host:6379"));
        assert!(matches!(split_scheme("host/path"), Err(EsiError::NotValid(_))));
        assert!(matches!(split_scheme("://x"), Err(EsiError::NotValid(_))));
    }

    #[test]
    fn test_dispatch_errors() {
        let mut registry = HandlerRegistry::new();
        registry.register_scheme("memory", Arc::new(MemoryHandler::new()));

        assert!(registry.dispatch("memory://a").is_ok());
        assert!(registry.dispatch("MEMORY://a").is_ok());
        assert!(matches!(
            registry.dispatch("gopher://x"),
            Err(EsiError::NotSupported(_))
        ));
        assert!(matches!(registry.dispatch("nope"), Err(EsiError::NotValid(_))));
    }

    #[test]
    fn test_alias_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register_alias("fragments", Arc::new(MemoryHandler::new()));

        assert!(registry.lookup("fragments", false).is_ok());
        assert!(matches!(
            registry.lookup("missing", false),
            Err(EsiError::NotSupported(_))
        ));
    }

    #[test]
    fn test_build_handler_unsupported() {
        let options = ResourceOptions::parse("redis://cache:6379?db=2").unwrap();
        assert!(matches!(build_handler(&options), Err(EsiError::NotSupported(_))));
        let options = ResourceOptions::parse("memory://local").unwrap();
        assert!(build_handler(&options).is_ok());
    }

    #[test]
    fn test_from_config_rejects_bad_backend() {
        let mut config = EsiConfig::default();
        config
            .resources
            .insert("cache".to_string(), "memcache://m1:11211".to_string());
        assert!(HandlerRegistry::from_config(&config).is_err());
    }

    #[test]
    fn test_shell_scheme_needs_opt_in() {
        let registry = HandlerRegistry::from_config(&EsiConfig::default()).unwrap();
        assert!(matches!(
            registry.dispatch("sh:///bin/cat"),
            Err(EsiError::NotSupported(_))
        ));
        assert!(registry.dispatch("https://fragments/nav").is_ok());

        let mut config = EsiConfig::default();
        config.allow_shell_urls = true;
        let registry = HandlerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.dispatch("sh:///bin/cat").unwrap().name(), "sh");
    }

    #[test]
    fn test_shell_alias_without_opt_in() {
        let mut config = EsiConfig::default();
        config
            .resources
            .insert("render".to_string(), "sh:///usr/local/bin/render".to_string());
        let registry = HandlerRegistry::from_config(&config).unwrap();
        assert!(registry.lookup("render", false).is_ok());
        assert!(registry.dispatch("sh:///bin/cat").is_err());
    }

    #[test]
    fn test_lookup_key_fallback() {
        let mut args = ResourceArgs::new("memory://greeting", Duration::from_secs(1), 1024);
        assert_eq!(args.lookup_key(), "greeting");
        args.key = Some("user/42".to_string());
        assert_eq!(args.lookup_key(), "user/42");
    }

    #[test]
    fn test_args_json() {
        let mut args = ResourceArgs::new("sh:///bin/cat", Duration::from_millis(1500), 10);
        args.headers.insert("x-a", "1".parse().unwrap());
        let json = args.to_json();
        assert_eq!(json["url"], "sh:///bin/cat");
        assert_eq!(json["timeout_ms"], 1500);
        assert_eq!(json["headers"]["x-a"], "1");
        assert!(json["key"].is_null());
    }
}
