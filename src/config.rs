//! Configuration management for the ESI proxy

use crate::backend::ResourceOptions;
use crate::circuit_breaker::BreakerPolicy;
use crate::error::{EsiError, Result};
use crate::scanner::DEFAULT_MAX_TAG_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the ESI proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EsiConfig {
    /// Origin server address (default: 127.0.0.1:8080)
    #[serde(default = "default_upstream")]
    pub upstream_address: String,

    /// Address the proxy listens on (default: 0.0.0.0:6188)
    #[serde(default = "default_listen")]
    pub listen_address: String,

    /// Path patterns eligible for ESI processing; empty means every path
    #[serde(default)]
    pub esi_patterns: Vec<String>,

    /// Consecutive failures before a resource is skipped (default: 12)
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Cap on the backoff exponent (default: 12)
    #[serde(default = "default_max_backoffs")]
    pub max_backoffs: u32,

    /// Backoff unit in milliseconds (default: 1000)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Fetch timeout when a tag does not set one (default: 20000)
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Fragment TTL when a tag does not set one; 0 disables fragment caching (default: 0)
    #[serde(default)]
    pub default_ttl_secs: u64,

    /// Largest origin page or fragment body accepted (default: 5MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Largest single ESI tag accepted by the scanner (default: 4096)
    #[serde(default = "default_max_tag_size")]
    pub max_tag_size: usize,

    /// Parsed-page cache settings
    #[serde(default)]
    pub page_cache: PageCacheConfig,

    /// Fetched-fragment cache settings
    #[serde(default)]
    pub fragment_cache: FragmentCacheConfig,

    /// Named backends: alias -> options URL
    #[serde(default)]
    pub resources: BTreeMap<String, String>,

    /// Let pages name `sh://` programs directly in `src` (default: false)
    ///
    /// Aliases configured under `resources` may use `sh` either way.
    #[serde(default)]
    pub allow_shell_urls: bool,

    /// Request headers folded into the page fingerprint
    #[serde(default)]
    pub page_variation_headers: Vec<String>,

    /// Log level for the binary (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,

    /// Purge configuration (optional)
    #[serde(default)]
    pub purge: Option<PurgeConfig>,
}

/// Which page cache implementation to use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageCacheKind {
    /// RwLock around a HashMap
    #[default]
    Locked,
    /// Lock-free clean snapshot plus a locked dirty overlay
    ReadMostly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PageCacheConfig {
    #[serde(default)]
    pub kind: PageCacheKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentCacheConfig {
    /// Whether fragments with a TTL are cached (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Byte budget for cached fragments (default: 64MB)
    #[serde(default = "default_fragment_cache_size")]
    pub max_size_bytes: usize,
}

impl Default for FragmentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_size_bytes: default_fragment_cache_size(),
        }
    }
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

/// Configuration for page cache purge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurgeConfig {
    /// Whether to accept PURGE requests (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Bearer token required on purge requests; unset means no authentication
    pub auth_token: Option<String>,

    /// Whether to record Prometheus metrics for purges (default: true)
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

fn default_upstream() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:6188".to_string()
}

fn default_max_failures() -> u32 {
    crate::circuit_breaker::DEFAULT_MAX_FAILURES
}

fn default_max_backoffs() -> u32 {
    crate::circuit_breaker::DEFAULT_MAX_BACKOFFS
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_body_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_tag_size() -> usize {
    DEFAULT_MAX_TAG_SIZE
}

fn default_fragment_cache_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EsiConfig {
    fn default() -> Self {
        EsiConfig {
            upstream_address: default_upstream(),
            listen_address: default_listen(),
            esi_patterns: Vec::new(),
            max_failures: default_max_failures(),
            max_backoffs: default_max_backoffs(),
            backoff_base_ms: default_backoff_base_ms(),
            default_timeout_ms: default_timeout_ms(),
            default_ttl_secs: 0,
            max_body_size: default_max_body_size(),
            max_tag_size: default_max_tag_size(),
            page_cache: PageCacheConfig::default(),
            fragment_cache: FragmentCacheConfig::default(),
            resources: BTreeMap::new(),
            allow_shell_urls: false,
            page_variation_headers: Vec::new(),
            log_level: default_log_level(),
            metrics_endpoint: None,
            purge: None,
        }
    }
}

impl EsiConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(EsiConfig)` if loading and validation succeed
    /// * `Err(EsiError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| EsiError::ConfigError(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EsiConfig = serde_yaml::from_str(content)
            .map_err(|e| EsiError::ConfigError(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - upstream_address and listen_address must not be empty
    /// - max_failures, default_timeout_ms, max_body_size must be > 0
    /// - max_tag_size must be between 16 bytes and max_body_size
    /// - every resources entry must be a valid options URL
    /// - log_level must be one of trace, debug, info, warn, error
    /// - an enabled metrics endpoint needs a socket address
    pub fn validate(&self) -> Result<()> {
        const MIN_TAG_SIZE: usize = 16;

        if self.upstream_address.trim().is_empty() {
            return Err(EsiError::ConfigError(
                "upstream_address must not be empty".to_string(),
            ));
        }
        if self.listen_address.trim().is_empty() {
            return Err(EsiError::ConfigError(
                "listen_address must not be empty".to_string(),
            ));
        }
        if self.max_failures == 0 {
            return Err(EsiError::ConfigError(
                "max_failures must be greater than 0".to_string(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(EsiError::ConfigError(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_body_size == 0 {
            return Err(EsiError::ConfigError(
                "max_body_size must be greater than 0".to_string(),
            ));
        }
        if self.max_tag_size < MIN_TAG_SIZE || self.max_tag_size > self.max_body_size {
            return Err(EsiError::ConfigError(format!(
                "max_tag_size must be between {} and max_body_size ({}), got {}",
                MIN_TAG_SIZE, self.max_body_size, self.max_tag_size
            )));
        }
        if self.fragment_cache.enabled && self.fragment_cache.max_size_bytes == 0 {
            return Err(EsiError::ConfigError(
                "fragment_cache.max_size_bytes must be greater than 0 when enabled".to_string(),
            ));
        }
        if self.esi_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(EsiError::ConfigError(
                "esi_patterns must not contain empty patterns".to_string(),
            ));
        }

        for (alias, url) in &self.resources {
            if alias.contains("://") {
                return Err(EsiError::ConfigError(format!(
                    "resource alias {:?} must not contain \"://\"",
                    alias
                )));
            }
            ResourceOptions::parse(url).map_err(|e| {
                EsiError::ConfigError(format!("resource {:?}: {}", alias, e))
            })?;
        }

        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(EsiError::ConfigError(format!(
                    "Invalid log_level '{}', must be trace, debug, info, warn or error",
                    other
                )))
            }
        }

        if let Some(metrics) = &self.metrics_endpoint {
            if metrics.enabled && metrics.address.parse::<SocketAddr>().is_err() {
                return Err(EsiError::ConfigError(format!(
                    "metrics_endpoint.address is not a socket address: {}",
                    metrics.address
                )));
            }
        }

        Ok(())
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy::new(
            self.max_failures,
            self.max_backoffs,
            Duration::from_millis(self.backoff_base_ms),
        )
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EsiConfig::default();
        assert_eq!(config.max_failures, 12);
        assert_eq!(config.max_backoffs, 12);
        assert_eq!(config.default_timeout(), Duration::from_secs(20));
        assert_eq!(config.default_ttl(), Duration::ZERO);
        assert_eq!(config.max_body_size, 5 * 1024 * 1024);
        assert_eq!(config.max_tag_size, 4096);
        assert_eq!(config.page_cache.kind, PageCacheKind::Locked);
        assert!(!config.allow_shell_urls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_breaker_policy() {
        let mut config = EsiConfig::default();
        config.backoff_base_ms = 250;
        let policy = config.breaker_policy();
        assert_eq!(policy.max_failures, 12);
        assert_eq!(policy.base, Duration::from_millis(250));
    }

    #[test]
    fn test_yaml_minimal() {
        let config = EsiConfig::from_yaml("upstream_address: \"origin:80\"\n").unwrap();
        assert_eq!(config.upstream_address, "origin:80");
        assert_eq!(config.listen_address, "0.0.0.0:6188");
    }

    #[test]
    fn test_yaml_page_cache_kind() {
        let config = EsiConfig::from_yaml("page_cache:\n  kind: read_mostly\n").unwrap();
        assert_eq!(config.page_cache.kind, PageCacheKind::ReadMostly);
        assert!(EsiConfig::from_yaml("page_cache:\n  kind: sharded\n").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EsiConfig::default();
        config.max_failures = 0;
        assert!(config.validate().is_err());

        let mut config = EsiConfig::default();
        config.max_tag_size = 8;
        assert!(config.validate().is_err());

        let mut config = EsiConfig::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = EsiConfig::default();
        config.esi_patterns = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = EsiConfig::default();
        config.metrics_endpoint = Some(MetricsEndpointConfig {
            enabled: true,
            address: "not-an-address".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_resources() {
        let mut config = EsiConfig::default();
        config
            .resources
            .insert("users".to_string(), "http://users.internal/v1/".to_string());
        assert!(config.validate().is_ok());

        config
            .resources
            .insert("broken".to_string(), "no-scheme-here".to_string());
        assert!(config.validate().is_err());
    }
}
