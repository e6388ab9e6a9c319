//! Pingora ESI Module
//!
//! An Edge Side Includes engine for the Pingora proxy server. Origin pages
//! are scanned for `<esi:include .../>` tags, each tag's resources are
//! fetched from pluggable backends, and the fetched content is spliced back
//! into the page at the exact byte offsets where the tags occurred.
//!
//! # Features
//!
//! - **Streaming Scanner**: Finds tags across arbitrary chunk boundaries with bounded memory
//! - **Ordered Fallback**: Several `src` per tag, tried in order, with `onerror` text as last resort
//! - **Circuit Breakers**: Lock-free per-resource failure tracking with capped exponential backoff
//! - **Cancellation**: Client disconnects abort in-flight fetches without tripping breakers
//! - **Parse Coalescing**: Concurrent first requests for a page share one scan
//! - **Pluggable Backends**: HTTP, shell commands and in-memory stores behind one trait
//! - **Metrics Collection**: Prometheus endpoint for requests, fetches and caches
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pingora_esi::{EsiConfig, EsiProxy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EsiConfig::from_file("pingora_esi.yaml")?;
//! let proxy = EsiProxy::from_config(config)?;
//!
//! let stats = proxy.processor().metrics().get_stats();
//! println!("Total requests: {}", stats.total_requests);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`TagScanner`]: Byte-level state machine that finds tag boundaries
//! - [`Entity`]: One parsed tag with its resources, key, TTL, timeout and header rules
//! - [`CircuitBreaker`]: Per-resource failure bookkeeping
//! - [`ResourceResolver`]: Walks a tag's resources and fetches the first healthy one
//! - [`StreamInjector`]: Replays the original bytes with fetched content spliced in
//! - [`PageParser`]: Parsed-page cache plus single-flight scanning
//! - [`EsiProcessor`]: Ties the above together per request
//! - [`EsiProxy`]: Pingora `ProxyHttp` service
//!
//! # Configuration
//!
//! ```yaml
//! upstream_address: "origin.example.com:80"
//! esi_patterns:
//!   - "/shop/"
//!   - "*.html"
//! max_failures: 12
//! default_timeout_ms: 2000
//! resources:
//!   profiles: "redis://cache:6379?db=2"
//! ```
//!
//! See [`EsiConfig`] for every option.

pub mod backend;
pub mod cancel;
pub mod circuit_breaker;
pub mod condition;
pub mod config;
pub mod entity;
pub mod error;
pub mod esi_proxy;
pub mod fragment_cache;
pub mod injector;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod page_cache;
pub mod processor;
pub mod purge_handler;
pub mod purge_metrics;
pub mod request_analyzer;
pub mod resolver;
pub mod scanner;
pub mod template;

// Re-export commonly used types
pub use backend::{
    HandlerRegistry, HttpHandler, MemoryHandler, ResourceArgs, ResourceHandler, ResourceOptions,
    ResourceResponse, ShellHandler,
};
pub use cancel::{CancelHandle, CancelSignal};
pub use circuit_breaker::{Admission, BreakerPolicy, CircuitBreaker, CircuitState};
pub use condition::Condition;
pub use config::{EsiConfig, PageCacheKind};
pub use entity::{Entities, Entity, HeaderPolicy, Resource};
pub use error::{EsiError, Result};
pub use esi_proxy::{EsiContext, EsiProxy};
pub use fragment_cache::{FragmentCache, MemoryFragmentCache};
pub use injector::{copy_injected, inject_content, StreamInjector};
pub use metrics::{EsiMetrics, MetricsSnapshot};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{DataTag, DataTags};
pub use page_cache::{
    Coalescer, Fingerprint, LockedPageCache, PageCache, PageParser, ReadMostlyPageCache,
};
pub use processor::{EsiProcessor, ProcessedPage, ResponsePlan};
pub use purge_handler::PurgeHandler;
pub use request_analyzer::RequestAnalyzer;
pub use resolver::{Resolution, Resolved, ResourceResolver};
pub use scanner::{ScannerPool, TagScanner};
pub use template::{RequestInfo, Template, Value};
