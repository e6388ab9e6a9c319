//! Pingora ESI Server
//!
//! Loads configuration, sets up logging, starts the metrics endpoint and
//! runs the ESI proxy service.

use pingora_core::server::Server;
use pingora::proxy::http_proxy_service;
use pingora_esi::{EsiConfig, EsiProxy, MetricsEndpoint};
use std::env;
use std::net::SocketAddr;
use tracing::{error, info, Level};

/// Main entry point for the Pingora ESI server
///
/// # Usage
/// ```bash
/// # Start with default config (pingora_esi.yaml)
/// pingora-esi
///
/// # Start with custom config
/// pingora-esi /path/to/config.yaml
/// ```
fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "pingora_esi.yaml".to_string());
    let loaded = EsiConfig::from_file(&config_path);

    let level = loaded
        .as_ref()
        .ok()
        .and_then(|c| c.log_level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Pingora ESI Server");
    info!("Loading configuration from: {}", config_path);

    let config = match loaded {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  - Upstream address: {}", cfg.upstream_address);
            info!("  - Listen address: {}", cfg.listen_address);
            info!("  - ESI patterns: {:?}", cfg.esi_patterns);
            info!(
                "  - Breaker: {} failures, {} backoff steps of {} ms",
                cfg.max_failures, cfg.max_backoffs, cfg.backoff_base_ms
            );
            info!("  - Default fetch timeout: {} ms", cfg.default_timeout_ms);
            info!("  - Page cache: {:?}", cfg.page_cache.kind);
            info!("  - Resource aliases: {}", cfg.resources.len());
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure the configuration file exists and is valid");
            std::process::exit(1);
        }
    };

    let listen = config.listen_address.clone();
    let metrics_config = config.metrics_endpoint.clone().filter(|m| m.enabled);

    let proxy = match EsiProxy::from_config(config) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("Failed to create ESI proxy: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(metrics_config) = metrics_config {
        match metrics_config.address.parse::<SocketAddr>() {
            Ok(addr) => {
                let endpoint = MetricsEndpoint::new(proxy.processor().metrics().clone(), addr);
                std::thread::spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!("Failed to start metrics runtime: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = runtime.block_on(endpoint.start()) {
                        error!("Metrics endpoint error: {}", e);
                    }
                });
            }
            Err(e) => error!("Invalid metrics endpoint address: {}", e),
        }
    }

    let mut server = match Server::new(None) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create Pingora server: {}", e);
            std::process::exit(1);
        }
    };
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    proxy_service.add_tcp(&listen);
    info!("ESI proxy listening on http://{}", listen);

    server.add_service(proxy_service);
    server.run_forever();
}
