//! Prometheus metrics for page cache purges
//!
//! Exposed alongside the engine counters by the metrics endpoint, which
//! appends everything gathered from the default registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

const LATENCY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Purge counters, cheap to clone
#[derive(Clone)]
pub struct PurgeMetrics {
    /// Accepted purges by `scope` (`page`, `all`) and `outcome` (`evicted`, `miss`)
    requests: IntCounterVec,
    /// Parsed pages dropped from the cache
    evicted: IntCounter,
    latency: Histogram,
    /// Rejected purges by `reason` (`missing_token`, `invalid_token`)
    rejected: IntCounterVec,
}

impl PurgeMetrics {
    /// Register on the process-wide default registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::register(prometheus::default_registry())
    }

    /// Register on `registry`
    ///
    /// Fails if purge metrics were already registered there.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = PurgeMetrics {
            requests: IntCounterVec::new(
                Opts::new("esi_purge_requests_total", "Accepted page cache purges"),
                &["scope", "outcome"],
            )?,
            evicted: IntCounter::new(
                "esi_purge_evicted_pages_total",
                "Parsed pages evicted by purges",
            )?,
            latency: Histogram::with_opts(
                HistogramOpts::new("esi_purge_duration_seconds", "Time spent evicting pages")
                    .buckets(LATENCY_BUCKETS.to_vec()),
            )?,
            rejected: IntCounterVec::new(
                Opts::new("esi_purge_rejected_total", "Purges refused for authentication"),
                &["reason"],
            )?,
        };

        registry.register(Box::new(metrics.requests.clone()))?;
        registry.register(Box::new(metrics.evicted.clone()))?;
        registry.register(Box::new(metrics.latency.clone()))?;
        registry.register(Box::new(metrics.rejected.clone()))?;
        Ok(metrics)
    }

    /// Record one completed purge
    pub fn record_purge(&self, scope: &str, evicted: usize, seconds: f64) {
        let outcome = if evicted == 0 { "miss" } else { "evicted" };
        self.requests.with_label_values(&[scope, outcome]).inc();
        self.evicted.inc_by(evicted as u64);
        self.latency.observe(seconds);
    }

    pub fn record_rejected(&self, reason: &str) {
        self.rejected.with_label_values(&[reason]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_on_private_registry() {
        let registry = Registry::new();
        let metrics = PurgeMetrics::register(&registry).unwrap();

        metrics.record_purge("page", 1, 0.001);
        metrics.record_purge("all", 0, 0.002);
        metrics.record_purge("all", 3, 0.002);
        metrics.record_rejected("invalid_token");

        assert_eq!(metrics.requests.with_label_values(&["page", "evicted"]).get(), 1);
        assert_eq!(metrics.requests.with_label_values(&["all", "miss"]).get(), 1);
        assert_eq!(metrics.evicted.get(), 4);
        assert_eq!(metrics.latency.get_sample_count(), 3);
        assert_eq!(metrics.rejected.with_label_values(&["invalid_token"]).get(), 1);

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"esi_purge_rejected_total".to_string()));
    }

    #[test]
    fn test_second_registration_fails() {
        let registry = Registry::new();
        PurgeMetrics::register(&registry).unwrap();
        assert!(PurgeMetrics::register(&registry).is_err());
    }
}
