//! Metrics collection for the ESI engine
//!
//! Lock-free counters updated on the request path and read by the metrics
//! endpoint as a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct EsiMetrics {
    // Requests
    total_requests: AtomicU64,
    processed_requests: AtomicU64,
    passthrough_requests: AtomicU64,
    degraded_requests: AtomicU64,

    // Page cache
    page_cache_hits: AtomicU64,
    page_cache_misses: AtomicU64,
    parses: AtomicU64,
    coalesced_waits: AtomicU64,

    // Fragment fetches
    total_fetches: AtomicU64,
    failed_fetches: AtomicU64,
    cancelled_fetches: AtomicU64,
    breaker_skips: AtomicU64,
    fallbacks_rendered: AtomicU64,
    fragment_cache_hits: AtomicU64,

    // Bytes
    bytes_from_origin: AtomicU64,
    bytes_injected: AtomicU64,
    bytes_to_client: AtomicU64,

    // Latency (microseconds)
    total_request_duration_us: AtomicU64,
    total_fetch_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub processed_requests: u64,
    pub passthrough_requests: u64,
    pub degraded_requests: u64,

    pub page_cache_hits: u64,
    pub page_cache_misses: u64,
    pub parses: u64,
    pub coalesced_waits: u64,

    pub total_fetches: u64,
    pub failed_fetches: u64,
    pub cancelled_fetches: u64,
    pub breaker_skips: u64,
    pub fallbacks_rendered: u64,
    pub fragment_cache_hits: u64,

    pub bytes_from_origin: u64,
    pub bytes_injected: u64,
    pub bytes_to_client: u64,

    pub total_request_duration_us: u64,
    pub total_fetch_duration_us: u64,
}

impl EsiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request
    ///
    /// # Arguments
    /// * `processed` - Whether ESI processing ran (true) or the response was passed through (false)
    pub fn record_request(&self, processed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if processed {
            self.processed_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A page served unmodified because its tags could not be scanned
    pub fn record_degraded(&self) {
        self.degraded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_cache_hit(&self) {
        self.page_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_cache_miss(&self) {
        self.page_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse(&self) {
        self.parses.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller that waited on another caller's in-flight parse
    pub fn record_coalesced_wait(&self) {
        self.coalesced_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fetch attempt against one resource
    ///
    /// # Arguments
    /// * `success` - Whether the fetch succeeded
    /// * `duration` - Time spent in the handler
    pub fn record_fetch(&self, success: bool, duration: Duration) {
        self.total_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_fetches.fetch_add(1, Ordering::Relaxed);
        }
        self.total_fetch_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_cancelled_fetch(&self) {
        self.cancelled_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// A resource skipped because its breaker was open
    pub fn record_breaker_skip(&self) {
        self.breaker_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment_cache_hit(&self) {
        self.fragment_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_from_origin(&self, bytes: u64) {
        self.bytes_from_origin.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_injected(&self, bytes: u64) {
        self.bytes_injected.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        self.total_request_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Fields are loaded one at a time, so the snapshot may not be perfectly
    /// consistent across fields under concurrent updates.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            processed_requests: self.processed_requests.load(Ordering::Relaxed),
            passthrough_requests: self.passthrough_requests.load(Ordering::Relaxed),
            degraded_requests: self.degraded_requests.load(Ordering::Relaxed),
            page_cache_hits: self.page_cache_hits.load(Ordering::Relaxed),
            page_cache_misses: self.page_cache_misses.load(Ordering::Relaxed),
            parses: self.parses.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            total_fetches: self.total_fetches.load(Ordering::Relaxed),
            failed_fetches: self.failed_fetches.load(Ordering::Relaxed),
            cancelled_fetches: self.cancelled_fetches.load(Ordering::Relaxed),
            breaker_skips: self.breaker_skips.load(Ordering::Relaxed),
            fallbacks_rendered: self.fallbacks_rendered.load(Ordering::Relaxed),
            fragment_cache_hits: self.fragment_cache_hits.load(Ordering::Relaxed),
            bytes_from_origin: self.bytes_from_origin.load(Ordering::Relaxed),
            bytes_injected: self.bytes_injected.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            total_request_duration_us: self.total_request_duration_us.load(Ordering::Relaxed),
            total_fetch_duration_us: self.total_fetch_duration_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.processed_requests,
            &self.passthrough_requests,
            &self.degraded_requests,
            &self.page_cache_hits,
            &self.page_cache_misses,
            &self.parses,
            &self.coalesced_waits,
            &self.total_fetches,
            &self.failed_fetches,
            &self.cancelled_fetches,
            &self.breaker_skips,
            &self.fallbacks_rendered,
            &self.fragment_cache_hits,
            &self.bytes_from_origin,
            &self.bytes_injected,
            &self.bytes_to_client,
            &self.total_request_duration_us,
            &self.total_fetch_duration_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl MetricsSnapshot {
    /// Page cache hit rate as a percentage (0.0 to 100.0)
    pub fn page_cache_hit_rate(&self) -> f64 {
        let total = self.page_cache_hits + self.page_cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.page_cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Fetch failure rate as a percentage (0.0 to 100.0)
    pub fn fetch_failure_rate(&self) -> f64 {
        if self.total_fetches == 0 {
            0.0
        } else {
            (self.failed_fetches as f64 / self.total_fetches as f64) * 100.0
        }
    }

    pub fn avg_request_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.total_request_duration_us as f64 / self.total_requests as f64) / 1000.0
        }
    }

    pub fn avg_fetch_duration_ms(&self) -> f64 {
        if self.total_fetches == 0 {
            0.0
        } else {
            (self.total_fetch_duration_us as f64 / self.total_fetches as f64) / 1000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_record_request() {
        let metrics = EsiMetrics::new();
        metrics.record_request(true);
        metrics.record_request(true);
        metrics.record_request(false);

        let stats = metrics.get_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.processed_requests, 2);
        assert_eq!(stats.passthrough_requests, 1);
    }

    #[test]
    fn test_page_cache_hit_rate() {
        let metrics = EsiMetrics::new();
        for _ in 0..3 {
            metrics.record_page_cache_hit();
        }
        metrics.record_page_cache_miss();
        assert_eq!(metrics.get_stats().page_cache_hit_rate(), 75.0);
        assert_eq!(MetricsSnapshot::default().page_cache_hit_rate(), 0.0);
    }

    #[test]
    fn test_fetch_stats() {
        let metrics = EsiMetrics::new();
        metrics.record_fetch(true, Duration::from_millis(10));
        metrics.record_fetch(false, Duration::from_millis(30));
        metrics.record_breaker_skip();
        metrics.record_fallback();

        let stats = metrics.get_stats();
        assert_eq!(stats.total_fetches, 2);
        assert_eq!(stats.failed_fetches, 1);
        assert_eq!(stats.fetch_failure_rate(), 50.0);
        assert_eq!(stats.avg_fetch_duration_ms(), 20.0);
        assert_eq!(stats.breaker_skips, 1);
        assert_eq!(stats.fallbacks_rendered, 1);
    }

    #[test]
    fn test_reset() {
        let metrics = EsiMetrics::new();
        metrics.record_request(true);
        metrics.record_bytes_injected(100);
        metrics.record_parse();
        metrics.reset();
        assert_eq!(metrics.get_stats(), MetricsSnapshot::default());
    }

    #[test]
    fn test_thread_safety() {
        let metrics = Arc::new(EsiMetrics::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_request(true);
                        m.record_bytes_to_client(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = metrics.get_stats();
        assert_eq!(stats.total_requests, 1000);
        assert_eq!(stats.bytes_to_client, 10_000);
    }
}
