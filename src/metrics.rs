//! Prometheus metrics for the offline cache engine
//!
//! Every runtime owns its own [`Registry`], so several engines (one per test, or
//! one per generation under test) never collide on metric names.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metrics collected by the engine
#[derive(Clone)]
pub struct OfflineMetrics {
    registry: Registry,

    /// Intercepted requests by category and response source
    requests_total: IntCounterVec,

    /// Primary partition lookups by result (hit/miss)
    cache_lookups_total: IntCounterVec,

    /// Cache writes that failed and were skipped
    cache_write_failures_total: IntCounter,

    /// Network fetches by outcome (success/error_status/transport_error)
    network_fetches_total: IntCounterVec,

    /// Fallback responses by kind (offline_page/cross_partition/synthesized)
    fallback_responses_total: IntCounterVec,

    /// Install attempts by result
    installs_total: IntCounterVec,

    /// Replayed pending operations by result
    sync_replays_total: IntCounterVec,

    /// Pending operations currently queued
    sync_queue_depth: IntGauge,

    /// Request handling duration by strategy
    request_duration_seconds: HistogramVec,
}

/// Point-in-time copy of the counters, mainly for tests and logging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_write_failures: u64,
    pub network_success: u64,
    pub network_error_status: u64,
    pub network_transport_errors: u64,
    pub offline_page_fallbacks: u64,
    pub cross_partition_fallbacks: u64,
    pub synthesized_fallbacks: u64,
    pub installs_succeeded: u64,
    pub installs_failed: u64,
    pub replays_succeeded: u64,
    pub replays_failed: u64,
    pub sync_queue_depth: i64,
}

impl MetricsSnapshot {
    /// Cache hit rate as a percentage of primary lookups
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}

impl OfflineMetrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("washcache_requests_total", "Total number of intercepted requests"),
            &["category", "source"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("washcache_cache_lookups_total", "Primary partition lookups"),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let cache_write_failures_total = IntCounter::new(
            "washcache_cache_write_failures_total",
            "Cache writes that failed",
        )?;
        registry.register(Box::new(cache_write_failures_total.clone()))?;

        let network_fetches_total = IntCounterVec::new(
            Opts::new("washcache_network_fetches_total", "Network fetches by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(network_fetches_total.clone()))?;

        let fallback_responses_total = IntCounterVec::new(
            Opts::new("washcache_fallback_responses_total", "Offline fallback responses"),
            &["kind"],
        )?;
        registry.register(Box::new(fallback_responses_total.clone()))?;

        let installs_total = IntCounterVec::new(
            Opts::new("washcache_installs_total", "Generation install attempts"),
            &["result"],
        )?;
        registry.register(Box::new(installs_total.clone()))?;

        let sync_replays_total = IntCounterVec::new(
            Opts::new("washcache_sync_replays_total", "Replayed pending operations"),
            &["result"],
        )?;
        registry.register(Box::new(sync_replays_total.clone()))?;

        let sync_queue_depth = IntGauge::new(
            "washcache_sync_queue_depth",
            "Pending operations waiting for background sync",
        )?;
        registry.register(Box::new(sync_queue_depth.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "washcache_request_duration_seconds",
                "Request handling duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["strategy"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            cache_lookups_total,
            cache_write_failures_total,
            network_fetches_total,
            fallback_responses_total,
            installs_total,
            sync_replays_total,
            sync_queue_depth,
            request_duration_seconds,
        })
    }

    /// Registry holding every metric of this instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, category: &str, source: &str) {
        self.requests_total.with_label_values(&[category, source]).inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn record_cache_write_failure(&self) {
        self.cache_write_failures_total.inc();
    }

    /// Record a network fetch
    ///
    /// `status` is `None` for a transport failure.
    pub fn record_fetch(&self, status: Option<u16>) {
        let outcome = match status {
            Some(s) if (200..300).contains(&s) => "success",
            Some(_) => "error_status",
            None => "transport_error",
        };
        self.network_fetches_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_fallback(&self, kind: &str) {
        self.fallback_responses_total.with_label_values(&[kind]).inc();
    }

    pub fn record_install(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.installs_total.with_label_values(&[result]).inc();
    }

    pub fn record_replay(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.sync_replays_total.with_label_values(&[result]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.sync_queue_depth.set(depth as i64);
    }

    pub fn record_duration(&self, strategy: &str, duration: Duration) {
        self.request_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration.as_secs_f64());
    }

    /// Copy the current counter values
    pub fn get_stats(&self) -> MetricsSnapshot {
        let lookups = |r: &str| self.cache_lookups_total.with_label_values(&[r]).get();
        let fetches = |o: &str| self.network_fetches_total.with_label_values(&[o]).get();
        let fallbacks = |k: &str| self.fallback_responses_total.with_label_values(&[k]).get();
        let installs = |r: &str| self.installs_total.with_label_values(&[r]).get();
        let replays = |r: &str| self.sync_replays_total.with_label_values(&[r]).get();

        MetricsSnapshot {
            cache_hits: lookups("hit"),
            cache_misses: lookups("miss"),
            cache_write_failures: self.cache_write_failures_total.get(),
            network_success: fetches("success"),
            network_error_status: fetches("error_status"),
            network_transport_errors: fetches("transport_error"),
            offline_page_fallbacks: fallbacks("offline_page"),
            cross_partition_fallbacks: fallbacks("cross_partition"),
            synthesized_fallbacks: fallbacks("synthesized"),
            installs_succeeded: installs("success"),
            installs_failed: installs("failure"),
            replays_succeeded: replays("success"),
            replays_failed: replays("failure"),
            sync_queue_depth: self.sync_queue_depth.get(),
        }
    }

    /// Encode every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = OfflineMetrics::new().unwrap();
        let b = OfflineMetrics::new().unwrap();
        a.record_cache_lookup(true);

        assert_eq!(a.get_stats().cache_hits, 1);
        assert_eq!(b.get_stats().cache_hits, 0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(OfflineMetrics::with_registry(registry.clone()).is_ok());
        assert!(OfflineMetrics::with_registry(registry).is_err());
    }

    #[test]
    fn test_fetch_outcomes() {
        let metrics = OfflineMetrics::new().unwrap();
        metrics.record_fetch(Some(200));
        metrics.record_fetch(Some(204));
        metrics.record_fetch(Some(404));
        metrics.record_fetch(None);

        let stats = metrics.get_stats();
        assert_eq!(stats.network_success, 2);
        assert_eq!(stats.network_error_status, 1);
        assert_eq!(stats.network_transport_errors, 1);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = OfflineMetrics::new().unwrap();
        assert_eq!(metrics.get_stats().cache_hit_rate(), 0.0);

        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        assert_eq!(metrics.get_stats().cache_hit_rate(), 75.0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = OfflineMetrics::new().unwrap();
        metrics.record_request("static", "cache");
        metrics.set_queue_depth(3);
        metrics.record_duration("cache_first", Duration::from_millis(4));

        let text = metrics.encode().unwrap();
        assert!(text.contains("washcache_requests_total{category=\"static\",source=\"cache\"} 1"));
        assert!(text.contains("washcache_sync_queue_depth 3"));
        assert!(text.contains("washcache_request_duration_seconds_bucket"));
    }
}
