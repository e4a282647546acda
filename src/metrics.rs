//! Prometheus metrics for the gateway.
//!
//! Registry and collectors are owned by the [`Dispatcher`](crate::dispatcher::Dispatcher)
//! and exposed as text on `GET /metrics`.

use crate::error::{GatewayError, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Latency histogram buckets in seconds.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_latency: HistogramVec,
    queue_depth: IntGaugeVec,
    active_connections: IntGauge,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    retries_total: IntCounterVec,
    fallbacks_total: IntCounterVec,
    rate_limit_hits: IntCounterVec,
    tokens_used: IntCounterVec,
    errors_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Total number of requests"),
            &["provider", "status"],
        )
        .map_err(prom_err)?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Request latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["provider"],
        )
        .map_err(prom_err)?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("gateway_queue_depth", "Current queue depth"),
            &["provider"],
        )
        .map_err(prom_err)?;
        let active_connections = IntGauge::new(
            "gateway_active_connections",
            "Number of active streaming connections",
        )
        .map_err(prom_err)?;
        let cache_hits =
            IntCounter::new("gateway_cache_hits_total", "Total cache hits").map_err(prom_err)?;
        let cache_misses =
            IntCounter::new("gateway_cache_misses_total", "Total cache misses").map_err(prom_err)?;
        let retries_total = IntCounterVec::new(
            Opts::new("gateway_retries_total", "Total number of retries"),
            &["provider", "reason"],
        )
        .map_err(prom_err)?;
        let fallbacks_total = IntCounterVec::new(
            Opts::new("gateway_fallbacks_total", "Total number of fallbacks"),
            &["from_provider", "to_provider"],
        )
        .map_err(prom_err)?;
        let rate_limit_hits = IntCounterVec::new(
            Opts::new("gateway_rate_limit_hits_total", "Total rate limit hits"),
            &["key_type"],
        )
        .map_err(prom_err)?;
        let tokens_used = IntCounterVec::new(
            Opts::new("gateway_tokens_used_total", "Total tokens used"),
            &["provider"],
        )
        .map_err(prom_err)?;
        let errors_total = IntCounterVec::new(
            Opts::new("gateway_errors_total", "Total errors"),
            &["provider", "error_type"],
        )
        .map_err(prom_err)?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_latency.clone()),
            Box::new(queue_depth.clone()),
            Box::new(active_connections.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(retries_total.clone()),
            Box::new(fallbacks_total.clone()),
            Box::new(rate_limit_hits.clone()),
            Box::new(tokens_used.clone()),
            Box::new(errors_total.clone()),
        ] {
            registry.register(collector).map_err(prom_err)?;
        }

        Ok(Self {
            registry,
            requests_total,
            request_latency,
            queue_depth,
            active_connections,
            cache_hits,
            cache_misses,
            retries_total,
            fallbacks_total,
            rate_limit_hits,
            tokens_used,
            errors_total,
        })
    }

    pub fn inc_requests(&self, provider: &str, status: &str) {
        self.requests_total
            .with_label_values(&[provider, status])
            .inc();
    }

    pub fn observe_latency(&self, provider: &str, seconds: f64) {
        self.request_latency
            .with_label_values(&[provider])
            .observe(seconds);
    }

    pub fn set_queue_depth(&self, provider: &str, depth: i64) {
        self.queue_depth.with_label_values(&[provider]).set(depth);
    }

    pub fn inc_active_connections(&self) {
        self.active_connections.inc();
    }

    pub fn dec_active_connections(&self) {
        self.active_connections.dec();
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn inc_retries(&self, provider: &str, reason: &str) {
        self.retries_total
            .with_label_values(&[provider, reason])
            .inc();
    }

    pub fn inc_fallbacks(&self, from_provider: &str, to_provider: &str) {
        self.fallbacks_total
            .with_label_values(&[from_provider, to_provider])
            .inc();
    }

    pub fn inc_rate_limit_hit(&self, key_type: &str) {
        self.rate_limit_hits.with_label_values(&[key_type]).inc();
    }

    pub fn add_tokens(&self, provider: &str, tokens: u64) {
        self.tokens_used
            .with_label_values(&[provider])
            .inc_by(tokens);
    }

    pub fn inc_errors(&self, provider: &str, error_type: &str) {
        self.errors_total
            .with_label_values(&[provider, error_type])
            .inc();
    }

    /// Prometheus text exposition of every registered collector.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| GatewayError::Other(e.to_string()))
    }
}

fn prom_err(e: prometheus::Error) -> GatewayError {
    GatewayError::Other(e.to_string())
}
