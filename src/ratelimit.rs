//! Token-bucket rate limiting per caller identity.
//!
//! A bucket key is composed from the caller's API key id, IP address, and
//! endpoint according to the configuration flags. Buckets are created
//! lazily and swept when unused for an hour.

use crate::config::RateLimitConfig;
use crate::types::now;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

const SWEEP_INTERVAL_S: f64 = 300.0;
const STALE_BUCKET_S: f64 = 3600.0;

/// A token bucket: capacity = burst size, refill rate = rpm / 60.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_rate: f64,
    pub last_refill: f64,
}

impl TokenBucket {
    pub fn new(requests_per_minute: i64, burst_size: i64) -> Self {
        Self {
            capacity: burst_size as f64,
            tokens: burst_size as f64,
            refill_rate: requests_per_minute as f64 / 60.0,
            last_refill: now(),
        }
    }

    fn refill(&mut self) {
        let ts = now();
        let elapsed = (ts - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = ts;
    }

    /// Try to take `tokens` tokens, refilling first.
    pub fn consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Seconds until `tokens` tokens are available (0 when already there).
    pub fn time_until_available(&mut self, tokens: f64) -> f64 {
        self.refill();
        if self.tokens >= tokens {
            return 0.0;
        }
        (tokens - self.tokens) / self.refill_rate
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_after_s: f64,
    pub key: String,
}

impl RateLimitDecision {
    /// The standard response headers for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.max(0).to_string()),
            ("X-RateLimit-Reset-After", format!("{:.1}", self.reset_after_s)),
        ]
    }

    fn allow_all() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_after_s: 0.0,
            key: "disabled".to_string(),
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    last_sweep: Mutex<f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(now()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn bucket_key(&self, api_key_id: Option<&str>, ip: Option<&str>, endpoint: Option<&str>) -> String {
        let mut parts = Vec::new();
        if self.config.by_api_key {
            if let Some(key) = api_key_id {
                parts.push(format!("key:{}", key));
            }
        }
        if self.config.by_ip {
            if let Some(ip) = ip {
                parts.push(format!("ip:{}", ip));
            }
        }
        if let Some(endpoint) = endpoint {
            parts.push(format!("ep:{}", endpoint));
        }
        if parts.is_empty() {
            "global".to_string()
        } else {
            parts.join(":")
        }
    }

    fn limit_for_endpoint(&self, path: &str) -> i64 {
        for (prefix, limit) in &self.config.endpoint_limits {
            if path.starts_with(prefix.as_str()) {
                return *limit;
            }
        }
        self.config.requests_per_minute
    }

    /// Check one request against its bucket, consuming a token on success.
    ///
    /// The applicable rpm is the per-key override, else the endpoint
    /// override, else the default.
    pub fn check(
        &self,
        api_key_id: Option<&str>,
        ip: Option<&str>,
        endpoint: Option<&str>,
        key_rate_limit: Option<i64>,
    ) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::allow_all();
        }

        self.maybe_sweep();

        let limit = match (key_rate_limit, endpoint) {
            (Some(limit), _) => limit,
            (None, Some(path)) => self.limit_for_endpoint(path),
            (None, None) => self.config.requests_per_minute,
        };
        let key = self.bucket_key(api_key_id, ip, endpoint);

        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.clone())
            .or_insert_with(|| TokenBucket::new(limit, self.config.burst_size));

        let allowed = bucket.consume(1.0);
        let reset_after_s = if allowed {
            0.0
        } else {
            bucket.time_until_available(1.0)
        };
        RateLimitDecision {
            allowed,
            limit,
            remaining: bucket.tokens as i64,
            reset_after_s,
            key,
        }
    }

    fn maybe_sweep(&self) {
        let ts = now();
        {
            let mut last = self.last_sweep.lock().unwrap();
            if ts - *last < SWEEP_INTERVAL_S {
                return;
            }
            *last = ts;
        }
        self.sweep_stale(ts);
    }

    /// Remove buckets not refilled within the stale window.
    pub fn sweep_stale(&self, at: f64) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, bucket| at - bucket.last_refill < STALE_BUCKET_S);
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    #[cfg(test)]
    fn age_bucket(&self, key: &str, seconds: f64) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.last_refill -= seconds;
        }
    }
}
