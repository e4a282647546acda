//! Rolling per-provider reliability scores used to filter unhealthy
//! providers out of fallback selection.

use crate::config::ReliabilityConfig;
use crate::types::now;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Rolling counters for one provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReliabilityScore {
    pub provider: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub auth_failure_count: u32,
    pub last_success: Option<f64>,
    pub last_failure: Option<f64>,
    pub last_auth_failure: Option<f64>,
}

impl ReliabilityScore {
    fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count + self.failure_count + self.timeout_count
    }

    /// Reliability in `[0, 1]`: 70% success rate, 30% auth-failure penalty.
    /// A provider with no history is assumed reliable.
    pub fn reliability(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        let success_rate = self.success_count as f64 / total as f64;
        let auth_penalty = (self.auth_failure_count as f64 * 0.1).min(0.3);
        (success_rate * 0.7 + (1.0 - auth_penalty) * 0.3).clamp(0.0, 1.0)
    }

    pub fn needs_reauth(&self, config: &ReliabilityConfig) -> bool {
        self.auth_failure_count >= config.reauth_failures
    }

    pub fn is_healthy(&self, config: &ReliabilityConfig) -> bool {
        !self.needs_reauth(config) && self.reliability() >= config.min_score
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        self.last_success = Some(now());
    }

    fn record_failure(&mut self, is_auth: bool, is_timeout: bool) {
        if is_timeout {
            self.timeout_count += 1;
        } else {
            self.failure_count += 1;
        }
        if is_auth {
            self.auth_failure_count += 1;
            self.last_auth_failure = Some(now());
        }
        self.last_failure = Some(now());
    }
}

/// Tracks reliability for every provider behind a single lock.
pub struct ReliabilityTracker {
    config: ReliabilityConfig,
    scores: Mutex<HashMap<String, ReliabilityScore>>,
}

impl ReliabilityTracker {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            scores: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, provider: &str) {
        let mut scores = self.scores.lock().unwrap();
        scores
            .entry(provider.to_string())
            .or_insert_with(|| ReliabilityScore::new(provider))
            .record_success();
    }

    pub fn record_failure(&self, provider: &str, is_auth: bool, is_timeout: bool) {
        let mut scores = self.scores.lock().unwrap();
        scores
            .entry(provider.to_string())
            .or_insert_with(|| ReliabilityScore::new(provider))
            .record_failure(is_auth, is_timeout);
    }

    /// Clear auth failures after a successful re-authentication.
    pub fn reset_auth(&self, provider: &str) {
        let mut scores = self.scores.lock().unwrap();
        if let Some(score) = scores.get_mut(provider) {
            score.auth_failure_count = 0;
            score.last_auth_failure = None;
        }
    }

    pub fn score(&self, provider: &str) -> ReliabilityScore {
        let scores = self.scores.lock().unwrap();
        scores
            .get(provider)
            .cloned()
            .unwrap_or_else(|| ReliabilityScore::new(provider))
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        self.score(provider).is_healthy(&self.config)
    }

    /// Filter a candidate list down to providers currently considered healthy.
    pub fn healthy_providers(&self, providers: &[String]) -> Vec<String> {
        providers
            .iter()
            .filter(|p| self.is_healthy(p))
            .cloned()
            .collect()
    }

    pub fn all_scores(&self) -> Vec<ReliabilityScore> {
        let scores = self.scores.lock().unwrap();
        let mut all: Vec<ReliabilityScore> = scores.values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ReliabilityTracker {
        ReliabilityTracker::new(ReliabilityConfig::default())
    }

    #[test]
    fn test_no_history_is_reliable() {
        let t = tracker();
        assert_eq!(t.score("alpha").reliability(), 1.0);
        assert!(t.is_healthy("alpha"));
    }

    #[test]
    fn test_score_formula() {
        let t = tracker();
        // 3 successes, 1 failure: success_rate = 0.75
        for _ in 0..3 {
            t.record_success("alpha");
        }
        t.record_failure("alpha", false, false);
        let score = t.score("alpha");
        assert!((score.reliability() - (0.75 * 0.7 + 0.3)).abs() < 1e-9);
        assert!(t.is_healthy("alpha"));
    }

    #[test]
    fn test_auth_failures_trigger_reauth() {
        let t = tracker();
        t.record_failure("alpha", true, false);
        t.record_failure("alpha", true, false);
        assert!(t.is_healthy("alpha") || !t.score("alpha").needs_reauth(&ReliabilityConfig::default()));
        t.record_failure("alpha", true, false);
        let score = t.score("alpha");
        assert!(score.needs_reauth(&ReliabilityConfig::default()));
        assert!(!t.is_healthy("alpha"));

        t.reset_auth("alpha");
        assert!(!t.score("alpha").needs_reauth(&ReliabilityConfig::default()));
    }

    #[test]
    fn test_low_success_rate_unhealthy() {
        let t = tracker();
        for _ in 0..20 {
            t.record_failure("alpha", false, false);
        }
        // success_rate 0 → score 0.3 boundary; still healthy at exactly 0.3.
        assert!((t.score("alpha").reliability() - 0.3).abs() < 1e-9);
        assert!(t.is_healthy("alpha"));

        // One auth failure drags it below the threshold.
        t.record_failure("alpha", true, false);
        assert!(t.score("alpha").reliability() < 0.3);
        assert!(!t.is_healthy("alpha"));
    }

    #[test]
    fn test_timeouts_counted_separately() {
        let t = tracker();
        t.record_failure("alpha", false, true);
        let score = t.score("alpha");
        assert_eq!(score.timeout_count, 1);
        assert_eq!(score.failure_count, 0);
        assert_eq!(score.total_requests(), 1);
    }

    #[test]
    fn test_healthy_filter() {
        let t = tracker();
        t.record_success("alpha");
        for _ in 0..3 {
            t.record_failure("beta", true, false);
        }
        let healthy = t.healthy_providers(&["alpha".to_string(), "beta".to_string()]);
        assert_eq!(healthy, vec!["alpha"]);
    }

    #[test]
    fn test_configurable_thresholds() {
        let t = ReliabilityTracker::new(ReliabilityConfig {
            reauth_failures: 1,
            min_score: 0.9,
        });
        t.record_failure("alpha", true, false);
        assert!(!t.is_healthy("alpha"));
    }
}
