//! Retry and fallback execution.
//!
//! Failures are classified from the error text (and any HTTP status code
//! embedded in it) to decide between local retry with exponential backoff,
//! walking the provider's fallback chain, or surfacing immediately. Auth
//! failures never retry and never fall back: the fallback would almost
//! certainly fail auth too.

use crate::backend::{Backend, BackendResult};
use crate::config::RetryConfig;
use crate::reliability::ReliabilityTracker;
use crate::types::{now, GatewayRequest};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Rate-limited calls sleep at least this long between attempts.
const RATE_LIMIT_MIN_DELAY: Duration = Duration::from_secs(5);

/// Gemini free-tier rate limits resolve slowly; raise the per-call deadline
/// once a rate limit is observed.
const GEMINI_RATE_LIMIT_MIN_TIMEOUT_S: f64 = 600.0;

/// Classification of an error for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network errors, timeouts, 5xx, unknown.
    RetryableTransient,
    /// 429 and quota/throttle wording.
    RetryableRateLimit,
    /// 401/403 and credential wording.
    NonRetryableAuth,
    /// Other 4xx and malformed-request wording.
    NonRetryableClient,
    NonRetryablePermanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RetryableTransient => "retryable_transient",
            ErrorKind::RetryableRateLimit => "retryable_rate_limit",
            ErrorKind::NonRetryableAuth => "non_retryable_auth",
            ErrorKind::NonRetryableClient => "non_retryable_client",
            ErrorKind::NonRetryablePermanent => "non_retryable_permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RetryableTransient | ErrorKind::RetryableRateLimit
        )
    }

    /// Fallback happens on any failure except auth.
    pub fn allows_fallback(&self) -> bool {
        *self != ErrorKind::NonRetryableAuth
    }
}

/// Sniff an HTTP status code out of error text like `API error 429: …`.
pub fn extract_status_code(error: &str) -> Option<u16> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"error\s+(\d{3})",
            r"status\s+(\d{3})",
            r"http\s+(\d{3})",
            r"\b(\d{3})\b.*error",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("status pattern"))
        .collect()
    });
    let lower = error.to_lowercase();
    for pattern in patterns {
        if let Some(capture) = pattern.captures(&lower) {
            if let Ok(code) = capture[1].parse::<u16>() {
                if (100..600).contains(&code) {
                    return Some(code);
                }
            }
        }
    }
    None
}

/// Classify an error by status code first, then by message keywords.
/// Unknown errors default to transient (retryable).
pub fn classify_error(error: &str, status_code: Option<u16>) -> ErrorKind {
    if let Some(code) = status_code {
        match code {
            429 => return ErrorKind::RetryableRateLimit,
            401 | 403 => return ErrorKind::NonRetryableAuth,
            400..=499 => return ErrorKind::NonRetryableClient,
            500..=599 => return ErrorKind::RetryableTransient,
            _ => {}
        }
    }

    let lower = error.to_lowercase();

    const RATE_LIMIT: &[&str] = &["rate limit", "too many requests", "quota exceeded", "throttl"];
    if RATE_LIMIT.iter().any(|p| lower.contains(p)) {
        return ErrorKind::RetryableRateLimit;
    }

    const AUTH: &[&str] = &[
        "unauthorized",
        "authentication",
        "invalid api key",
        "api key not found",
        "forbidden",
        "access denied",
    ];
    if AUTH.iter().any(|p| lower.contains(p)) {
        return ErrorKind::NonRetryableAuth;
    }

    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "network",
        "temporary",
        "unavailable",
        "overloaded",
        "server error",
        "internal error",
        "bad gateway",
        "service unavailable",
    ];
    if TRANSIENT.iter().any(|p| lower.contains(p)) {
        return ErrorKind::RetryableTransient;
    }

    const CLIENT: &[&str] = &["invalid", "malformed", "bad request", "not found", "unsupported"];
    if CLIENT.iter().any(|p| lower.contains(p)) {
        return ErrorKind::NonRetryableClient;
    }

    ErrorKind::RetryableTransient
}

/// Whether error text indicates an authentication failure.
pub fn detect_auth_failure(error: &str) -> bool {
    classify_error(error, extract_status_code(error)) == ErrorKind::NonRetryableAuth
}

/// Backoff delay for one attempt, with the rate-limit floor applied.
pub fn retry_delay(config: &RetryConfig, kind: ErrorKind, attempt: u32) -> Duration {
    let delay = config.delay_for_attempt(attempt);
    if kind == ErrorKind::RetryableRateLimit {
        delay.max(RATE_LIMIT_MIN_DELAY)
    } else {
        delay
    }
}

/// One recorded failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptError {
    pub provider: String,
    pub error: String,
    pub error_kind: ErrorKind,
    pub attempt: u32,
    pub timestamp: f64,
}

/// State accumulated across retries and fallbacks for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RetryState {
    pub original_provider: String,
    pub final_provider: String,
    pub attempt: u32,
    pub total_attempts: u32,
    /// -1 while still on the primary; index into the fallback chain after.
    pub fallback_index: i32,
    pub errors: Vec<AttemptError>,
    pub start_time: f64,
}

impl RetryState {
    fn new(provider: &str) -> Self {
        Self {
            original_provider: provider.to_string(),
            final_provider: provider.to_string(),
            attempt: 0,
            total_attempts: 0,
            fallback_index: -1,
            errors: Vec::new(),
            start_time: now(),
        }
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_index >= 0
    }

    pub fn elapsed_ms(&self) -> f64 {
        (now() - self.start_time) * 1000.0
    }

    fn record_error(&mut self, provider: &str, error: &str, kind: ErrorKind) {
        self.errors.push(AttemptError {
            provider: provider.to_string(),
            error: error.to_string(),
            error_kind: kind,
            attempt: self.attempt,
            timestamp: now(),
        });
    }

    fn last_error_kind(&self) -> Option<ErrorKind> {
        self.errors.last().map(|e| e.error_kind)
    }
}

/// Executes requests with retry and fallback.
pub struct RetryExecutor {
    config: RetryConfig,
    backends: HashMap<String, Arc<dyn Backend>>,
    reliability: Arc<ReliabilityTracker>,
}

impl RetryExecutor {
    pub fn new(
        config: RetryConfig,
        backends: HashMap<String, Arc<dyn Backend>>,
        reliability: Arc<ReliabilityTracker>,
    ) -> Self {
        Self {
            config,
            backends,
            reliability,
        }
    }

    /// Run the request: retry on the current provider, then walk the
    /// fallback chain. Returns the last result plus the retry summary.
    pub async fn execute_with_retry(
        &self,
        request: &GatewayRequest,
    ) -> (BackendResult, RetryState) {
        let mut request = request.clone();
        let mut state = RetryState::new(&request.provider);

        if !self.config.enabled {
            let result = self.execute_once(&request).await;
            state.total_attempts = 1;
            return (result, state);
        }

        let fallbacks: Vec<String> = self
            .config
            .fallbacks(&request.provider)
            .into_iter()
            .filter(|p| self.backends.contains_key(p))
            .collect();

        loop {
            tracing::debug!(
                provider = %request.provider,
                fallback_index = state.fallback_index,
                "executing with retries"
            );
            let result = self.execute_with_retries(&mut request, &mut state).await;
            if result.success {
                return (result, state);
            }

            if !self.config.fallback_enabled {
                return (result, state);
            }

            // Auth failures poison the whole chain.
            if state.last_error_kind() == Some(ErrorKind::NonRetryableAuth) || result.auth_required()
            {
                return (result, state);
            }

            // Advance past fallbacks the reliability tracker flags unhealthy.
            let next = loop {
                state.fallback_index += 1;
                let Some(candidate) = fallbacks.get(state.fallback_index as usize) else {
                    break None;
                };
                if self.reliability.is_healthy(candidate) {
                    break Some(candidate.clone());
                }
                tracing::debug!(provider = %candidate, "skipping unhealthy fallback");
            };
            let Some(next) = next else {
                return (result, state);
            };

            tracing::info!(from = %request.provider, to = %next, "falling back");
            state.final_provider = next.clone();
            request.provider = next;
            state.attempt = 0;
        }
    }

    async fn execute_with_retries(
        &self,
        request: &mut GatewayRequest,
        state: &mut RetryState,
    ) -> BackendResult {
        let mut last: Option<BackendResult> = None;

        while state.attempt <= self.config.max_retries {
            state.total_attempts += 1;

            let result = self.execute_once(request).await;
            if result.success {
                return result;
            }

            let error = result.error.clone().unwrap_or_default();
            let kind = classify_error(&error, extract_status_code(&error));
            state.record_error(&request.provider, &error, kind);
            last = Some(result);

            if !kind.is_retryable() {
                break;
            }

            state.attempt += 1;
            if state.attempt > self.config.max_retries {
                break;
            }

            let delay = retry_delay(&self.config, kind, state.attempt - 1);
            if kind == ErrorKind::RetryableRateLimit && request.provider == "gemini" {
                ensure_min_timeout(request, GEMINI_RATE_LIMIT_MIN_TIMEOUT_S);
            }
            tracing::debug!(
                provider = %request.provider,
                attempt = state.attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        last.unwrap_or_else(|| BackendResult::fail("no result from execution"))
    }

    async fn execute_once(&self, request: &GatewayRequest) -> BackendResult {
        match self.backends.get(&request.provider) {
            Some(backend) => backend.execute(request).await,
            None => BackendResult::fail(format!(
                "No backend available for provider: {}",
                request.provider
            )),
        }
    }
}

fn ensure_min_timeout(request: &mut GatewayRequest, min_timeout_s: f64) {
    if request.timeout_s < min_timeout_s {
        request.timeout_s = min_timeout_s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::ReliabilityConfig;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_s: 0.001,
            max_delay_s: 0.005,
            ..RetryConfig::default()
        }
    }

    fn executor(
        config: RetryConfig,
        backends: Vec<(&str, Arc<MockBackend>)>,
    ) -> (RetryExecutor, Arc<ReliabilityTracker>) {
        let reliability = Arc::new(ReliabilityTracker::new(ReliabilityConfig::default()));
        let map: HashMap<String, Arc<dyn Backend>> = backends
            .into_iter()
            .map(|(name, b)| (name.to_string(), b as Arc<dyn Backend>))
            .collect();
        (
            RetryExecutor::new(config, map, reliability.clone()),
            reliability,
        )
    }

    #[test]
    fn test_classification_by_status() {
        assert_eq!(classify_error("", Some(429)), ErrorKind::RetryableRateLimit);
        assert_eq!(classify_error("", Some(401)), ErrorKind::NonRetryableAuth);
        assert_eq!(classify_error("", Some(403)), ErrorKind::NonRetryableAuth);
        assert_eq!(classify_error("", Some(404)), ErrorKind::NonRetryableClient);
        assert_eq!(classify_error("", Some(500)), ErrorKind::RetryableTransient);
        assert_eq!(classify_error("", Some(503)), ErrorKind::RetryableTransient);
    }

    #[test]
    fn test_classification_by_keywords() {
        assert_eq!(
            classify_error("quota exceeded for project", None),
            ErrorKind::RetryableRateLimit
        );
        assert_eq!(
            classify_error("request was throttled", None),
            ErrorKind::RetryableRateLimit
        );
        assert_eq!(
            classify_error("invalid api key provided", None),
            ErrorKind::NonRetryableAuth
        );
        assert_eq!(
            classify_error("connection refused", None),
            ErrorKind::RetryableTransient
        );
        assert_eq!(
            classify_error("malformed payload", None),
            ErrorKind::NonRetryableClient
        );
        // Unknown errors default to retryable.
        assert_eq!(
            classify_error("something inexplicable", None),
            ErrorKind::RetryableTransient
        );
    }

    #[test]
    fn test_status_extraction() {
        assert_eq!(extract_status_code("API error 429: slow down"), Some(429));
        assert_eq!(extract_status_code("upstream status 503"), Some(503));
        assert_eq!(extract_status_code("HTTP 401"), Some(401));
        assert_eq!(extract_status_code("no code here"), None);
        // Out-of-range numbers are not status codes.
        assert_eq!(extract_status_code("error 999"), None);
    }

    #[test]
    fn test_detect_auth_failure() {
        assert!(detect_auth_failure("API error 401: unauthorized"));
        assert!(detect_auth_failure("invalid api key"));
        assert!(!detect_auth_failure("API error 500: oops"));
    }

    #[test]
    fn test_rate_limit_delay_floor() {
        let config = fast_config(3);
        let transient = retry_delay(&config, ErrorKind::RetryableTransient, 0);
        assert!(transient < Duration::from_secs(1));
        let limited = retry_delay(&config, ErrorKind::RetryableRateLimit, 0);
        assert!(limited >= Duration::from_secs(5));
    }

    #[test]
    fn test_gemini_timeout_raise() {
        let mut request = GatewayRequest::new("gemini", "hi").with_timeout(120.0);
        ensure_min_timeout(&mut request, GEMINI_RATE_LIMIT_MIN_TIMEOUT_S);
        assert_eq!(request.timeout_s, 600.0);

        let mut long = GatewayRequest::new("gemini", "hi").with_timeout(900.0);
        ensure_min_timeout(&mut long, GEMINI_RATE_LIMIT_MIN_TIMEOUT_S);
        assert_eq!(long.timeout_s, 900.0);
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let alpha = Arc::new(MockBackend::fixed("alpha", "hi"));
        let (executor, _) = executor(fast_config(3), vec![("alpha", alpha.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(result.success);
        assert_eq!(state.total_attempts, 1);
        assert!(!state.fallback_used());
        assert_eq!(alpha.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_retried_until_success() {
        let alpha = Arc::new(MockBackend::script(
            "alpha",
            vec![
                MockBackend::failure("API error 503: unavailable"),
                MockBackend::failure("connection reset"),
                MockBackend::success("finally"),
            ],
        ));
        let (executor, _) = executor(fast_config(3), vec![("alpha", alpha.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("finally"));
        assert_eq!(state.total_attempts, 3);
        assert_eq!(state.errors.len(), 2);
        assert!(!state.fallback_used());
    }

    #[tokio::test]
    async fn test_auth_error_no_retry_no_fallback() {
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 401: unauthorized"));
        let beta = Arc::new(MockBackend::fixed("beta", "should not run"));
        let mut config = fast_config(3);
        config
            .fallback_chains
            .insert("alpha".to_string(), vec!["beta".to_string()]);
        let (executor, _) =
            executor(config, vec![("alpha", alpha.clone()), ("beta", beta.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(!result.success);
        assert_eq!(state.total_attempts, 1);
        assert!(!state.fallback_used());
        assert_eq!(beta.call_count(), 0);
        assert_eq!(
            state.errors[0].error_kind,
            ErrorKind::NonRetryableAuth
        );
    }

    #[tokio::test]
    async fn test_client_error_no_retry_but_falls_back() {
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 400: bad request"));
        let beta = Arc::new(MockBackend::fixed("beta", "rescued"));
        let mut config = fast_config(3);
        config
            .fallback_chains
            .insert("alpha".to_string(), vec!["beta".to_string()]);
        let (executor, _) =
            executor(config, vec![("alpha", alpha.clone()), ("beta", beta.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("rescued"));
        // Client errors skip local retries.
        assert_eq!(alpha.call_count(), 1);
        assert!(state.fallback_used());
        assert_eq!(state.final_provider, "beta");
    }

    #[tokio::test]
    async fn test_fallback_after_exhausted_retries() {
        // max_retries=2 → 3 attempts on primary, then the fallback succeeds.
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 500: boom"));
        let beta = Arc::new(MockBackend::fixed("beta", "fallback answer"));
        let mut config = fast_config(2);
        config
            .fallback_chains
            .insert("alpha".to_string(), vec!["beta".to_string()]);
        let (executor, _) =
            executor(config, vec![("alpha", alpha.clone()), ("beta", beta.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(result.success);
        assert_eq!(alpha.call_count(), 3);
        assert_eq!(state.total_attempts, 4);
        assert_eq!(state.fallback_index, 0);
        assert_eq!(state.original_provider, "alpha");
        assert_eq!(state.final_provider, "beta");
        assert!(state.fallback_used());
    }

    #[tokio::test]
    async fn test_unhealthy_fallback_skipped() {
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 500: down"));
        let beta = Arc::new(MockBackend::fixed("beta", "never"));
        let gamma = Arc::new(MockBackend::fixed("gamma", "healthy answer"));
        let mut config = fast_config(0);
        config.fallback_chains.insert(
            "alpha".to_string(),
            vec!["beta".to_string(), "gamma".to_string()],
        );
        let (executor, reliability) = executor(
            config,
            vec![
                ("alpha", alpha.clone()),
                ("beta", beta.clone()),
                ("gamma", gamma.clone()),
            ],
        );
        // Mark beta as needing re-auth so the chain skips it.
        for _ in 0..3 {
            reliability.record_failure("beta", true, false);
        }

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("healthy answer"));
        assert_eq!(beta.call_count(), 0);
        assert_eq!(state.final_provider, "gamma");
    }

    #[tokio::test]
    async fn test_all_fallbacks_exhausted_returns_last_failure() {
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 500: a"));
        let beta = Arc::new(MockBackend::failing("beta", "API error 500: b"));
        let mut config = fast_config(0);
        config
            .fallback_chains
            .insert("alpha".to_string(), vec!["beta".to_string()]);
        let (executor, _) =
            executor(config, vec![("alpha", alpha.clone()), ("beta", beta.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("500: b"));
        assert_eq!(state.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let (executor, _) = executor(fast_config(0), vec![]);
        let (result, _) = executor
            .execute_with_retry(&GatewayRequest::new("ghost", "q"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No backend available"));
    }

    #[tokio::test]
    async fn test_retry_disabled_single_attempt() {
        let alpha = Arc::new(MockBackend::failing("alpha", "API error 500: x"));
        let mut config = fast_config(5);
        config.enabled = false;
        let (executor, _) = executor(config, vec![("alpha", alpha.clone())]);

        let (result, state) = executor
            .execute_with_retry(&GatewayRequest::new("alpha", "q"))
            .await;
        assert!(!result.success);
        assert_eq!(state.total_attempts, 1);
        assert_eq!(alpha.call_count(), 1);
    }
}
