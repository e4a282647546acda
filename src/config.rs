//! Gateway configuration: YAML file plus `LLM_GATEWAY_*` environment
//! overrides (environment takes precedence).
//!
//! Every block has sensible defaults so a bare `GatewayConfig::default()`
//! yields a runnable gateway; the YAML file only has to name what differs.

use crate::error::{GatewayError, Result};
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub name: String,

    pub backend_type: BackendKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_priority")]
    pub priority: i64,

    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,

    #[serde(default)]
    pub rate_limit_rpm: Option<i64>,

    /// HTTP transport: base URL of the provider API.
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Name of the environment variable holding the credential.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// CLI transport: executable name or absolute path.
    #[serde(default)]
    pub cli_command: Option<String>,

    /// Static arguments placed before the prompt.
    #[serde(default)]
    pub cli_args: Vec<String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub cli_cwd: Option<String>,

    /// Extra environment variables for the child process.
    #[serde(default)]
    pub cli_env: HashMap<String, String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl ProviderConfig {
    /// Minimal HTTP provider config, mostly for tests.
    pub fn http(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend_type: BackendKind::HttpApi,
            enabled: true,
            priority: default_priority(),
            timeout_s: default_timeout_s(),
            rate_limit_rpm: None,
            api_base_url: Some(base_url.into()),
            api_key_env: None,
            cli_command: None,
            cli_args: Vec::new(),
            cli_cwd: None,
            cli_env: HashMap::new(),
            model: None,
            max_tokens: default_max_tokens(),
        }
    }

    /// Minimal CLI provider config, mostly for tests.
    pub fn cli(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend_type: BackendKind::CliExec,
            enabled: true,
            priority: default_priority(),
            timeout_s: default_timeout_s(),
            rate_limit_rpm: None,
            api_base_url: None,
            api_key_env: None,
            cli_command: Some(command.into()),
            cli_args: Vec::new(),
            cli_cwd: None,
            cli_env: HashMap::new(),
            model: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Retry and fallback behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_s")]
    pub base_delay_s: f64,

    #[serde(default = "default_max_delay_s")]
    pub max_delay_s: f64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    /// Ordered fallback providers per primary.
    #[serde(default)]
    pub fallback_chains: HashMap<String, Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            base_delay_s: default_base_delay_s(),
            max_delay_s: default_max_delay_s(),
            exponential_base: default_exponential_base(),
            jitter: true,
            fallback_enabled: true,
            fallback_chains: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry N (0-indexed): `base · exp_base^attempt`, capped at
    /// `max_delay_s`, multiplied by a jitter factor in `[0.5, 1.5)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_s * self.exponential_base.powi(attempt as i32);
        let mut delay = base.min(self.max_delay_s);
        if self.jitter {
            delay *= 0.5 + fastrand::f64();
        }
        Duration::from_secs_f64(delay)
    }

    /// Fallback chain for a provider; empty when none is configured.
    pub fn fallbacks(&self, provider: &str) -> Vec<String> {
        self.fallback_chains.get(provider).cloned().unwrap_or_default()
    }
}

/// Response cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_s")]
    pub default_ttl_s: f64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: i64,

    /// TTL overrides per provider.
    #[serde(default)]
    pub provider_ttl_s: HashMap<String, f64>,

    /// Responses shorter than this are never cached.
    #[serde(default = "default_min_response_length")]
    pub min_response_length: usize,

    /// Case-insensitive substrings that disqualify a message from caching.
    #[serde(default = "default_no_cache_patterns")]
    pub no_cache_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_s: default_cache_ttl_s(),
            max_entries: default_cache_max_entries(),
            provider_ttl_s: HashMap::new(),
            min_response_length: default_min_response_length(),
            no_cache_patterns: default_no_cache_patterns(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, provider: &str) -> f64 {
        self.provider_ttl_s
            .get(provider)
            .copied()
            .unwrap_or(self.default_ttl_s)
    }

    /// Whether a message is cache-eligible under the negative pattern list.
    pub fn should_cache_message(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        !self.no_cache_patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// Streaming delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Characters per chunk for simulated streaming.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay between simulated chunks.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: f64,

    /// Heartbeat is emitted after this much silence while upstream is open.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: f64,

    #[serde(default = "default_stream_timeout_s")]
    pub timeout_s: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            timeout_s: default_stream_timeout_s(),
        }
    }
}

/// Parallel fan-out behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_parallel_strategy")]
    pub default_strategy: String,

    #[serde(default = "default_parallel_timeout_s")]
    pub timeout_s: f64,

    #[serde(default = "default_parallel_concurrent")]
    pub max_concurrent: usize,

    /// Named provider groups addressed as `@name`.
    #[serde(default)]
    pub provider_groups: HashMap<String, Vec<String>>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: default_parallel_strategy(),
            timeout_s: default_parallel_timeout_s(),
            max_concurrent: default_parallel_concurrent(),
            provider_groups: HashMap::new(),
        }
    }
}

impl ParallelConfig {
    /// Members of a `@group` alias (accepts the name with or without `@`).
    pub fn group(&self, name: &str) -> Vec<String> {
        let name = name.trim_start_matches('@');
        self.provider_groups.get(name).cloned().unwrap_or_default()
    }
}

/// API authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_auth_header")]
    pub header_name: String,

    #[serde(default = "default_true")]
    pub allow_localhost: bool,

    /// Path prefixes that never require a key.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            header_name: default_auth_header(),
            allow_localhost: true,
            public_paths: default_public_paths(),
        }
    }
}

impl AuthConfig {
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| {
            if p == "/" {
                path == "/"
            } else {
                path.starts_with(p.as_str())
            }
        })
    }
}

/// Rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rpm")]
    pub requests_per_minute: i64,

    #[serde(default = "default_burst")]
    pub burst_size: i64,

    #[serde(default = "default_true")]
    pub by_api_key: bool,

    #[serde(default = "default_true")]
    pub by_ip: bool,

    /// Per-endpoint rpm overrides by path prefix.
    #[serde(default = "default_endpoint_limits")]
    pub endpoint_limits: HashMap<String, i64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_rpm(),
            burst_size: default_burst(),
            by_api_key: true,
            by_ip: true,
            endpoint_limits: default_endpoint_limits(),
        }
    }
}

/// Backend health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_s")]
    pub interval_s: f64,

    #[serde(default = "default_health_timeout_s")]
    pub timeout_s: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: default_health_interval_s(),
            timeout_s: default_health_timeout_s(),
        }
    }
}

/// Reliability-tracker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Auth failures at or above this mark the provider as needing re-auth.
    #[serde(default = "default_reauth_failures")]
    pub reauth_failures: u32,

    /// Providers scoring below this are excluded from fallback selection.
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            reauth_failures: default_reauth_failures(),
            min_score: default_min_score(),
        }
    }
}

/// Backpressure thresholds and step sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_min_concurrent")]
    pub min_concurrent: usize,

    #[serde(default = "default_bp_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_queue_depth_low")]
    pub queue_depth_low: usize,

    #[serde(default = "default_queue_depth_high")]
    pub queue_depth_high: usize,

    #[serde(default = "default_queue_depth_critical")]
    pub queue_depth_critical: usize,

    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: f64,

    #[serde(default = "default_latency_high_ms")]
    pub latency_high_ms: f64,

    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: f64,

    #[serde(default = "default_success_rate_low")]
    pub success_rate_low: f64,

    #[serde(default = "default_success_rate_critical")]
    pub success_rate_critical: f64,

    #[serde(default = "default_scale_up_step")]
    pub scale_up_step: usize,

    #[serde(default = "default_scale_down_step")]
    pub scale_down_step: usize,

    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: f64,

    #[serde(default = "default_evaluation_interval_s")]
    pub evaluation_interval_s: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            min_concurrent: default_min_concurrent(),
            max_concurrent: default_bp_max_concurrent(),
            queue_depth_low: default_queue_depth_low(),
            queue_depth_high: default_queue_depth_high(),
            queue_depth_critical: default_queue_depth_critical(),
            latency_target_ms: default_latency_target_ms(),
            latency_high_ms: default_latency_high_ms(),
            latency_critical_ms: default_latency_critical_ms(),
            success_rate_low: default_success_rate_low(),
            success_rate_critical: default_success_rate_critical(),
            scale_up_step: default_scale_up_step(),
            scale_down_step: default_scale_down_step(),
            cooldown_s: default_cooldown_s(),
            evaluation_interval_s: default_evaluation_interval_s(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,

    /// Path to the embedded database file.
    pub db_path: Option<PathBuf>,

    pub default_timeout_s: f64,

    /// Requests older than this are removed by the cleanup loop.
    pub request_ttl_hours: i64,

    pub max_queue_size: usize,
    pub max_concurrent_requests: usize,

    pub default_provider: String,

    pub log_level: String,

    pub providers: HashMap<String, ProviderConfig>,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub streaming: StreamConfig,
    pub parallel: ParallelConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub health_check: HealthCheckConfig,
    pub reliability: ReliabilityConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            db_path: None,
            default_timeout_s: 300.0,
            request_ttl_hours: 24,
            max_queue_size: 1000,
            max_concurrent_requests: 10,
            default_provider: "openai".to_string(),
            log_level: "info".to_string(),
            providers: HashMap::new(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            streaming: StreamConfig::default(),
            parallel: ParallelConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health_check: HealthCheckConfig::default(),
            reliability: ReliabilityConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: YAML file (if given or found at a default
    /// location), then environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::from_default_locations()?,
        };
        config.apply_env();
        config.normalize();
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse YAML config text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))
    }

    fn from_default_locations() -> Result<Self> {
        let candidates: Vec<PathBuf> = match std::env::var_os("HOME") {
            Some(home) => {
                let home = PathBuf::from(home);
                vec![
                    home.join(".config/llm-gateway/gateway.yaml"),
                    PathBuf::from("/etc/llm-gateway/gateway.yaml"),
                ]
            }
            None => vec![PathBuf::from("/etc/llm-gateway/gateway.yaml")],
        };
        for candidate in candidates {
            if candidate.exists() {
                return Self::from_file(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Environment variables take precedence over the file.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("LLM_GATEWAY_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("LLM_GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(db) = std::env::var("LLM_GATEWAY_DB") {
            self.db_path = Some(PathBuf::from(db));
        }
        if let Ok(timeout) = std::env::var("LLM_GATEWAY_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.default_timeout_s = timeout;
            }
        }
        if let Ok(provider) = std::env::var("LLM_GATEWAY_DEFAULT_PROVIDER") {
            self.default_provider = provider;
        }
        if let Ok(level) = std::env::var("LLM_GATEWAY_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Fill per-provider names from map keys and inherit the default timeout
    /// where a provider did not set one explicitly.
    fn normalize(&mut self) {
        for (name, provider) in self.providers.iter_mut() {
            if provider.name.is_empty() {
                provider.name = name.clone();
            }
        }
    }

    /// Database file path: configured, or the user data dir, or the cwd.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(ref p) = self.db_path {
            return p.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".local/share/llm-gateway/gateway.db"),
            None => PathBuf::from("gateway.db"),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_priority() -> i64 {
    50
}
fn default_timeout_s() -> f64 {
    300.0
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_s() -> f64 {
    1.0
}
fn default_max_delay_s() -> f64 {
    30.0
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_cache_ttl_s() -> f64 {
    3600.0
}
fn default_cache_max_entries() -> i64 {
    10_000
}
fn default_min_response_length() -> usize {
    10
}
fn default_no_cache_patterns() -> Vec<String> {
    [
        "current time",
        "current date",
        "today",
        "now",
        "latest",
        "recent",
        "weather",
        "stock price",
        "random",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_chunk_size() -> usize {
    50
}
fn default_chunk_delay_ms() -> f64 {
    50.0
}
fn default_heartbeat_interval_s() -> f64 {
    15.0
}
fn default_stream_timeout_s() -> f64 {
    300.0
}
fn default_parallel_strategy() -> String {
    "first_success".to_string()
}
fn default_parallel_timeout_s() -> f64 {
    60.0
}
fn default_parallel_concurrent() -> usize {
    5
}
fn default_auth_header() -> String {
    "X-API-Key".to_string()
}
fn default_public_paths() -> Vec<String> {
    ["/api/health", "/metrics", "/", "/docs"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_rpm() -> i64 {
    60
}
fn default_burst() -> i64 {
    10
}
fn default_endpoint_limits() -> HashMap<String, i64> {
    let mut limits = HashMap::new();
    limits.insert("/api/ask".to_string(), 30);
    limits.insert("/api/ask/stream".to_string(), 30);
    limits.insert("/api/admin".to_string(), 10);
    limits
}
fn default_health_interval_s() -> f64 {
    30.0
}
fn default_health_timeout_s() -> f64 {
    10.0
}
fn default_reauth_failures() -> u32 {
    3
}
fn default_min_score() -> f64 {
    0.3
}
fn default_min_concurrent() -> usize {
    2
}
fn default_bp_max_concurrent() -> usize {
    20
}
fn default_queue_depth_low() -> usize {
    10
}
fn default_queue_depth_high() -> usize {
    50
}
fn default_queue_depth_critical() -> usize {
    100
}
fn default_latency_target_ms() -> f64 {
    5000.0
}
fn default_latency_high_ms() -> f64 {
    15_000.0
}
fn default_latency_critical_ms() -> f64 {
    30_000.0
}
fn default_success_rate_low() -> f64 {
    0.8
}
fn default_success_rate_critical() -> f64 {
    0.5
}
fn default_scale_up_step() -> usize {
    2
}
fn default_scale_down_step() -> usize {
    1
}
fn default_cooldown_s() -> f64 {
    10.0
}
fn default_evaluation_interval_s() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 8765);
        assert_eq!(config.max_concurrent_requests, 10);
        assert!(config.cache.enabled);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.reliability.reauth_failures, 3);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
host: 0.0.0.0
port: 9000
default_provider: alpha
providers:
  alpha:
    backend_type: http_api
    api_base_url: https://api.example.com/v1
    api_key_env: ALPHA_API_KEY
    model: alpha-large
  beta:
    backend_type: cli_exec
    cli_command: beta
    cli_args: ["--quiet"]
    timeout_s: 120.0
retry:
  max_retries: 2
  fallback_chains:
    alpha: [beta]
parallel:
  provider_groups:
    trio: [alpha, beta, gamma]
"#;
        let mut config = GatewayConfig::from_yaml(yaml).unwrap();
        config.normalize();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.providers.len(), 2);

        let alpha = &config.providers["alpha"];
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.backend_type, BackendKind::HttpApi);
        assert_eq!(alpha.model.as_deref(), Some("alpha-large"));

        let beta = &config.providers["beta"];
        assert_eq!(beta.backend_type, BackendKind::CliExec);
        assert_eq!(beta.cli_args, vec!["--quiet"]);
        assert_eq!(beta.timeout_s, 120.0);

        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.fallbacks("alpha"), vec!["beta"]);
        assert!(config.retry.fallbacks("gamma").is_empty());

        assert_eq!(config.parallel.group("@trio"), vec!["alpha", "beta", "gamma"]);
        assert_eq!(config.parallel.group("trio").len(), 3);
    }

    #[test]
    fn test_retry_delay_exponential_without_jitter() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        // Capped at max_delay_s = 30
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_delay_jitter_range() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let d = config.delay_for_attempt(0).as_secs_f64();
            assert!((0.5..1.5).contains(&d), "jittered delay {} out of range", d);
        }
    }

    #[test]
    fn test_cache_negative_patterns() {
        let config = CacheConfig::default();
        assert!(config.should_cache_message("explain rust ownership"));
        assert!(!config.should_cache_message("What is the WEATHER like?"));
        assert!(!config.should_cache_message("give me the latest news"));
    }

    #[test]
    fn test_cache_ttl_override() {
        let mut config = CacheConfig::default();
        config.provider_ttl_s.insert("alpha".into(), 60.0);
        assert_eq!(config.ttl_for("alpha"), 60.0);
        assert_eq!(config.ttl_for("beta"), 3600.0);
    }

    #[test]
    fn test_auth_public_paths() {
        let config = AuthConfig::default();
        assert!(config.is_public("/api/health"));
        assert!(config.is_public("/metrics"));
        assert!(config.is_public("/"));
        assert!(!config.is_public("/api/ask"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let err = GatewayConfig::from_yaml("providers: [not, a, map]").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }
}
