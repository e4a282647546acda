//! Core gateway entities: requests, responses, provider health.
//!
//! All timestamps are POSIX seconds as `f64`, matching the persisted layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as POSIX seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Lifecycle state of a gateway request.
///
/// Transitions: `Queued → Processing → {Completed, Failed, Timeout}`,
/// `Queued → Cancelled`, `Processing → Cancelled`. Terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RequestStatus {
    /// Returns `true` for states that can never be left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Failed
                | RequestStatus::Timeout
                | RequestStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RequestStatus::Queued),
            "processing" => Some(RequestStatus::Processing),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            "timeout" => Some(RequestStatus::Timeout),
            "cancelled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }
}

/// Transport kind of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    HttpApi,
    CliExec,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HttpApi => "http_api",
            BackendKind::CliExec => "cli_exec",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http_api" => Some(BackendKind::HttpApi),
            "cli_exec" => Some(BackendKind::CliExec),
            _ => None,
        }
    }
}

/// A unit of work: one text-completion request bound for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Globally unique opaque id.
    pub id: String,

    /// Target provider name, or a `@group` alias for parallel execution.
    pub provider: String,

    /// The prompt text. May be long.
    pub message: String,

    pub status: RequestStatus,

    /// Higher integer = dequeued earlier.
    pub priority: i64,

    /// Per-request deadline, enforced independently of transport timeouts.
    pub timeout_s: f64,

    pub created_at: f64,
    pub updated_at: f64,
    pub backend_kind: Option<BackendKind>,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,

    /// Free-form caller metadata, persisted alongside the request.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl GatewayRequest {
    /// Build a fresh queued request with a random id.
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let ts = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            message: message.into(),
            status: RequestStatus::Queued,
            priority: 50,
            timeout_s: 300.0,
            created_at: ts,
            updated_at: ts,
            backend_kind: None,
            started_at: None,
            completed_at: None,
            metadata: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    /// Whether the target names a provider group rather than a single provider.
    pub fn is_group(&self) -> bool {
        self.provider.starts_with('@')
    }
}

/// Terminal outcome of a request, owned by that request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub request_id: String,

    /// Mirrors the request's terminal state.
    pub status: RequestStatus,

    /// Assistant text. Set for `Completed`, mutually exclusive with `error`.
    pub response: Option<String>,

    /// Error text. Set for `Failed`/`Timeout`/`Cancelled`.
    pub error: Option<String>,

    /// Provider that actually produced the response; differs from the
    /// requested one when fallback occurred.
    pub provider: Option<String>,

    pub latency_ms: Option<f64>,
    pub tokens_used: Option<i64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,

    /// Reasoning trace extracted from the raw output, when present.
    pub thinking: Option<String>,

    /// Raw backend output before cleaning.
    pub raw_output: Option<String>,
}

impl GatewayResponse {
    pub fn new(request_id: impl Into<String>, status: RequestStatus) -> Self {
        Self {
            request_id: request_id.into(),
            status,
            response: None,
            error: None,
            provider: None,
            latency_ms: None,
            tokens_used: None,
            metadata: None,
            thinking: None,
            raw_output: None,
        }
    }
}

/// Live health view of a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unavailable,
    Unknown,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Degraded => "degraded",
            ProviderStatus::Unavailable => "unavailable",
            ProviderStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(ProviderStatus::Healthy),
            "degraded" => Some(ProviderStatus::Degraded),
            "unavailable" => Some(ProviderStatus::Unavailable),
            "unknown" => Some(ProviderStatus::Unknown),
            _ => None,
        }
    }
}

/// Rolling health snapshot of one provider, maintained by the health-check
/// loop and the request flow's metric accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub backend_kind: BackendKind,
    pub status: ProviderStatus,
    pub queue_depth: i64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub last_check: Option<f64>,
    pub error: Option<String>,
    pub enabled: bool,
    pub priority: i64,
    pub rate_limit_rpm: Option<i64>,
    pub timeout_s: f64,
}

impl ProviderInfo {
    pub fn new(name: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend_kind,
            status: ProviderStatus::Unknown,
            queue_depth: 0,
            avg_latency_ms: 0.0,
            success_rate: 1.0,
            last_check: None,
            error: None,
            enabled: true,
            priority: 50,
            rate_limit_rpm: None,
            timeout_s: 300.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!RequestStatus::Queued.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Timeout.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Timeout,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RequestStatus::parse("bogus"), None);
    }

    #[test]
    fn test_backend_kind_round_trip() {
        assert_eq!(BackendKind::parse("http_api"), Some(BackendKind::HttpApi));
        assert_eq!(BackendKind::parse("cli_exec"), Some(BackendKind::CliExec));
        assert_eq!(BackendKind::parse("fifo"), None);
    }

    #[test]
    fn test_request_builder() {
        let r = GatewayRequest::new("alpha", "hello")
            .with_priority(80)
            .with_timeout(12.5);
        assert_eq!(r.provider, "alpha");
        assert_eq!(r.priority, 80);
        assert_eq!(r.timeout_s, 12.5);
        assert_eq!(r.status, RequestStatus::Queued);
        assert!(!r.id.is_empty());
        assert!(!r.is_group());
    }

    #[test]
    fn test_group_alias_detection() {
        let r = GatewayRequest::new("@trio", "hello");
        assert!(r.is_group());
    }

    #[test]
    fn test_unique_ids() {
        let a = GatewayRequest::new("alpha", "x");
        let b = GatewayRequest::new("alpha", "x");
        assert_ne!(a.id, b.id);
    }
}
