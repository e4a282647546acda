//! Backend abstraction over heterogeneous AI providers.
//!
//! The [`Backend`] trait gives every provider the same contract regardless
//! of transport. Built-in implementations: [`HttpBackend`] (remote HTTP
//! APIs in three payload dialects) and [`CliBackend`] (local command-line
//! tools run as subprocesses). [`MockBackend`] backs deterministic tests.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──► GatewayRequest ──► Backend::execute() ──► BackendResult
//!                                         │
//!                              ┌──────────┴──────────┐
//!                          HttpBackend           CliBackend
//!                     anthropic/gemini/openai    subprocess
//!                          SSE streaming         output cleaning
//! ```

pub mod cli;
pub mod cli_output;
pub mod http;
pub mod mock;
pub mod sse;

pub use cli::CliBackend;
pub use http::HttpBackend;
pub use mock::MockBackend;

use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::types::{BackendKind, GatewayRequest};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Stream of chunks produced by a natively-streaming backend.
pub type ChunkStream = BoxStream<'static, StreamChunk>;

/// Uniform result of one backend execution.
///
/// Failures are data, not errors: the retry executor classifies the `error`
/// text to decide whether to retry or fall back.
#[derive(Debug, Clone, Default)]
pub struct BackendResult {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub tokens_used: Option<i64>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Reasoning trace separated from the response text.
    pub thinking: Option<String>,
    /// Output before cleaning, kept for auditing.
    pub raw_output: Option<String>,
}

impl BackendResult {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Insert one metadata key, creating the map if needed.
    pub fn insert_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
    }

    /// Whether the failure carries the distinguished auth-required flag.
    pub fn auth_required(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("auth_required"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// One increment of a streamed response.
#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub content: String,
    pub chunk_index: u64,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl StreamChunk {
    pub fn content(request_id: &str, content: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: content.into(),
            chunk_index,
            is_final: false,
            tokens_used: None,
            provider: None,
            metadata: None,
        }
    }

    pub fn final_chunk(request_id: &str, chunk_index: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            content: String::new(),
            chunk_index,
            is_final: true,
            tokens_used: None,
            provider: None,
            metadata: None,
        }
    }

    /// Terminal chunk carrying an error in its metadata.
    pub fn error_chunk(request_id: &str, chunk_index: u64, error: impl Into<String>) -> Self {
        let mut chunk = Self::final_chunk(request_id, chunk_index);
        chunk.metadata = Some(
            [("error".to_string(), serde_json::Value::String(error.into()))]
                .into_iter()
                .collect(),
        );
        chunk
    }

    /// Wire format for the SSE surface: `data: {json}\n\n`.
    pub fn to_sse(&self) -> String {
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {}\n\n", payload)
    }
}

/// Abstraction over provider transports.
///
/// Object-safe; the dispatcher holds backends as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a buffered completion. Failures come back as an unsuccessful
    /// [`BackendResult`], never as a panic or a hidden retry.
    async fn execute(&self, request: &GatewayRequest) -> BackendResult;

    /// Open a native chunk stream for the request, or `None` when the
    /// transport cannot stream (the stream manager then simulates chunking
    /// on top of [`execute`](Self::execute)).
    async fn execute_stream(&self, request: &GatewayRequest) -> Option<ChunkStream> {
        let _ = request;
        None
    }

    /// Cheap liveness probe; must not trigger slow auth flows.
    async fn health_check(&self) -> bool;

    /// Release transport resources. CLI backends have nothing to release.
    async fn shutdown(&self) {}

    /// Provider name for logging and result attribution.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;
}

/// Build the backend matching a provider's configured transport.
pub fn make_backend(config: &ProviderConfig) -> Result<Arc<dyn Backend>> {
    match config.backend_type {
        BackendKind::HttpApi => Ok(Arc::new(HttpBackend::new(config.clone())?)),
        BackendKind::CliExec => {
            if config.cli_command.is_none() {
                return Err(GatewayError::InvalidConfig(format!(
                    "provider {} has no cli_command",
                    config.name
                )));
            }
            Ok(Arc::new(CliBackend::new(config.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_constructors() {
        let ok = BackendResult::ok("hello").with_latency(12.0).with_tokens(3);
        assert!(ok.success);
        assert_eq!(ok.response.as_deref(), Some("hello"));
        assert_eq!(ok.tokens_used, Some(3));
        assert!(ok.error.is_none());

        let fail = BackendResult::fail("boom");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_auth_required_flag() {
        let mut result = BackendResult::fail("auth needed");
        assert!(!result.auth_required());
        result.insert_metadata("auth_required", serde_json::json!(true));
        assert!(result.auth_required());
    }

    #[test]
    fn test_chunk_sse_format() {
        let chunk = StreamChunk::content("req-1", "hi", 0);
        let sse = chunk.to_sse();
        assert!(sse.starts_with("data: {"));
        assert!(sse.ends_with("\n\n"));
        assert!(sse.contains("\"request_id\":\"req-1\""));
        assert!(sse.contains("\"is_final\":false"));
        // Unset optionals are omitted from the wire format.
        assert!(!sse.contains("tokens_used"));
    }

    #[test]
    fn test_error_chunk() {
        let chunk = StreamChunk::error_chunk("req-1", 4, "upstream died");
        assert!(chunk.is_final);
        assert_eq!(
            chunk.metadata.unwrap()["error"],
            serde_json::json!("upstream died")
        );
    }

    #[test]
    fn test_factory_rejects_cli_without_command() {
        let mut config = ProviderConfig::cli("broken", "x");
        config.cli_command = None;
        assert!(make_backend(&config).is_err());
    }

    #[test]
    fn test_factory_builds_by_kind() {
        let http = make_backend(&ProviderConfig::http("a", "https://api.example.com/v1")).unwrap();
        assert_eq!(http.kind(), BackendKind::HttpApi);
        let cli = make_backend(&ProviderConfig::cli("b", "echo")).unwrap();
        assert_eq!(cli.kind(), BackendKind::CliExec);
    }
}
