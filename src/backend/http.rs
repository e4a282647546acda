//! HTTP transport backend.
//!
//! One backend covers three upstream payload dialects, selected by a
//! detection rule on the configured base URL / provider name:
//!
//! - **Anthropic**: `POST {base}/messages`, `x-api-key` header, response in
//!   `content[*].text`, tokens from `usage.input_tokens + output_tokens`.
//! - **Gemini**: `POST {base}/models/{model}:generateContent?key=…`,
//!   response in `candidates[0].content.parts[*].text`, tokens from
//!   `usageMetadata.totalTokenCount`. No SSE support — streaming requests
//!   execute buffered and emit one final chunk.
//! - **OpenAI-compatible** (default): `POST {base}/chat/completions`, bearer
//!   auth, response in `choices[0].message.content`, tokens from
//!   `usage.total_tokens`.
//!
//! Streaming uses SSE over the same endpoints with `stream: true`.

use super::sse::SseDecoder;
use super::{Backend, BackendResult, ChunkStream, StreamChunk};
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::types::{BackendKind, GatewayRequest};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream payload dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    Gemini,
    OpenAi,
}

/// Pick the dialect from the provider's base URL and name.
pub fn detect_dialect(config: &ProviderConfig) -> Dialect {
    let base = config
        .api_base_url
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    if base.contains("anthropic") {
        Dialect::Anthropic
    } else if base.contains("generativelanguage.googleapis") || config.name == "gemini" {
        Dialect::Gemini
    } else {
        Dialect::OpenAi
    }
}

pub struct HttpBackend {
    config: ProviderConfig,
    dialect: Dialect,
    client: Client,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.config.name)
            .field("dialect", &self.dialect)
            .field("base_url", &self.config.api_base_url)
            .finish()
    }
}

impl HttpBackend {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let dialect = detect_dialect(&config);
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s.max(1.0)))
            .build()?;
        Ok(Self {
            config,
            dialect,
            client,
        })
    }

    fn api_key(&self) -> Option<String> {
        let var = self.config.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }

    fn base_url(&self) -> String {
        self.config
            .api_base_url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string()
    }

    fn model(&self) -> String {
        let fallback = match self.dialect {
            Dialect::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            Dialect::Gemini => DEFAULT_GEMINI_MODEL,
            Dialect::OpenAi => DEFAULT_OPENAI_MODEL,
        };
        self.config.model.clone().unwrap_or_else(|| fallback.to_string())
    }

    fn request_timeout(&self, request: &GatewayRequest) -> Duration {
        let secs = if request.timeout_s > 0.0 {
            request.timeout_s
        } else {
            self.config.timeout_s
        };
        Duration::from_secs_f64(secs.max(1.0))
    }

    /// Endpoint URL and request body for a dialect (without `stream`).
    fn build_call(&self, message: &str, api_key: &str, stream: bool) -> (String, Value) {
        let base = self.base_url();
        match self.dialect {
            Dialect::Anthropic => {
                let mut body = json!({
                    "model": self.model(),
                    "max_tokens": self.config.max_tokens,
                    "messages": [{"role": "user", "content": message}],
                });
                if stream {
                    body["stream"] = json!(true);
                }
                (format!("{}/messages", base), body)
            }
            Dialect::Gemini => {
                let url = format!(
                    "{}/models/{}:generateContent?key={}",
                    base,
                    self.model(),
                    api_key
                );
                let body = json!({
                    "contents": [{"parts": [{"text": message}]}],
                    "generationConfig": {"maxOutputTokens": self.config.max_tokens},
                });
                (url, body)
            }
            Dialect::OpenAi => {
                let mut body = json!({
                    "model": self.model(),
                    "max_tokens": self.config.max_tokens,
                    "messages": [{"role": "user", "content": message}],
                });
                if stream {
                    body["stream"] = json!(true);
                }
                (format!("{}/chat/completions", base), body)
            }
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        match self.dialect {
            Dialect::Anthropic => builder
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01"),
            // Gemini carries the key in the URL.
            Dialect::Gemini => builder,
            Dialect::OpenAi => builder.header("Authorization", format!("Bearer {}", api_key)),
        }
    }

    async fn execute_inner(&self, request: &GatewayRequest, api_key: &str) -> BackendResult {
        let (url, body) = self.build_call(&request.message, api_key, false);
        let sent = self
            .apply_auth(self.client.post(&url), api_key)
            .json(&body)
            .timeout(self.request_timeout(request))
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return BackendResult::fail(format!(
                    "Request timed out after {}s",
                    request.timeout_s
                ));
            }
            Err(e) => return BackendResult::fail(format!("connection error: {}", e)),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return BackendResult::fail(format!("API error {}: {}", status.as_u16(), text));
        }

        let data: Value = match resp.json().await {
            Ok(data) => data,
            Err(e) => return BackendResult::fail(format!("invalid JSON response: {}", e)),
        };

        let (text, tokens) = extract_content(self.dialect, &data);
        let mut result = BackendResult::ok(text);
        if tokens > 0 {
            result.tokens_used = Some(tokens);
        }
        if let Some(model) = data.get("model").and_then(|v| v.as_str()) {
            result.insert_metadata("model", json!(model));
        }
        result
    }

    /// SSE streaming for the Anthropic and OpenAI dialects. Chunks are sent
    /// into a bounded channel the caller drains.
    async fn stream_sse(&self, request: &GatewayRequest, api_key: String) -> ChunkStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<StreamChunk>(64);
        let (url, body) = self.build_call(&request.message, &api_key, true);
        let builder = self
            .apply_auth(self.client.post(&url), &api_key)
            .json(&body)
            .timeout(self.request_timeout(request));
        let dialect = self.dialect;
        let request_id = request.id.clone();
        let provider = self.config.name.clone();

        tokio::spawn(async move {
            let resp = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::error_chunk(&request_id, 0, e.to_string()))
                        .await;
                    return;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let _ = tx
                    .send(StreamChunk::error_chunk(
                        &request_id,
                        0,
                        format!("API error {}: {}", status.as_u16(), text),
                    ))
                    .await;
                return;
            }

            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut index: u64 = 0;
            let mut total_tokens: i64 = 0;
            let mut stopped = false;

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(StreamChunk::error_chunk(&request_id, index, e.to_string()))
                            .await;
                        return;
                    }
                };
                for frame in decoder.feed(&bytes) {
                    match stream_delta(dialect, &frame.data) {
                        StreamEvent::Content(text) => {
                            if !text.is_empty() {
                                if tx
                                    .send(StreamChunk::content(&request_id, text, index))
                                    .await
                                    .is_err()
                                {
                                    // Consumer went away; stop reading upstream.
                                    return;
                                }
                                index += 1;
                            }
                        }
                        StreamEvent::Tokens(tokens) => total_tokens = tokens,
                        StreamEvent::Stop => stopped = true,
                        StreamEvent::Ignore => {}
                    }
                }
                if stopped || decoder.done() {
                    break;
                }
            }

            let mut last = StreamChunk::final_chunk(&request_id, index);
            if total_tokens > 0 {
                last.tokens_used = Some(total_tokens);
            }
            last.provider = Some(provider);
            let _ = tx.send(last).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Interpretation of one SSE frame in a streaming response.
enum StreamEvent {
    Content(String),
    Tokens(i64),
    Stop,
    Ignore,
}

fn stream_delta(dialect: Dialect, data: &Value) -> StreamEvent {
    match dialect {
        Dialect::Anthropic => match data.get("type").and_then(|t| t.as_str()) {
            Some("content_block_delta") => {
                let delta = &data["delta"];
                if delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
                    StreamEvent::Content(
                        delta
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    )
                } else {
                    StreamEvent::Ignore
                }
            }
            Some("message_delta") | Some("message_stop") => {
                let usage = &data["usage"];
                let tokens = usage
                    .get("input_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0)
                    + usage
                        .get("output_tokens")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                if data["type"] == "message_stop" {
                    StreamEvent::Stop
                } else if tokens > 0 {
                    StreamEvent::Tokens(tokens)
                } else {
                    StreamEvent::Ignore
                }
            }
            _ => StreamEvent::Ignore,
        },
        Dialect::Gemini => StreamEvent::Ignore,
        Dialect::OpenAi => {
            let choice = &data["choices"][0];
            if let Some(content) = choice["delta"]["content"].as_str() {
                if !content.is_empty() {
                    return StreamEvent::Content(content.to_string());
                }
            }
            if choice.get("finish_reason").map(|v| !v.is_null()).unwrap_or(false) {
                let tokens = data["usage"]["total_tokens"].as_i64().unwrap_or(0);
                if tokens > 0 {
                    return StreamEvent::Tokens(tokens);
                }
            }
            StreamEvent::Ignore
        }
    }
}

/// Pull the completion text and token count out of a buffered response.
/// Shape mismatches yield empty text and zero tokens rather than an error.
pub fn extract_content(dialect: Dialect, data: &Value) -> (String, i64) {
    match dialect {
        Dialect::Anthropic => {
            let text = data["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b["type"] == "text")
                        .filter_map(|b| b["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let usage = &data["usage"];
            let tokens = usage["input_tokens"].as_i64().unwrap_or(0)
                + usage["output_tokens"].as_i64().unwrap_or(0);
            (text, tokens)
        }
        Dialect::Gemini => {
            let text = data["candidates"][0]["content"]["parts"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            let tokens = data["usageMetadata"]["totalTokenCount"].as_i64().unwrap_or(0);
            (text, tokens)
        }
        Dialect::OpenAi => {
            let text = data["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let tokens = data["usage"]["total_tokens"].as_i64().unwrap_or(0);
            (text, tokens)
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn execute(&self, request: &GatewayRequest) -> BackendResult {
        let start = Instant::now();
        let Some(api_key) = self.api_key() else {
            return BackendResult::fail(format!(
                "API key not found in environment variable: {}",
                self.config.api_key_env.as_deref().unwrap_or("<unset>")
            ))
            .with_latency(start.elapsed().as_secs_f64() * 1000.0);
        };
        let mut result = self.execute_inner(request, &api_key).await;
        result.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    }

    async fn execute_stream(&self, request: &GatewayRequest) -> Option<ChunkStream> {
        let api_key = match self.api_key() {
            Some(key) => key,
            None => {
                let request_id = request.id.clone();
                let env = self.config.api_key_env.clone().unwrap_or_default();
                let chunk = StreamChunk::error_chunk(
                    &request_id,
                    0,
                    format!("API key not found in environment variable: {}", env),
                );
                return Some(Box::pin(futures::stream::once(async move { chunk })));
            }
        };

        match self.dialect {
            // Gemini streaming is unsupported; buffered execution, one
            // final chunk carrying the whole response.
            Dialect::Gemini => {
                let result = self.execute(request).await;
                let mut chunk = if result.success {
                    let mut c = StreamChunk::content(
                        &request.id,
                        result.response.unwrap_or_default(),
                        0,
                    );
                    c.is_final = true;
                    c
                } else {
                    StreamChunk::error_chunk(
                        &request.id,
                        0,
                        result.error.unwrap_or_else(|| "unknown error".to_string()),
                    )
                };
                chunk.tokens_used = result.tokens_used;
                chunk.provider = Some(self.config.name.clone());
                Some(Box::pin(futures::stream::once(async move { chunk })))
            }
            Dialect::Anthropic | Dialect::OpenAi => {
                Some(self.stream_sse(request, api_key).await)
            }
        }
    }

    async fn health_check(&self) -> bool {
        let Some(api_key) = self.api_key() else {
            return false;
        };
        match self.dialect {
            // No cheap idempotent probe; configured credentials count.
            Dialect::Anthropic | Dialect::Gemini => true,
            Dialect::OpenAi => {
                let url = format!("{}/models", self.base_url());
                let resp = self
                    .client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", api_key))
                    .timeout(HEALTH_TIMEOUT)
                    .send()
                    .await;
                matches!(resp, Ok(resp) if resp.status().is_success())
            }
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::HttpApi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(name: &str, base: &str) -> ProviderConfig {
        let mut config = ProviderConfig::http(name, base);
        config.max_tokens = 1024;
        config
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(
            detect_dialect(&http_config("claude", "https://api.anthropic.com/v1")),
            Dialect::Anthropic
        );
        assert_eq!(
            detect_dialect(&http_config(
                "g",
                "https://generativelanguage.googleapis.com/v1beta"
            )),
            Dialect::Gemini
        );
        // Name-based detection when the URL is a proxy.
        assert_eq!(
            detect_dialect(&http_config("gemini", "https://proxy.internal/v1")),
            Dialect::Gemini
        );
        assert_eq!(
            detect_dialect(&http_config("deepseek", "https://api.deepseek.com/v1")),
            Dialect::OpenAi
        );
    }

    #[test]
    fn test_anthropic_call_shape() {
        let backend = HttpBackend::new(http_config("claude", "https://api.anthropic.com/v1/")).unwrap();
        let (url, body) = backend.build_call("hello", "sk-test", false);
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
        assert!(body.get("stream").is_none());

        let (_, streaming) = backend.build_call("hello", "sk-test", true);
        assert_eq!(streaming["stream"], true);
    }

    #[test]
    fn test_gemini_call_shape() {
        let mut config = http_config("gemini", "https://generativelanguage.googleapis.com/v1beta");
        config.model = Some("gemini-pro".to_string());
        let backend = HttpBackend::new(config).unwrap();
        let (url, body) = backend.build_call("hi", "key123", false);
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=key123"
        );
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn test_openai_call_shape() {
        let backend = HttpBackend::new(http_config("deepseek", "https://api.deepseek.com/v1")).unwrap();
        let (url, body) = backend.build_call("hi", "sk", false);
        assert_eq!(url, "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_extract_anthropic() {
        let data = json!({
            "content": [
                {"type": "text", "text": "part one"},
                {"type": "tool_use", "name": "x"},
                {"type": "text", "text": "part two"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 25}
        });
        let (text, tokens) = extract_content(Dialect::Anthropic, &data);
        assert_eq!(text, "part one\npart two");
        assert_eq!(tokens, 35);
    }

    #[test]
    fn test_extract_gemini() {
        let data = json!({
            "candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}],
            "usageMetadata": {"totalTokenCount": 17}
        });
        let (text, tokens) = extract_content(Dialect::Gemini, &data);
        assert_eq!(text, "ab");
        assert_eq!(tokens, 17);
    }

    #[test]
    fn test_extract_openai() {
        let data = json!({
            "choices": [{"message": {"content": "answer"}}],
            "usage": {"total_tokens": 9}
        });
        let (text, tokens) = extract_content(Dialect::OpenAi, &data);
        assert_eq!(text, "answer");
        assert_eq!(tokens, 9);
    }

    #[test]
    fn test_extract_malformed_yields_empty() {
        for dialect in [Dialect::Anthropic, Dialect::Gemini, Dialect::OpenAi] {
            let (text, tokens) = extract_content(dialect, &json!({"unexpected": true}));
            assert_eq!(text, "");
            assert_eq!(tokens, 0);
        }
    }

    #[test]
    fn test_anthropic_stream_events() {
        let delta = json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "tok"}
        });
        assert!(matches!(
            stream_delta(Dialect::Anthropic, &delta),
            StreamEvent::Content(ref t) if t == "tok"
        ));

        let stop = json!({"type": "message_stop"});
        assert!(matches!(
            stream_delta(Dialect::Anthropic, &stop),
            StreamEvent::Stop
        ));

        let other = json!({"type": "content_block_start"});
        assert!(matches!(
            stream_delta(Dialect::Anthropic, &other),
            StreamEvent::Ignore
        ));
    }

    #[test]
    fn test_openai_stream_events() {
        let delta = json!({"choices": [{"delta": {"content": "x"}}]});
        assert!(matches!(
            stream_delta(Dialect::OpenAi, &delta),
            StreamEvent::Content(ref t) if t == "x"
        ));

        let finish = json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}],
            "usage": {"total_tokens": 11}
        });
        assert!(matches!(
            stream_delta(Dialect::OpenAi, &finish),
            StreamEvent::Tokens(11)
        ));
    }

    #[tokio::test]
    async fn test_execute_without_key_fails() {
        let mut config = http_config("alpha", "https://api.example.com/v1");
        config.api_key_env = Some("LLM_GATEWAY_TEST_NO_SUCH_KEY".to_string());
        let backend = HttpBackend::new(config).unwrap();
        let result = backend.execute(&GatewayRequest::new("alpha", "hi")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("API key not found"));
    }

    #[tokio::test]
    async fn test_health_check_without_key() {
        let backend = HttpBackend::new(http_config("alpha", "https://api.example.com/v1")).unwrap();
        assert!(!backend.health_check().await);
    }
}
