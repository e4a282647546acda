//! Mock backend for testing without a live provider.
//!
//! [`MockBackend`] plays back a script of canned outcomes in order,
//! cycling when exhausted. Each step can be a success, a failure, or
//! either with an artificial delay, which is what the retry, parallel,
//! and dispatcher tests are built on.
//!
//! # Example
//!
//! ```
//! use llm_gateway::backend::MockBackend;
//!
//! let mock = MockBackend::fixed("alpha", "Hello, world!");
//! let flaky = MockBackend::script("beta", vec![
//!     MockBackend::failure("API error 503: unavailable"),
//!     MockBackend::success("recovered"),
//! ]);
//! ```

use super::{Backend, BackendResult};
use crate::types::{BackendKind, GatewayRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub result: std::result::Result<String, String>,
    pub delay: Duration,
    pub tokens: Option<i64>,
}

#[derive(Debug)]
pub struct MockBackend {
    name: String,
    steps: Vec<MockStep>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
}

impl MockBackend {
    /// Play back the given steps in order, cycling when exhausted.
    pub fn script(name: impl Into<String>, steps: Vec<MockStep>) -> Self {
        assert!(!steps.is_empty(), "MockBackend requires at least one step");
        Self {
            name: name.into(),
            steps,
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// A mock that always returns the same successful response.
    pub fn fixed(name: impl Into<String>, response: impl Into<String>) -> Self {
        Self::script(name, vec![Self::success(response)])
    }

    /// A mock that always fails with the same error.
    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::script(name, vec![Self::failure(error)])
    }

    pub fn success(response: impl Into<String>) -> MockStep {
        MockStep {
            result: Ok(response.into()),
            delay: Duration::ZERO,
            tokens: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> MockStep {
        MockStep {
            result: Err(error.into()),
            delay: Duration::ZERO,
            tokens: None,
        }
    }

    pub fn success_after(response: impl Into<String>, delay: Duration) -> MockStep {
        MockStep {
            result: Ok(response.into()),
            delay,
            tokens: None,
        }
    }

    pub fn failure_after(error: impl Into<String>, delay: Duration) -> MockStep {
        MockStep {
            result: Err(error.into()),
            delay,
            tokens: None,
        }
    }

    /// How many times `execute` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_step(&self) -> MockStep {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.steps.len();
        self.steps[idx].clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, _request: &GatewayRequest) -> BackendResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let step = self.next_step();
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        let latency_ms = step.delay.as_secs_f64() * 1000.0;
        match step.result {
            Ok(response) => {
                let mut result = BackendResult::ok(response).with_latency(latency_ms);
                result.tokens_used = step.tokens;
                result
            }
            Err(error) => BackendResult::fail(error).with_latency(latency_ms),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::HttpApi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_response() {
        let mock = MockBackend::fixed("alpha", "Hello!");
        let result = mock.execute(&GatewayRequest::new("alpha", "hi")).await;
        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("Hello!"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_script_cycles() {
        let mock = MockBackend::script(
            "alpha",
            vec![MockBackend::success("first"), MockBackend::success("second")],
        );
        let request = GatewayRequest::new("alpha", "hi");
        assert_eq!(mock.execute(&request).await.response.as_deref(), Some("first"));
        assert_eq!(mock.execute(&request).await.response.as_deref(), Some("second"));
        assert_eq!(mock.execute(&request).await.response.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_failure_then_success() {
        let mock = MockBackend::script(
            "alpha",
            vec![
                MockBackend::failure("API error 500: boom"),
                MockBackend::success("ok now"),
            ],
        );
        let request = GatewayRequest::new("alpha", "hi");
        let first = mock.execute(&request).await;
        assert!(!first.success);
        assert_eq!(first.error.as_deref(), Some("API error 500: boom"));
        let second = mock.execute(&request).await;
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_delay_is_applied() {
        let mock = MockBackend::script(
            "alpha",
            vec![MockBackend::success_after("slow", Duration::from_millis(30))],
        );
        let start = std::time::Instant::now();
        let result = mock.execute(&GatewayRequest::new("alpha", "hi")).await;
        assert!(result.success);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(result.latency_ms >= 30.0);
    }
}
