//! # LLM Gateway
//!
//! A long-running AI provider gateway: one process accepts text-completion
//! requests from many clients, routes each to one of N heterogeneous
//! providers (remote HTTP APIs or local CLI tools), and returns the
//! response buffered or as an incrementally streamed sequence of chunks.
//!
//! The gateway gives uniform semantics across providers with very
//! different transports and failure modes: priority scheduling, retries
//! with provider fallback, response caching, rate limiting, dynamic
//! backpressure, metrics, and durable persistence.
//!
//! ## Core Components
//!
//! - **[`store::Store`]** — embedded SQLite persistence (requests,
//!   responses, provider status, metrics, cache, API keys, token costs).
//! - **[`queue::RequestQueue`]** — bounded priority queue with a
//!   dynamically-resized in-flight set.
//! - **[`backend::Backend`]** — the uniform transport contract, with
//!   [`backend::HttpBackend`] (Anthropic / Gemini / OpenAI-compatible
//!   dialects) and [`backend::CliBackend`] (subprocess) implementations.
//! - **[`retry::RetryExecutor`]** — error classification, exponential
//!   backoff with jitter, fallback chains.
//! - **[`parallel::ParallelExecutor`]** — fan-out across provider groups
//!   with five aggregation strategies.
//! - **[`cache::CacheManager`]** — fingerprint-keyed response cache.
//! - **[`stream::StreamManager`]** — chunk streams with heartbeats and
//!   cancellation, native or simulated.
//! - **[`ratelimit::RateLimiter`]** — token buckets per caller identity.
//! - **[`backpressure::BackpressureController`]** — live load evaluation
//!   reshaping the concurrency bound.
//! - **[`dispatcher::Dispatcher`]** — the orchestrator that wires it all
//!   and drives the background loops.
//! - **[`server`]** — the axum HTTP/JSON + SSE surface.
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_gateway::config::GatewayConfig;
//! use llm_gateway::dispatcher::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::load(None)?;
//!     let dispatcher = Dispatcher::new(config)?;
//!     dispatcher.clone().start();
//!     llm_gateway::server::serve(dispatcher).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod backpressure;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod parallel;
pub mod queue;
pub mod ratelimit;
pub mod reliability;
pub mod retry;
pub mod server;
pub mod store;
pub mod stream;
pub mod types;

pub use backend::{Backend, BackendResult, CliBackend, HttpBackend, MockBackend, StreamChunk};
pub use config::GatewayConfig;
pub use dispatcher::{Dispatcher, SubmitOutcome};
pub use error::{GatewayError, Result};
pub use types::{GatewayRequest, GatewayResponse, ProviderInfo, RequestStatus};
