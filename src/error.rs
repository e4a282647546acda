use std::time::Duration;
use thiserror::Error;

/// Errors produced by the gateway and its components.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Embedded database failure.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem or subprocess I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration detected at load time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The queue is at capacity and refused the request.
    #[error("request queue is full")]
    QueueFull,

    /// A request, response, or provider that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// No backend is configured for the named provider.
    #[error("no backend for provider: {0}")]
    UnknownProvider(String),

    /// The request or stream was cancelled.
    #[error("request was cancelled")]
    Cancelled,

    /// Backpressure admission control refused the request.
    #[error("gateway overloaded: {0}")]
    Overloaded(String),

    /// Upstream HTTP error with status code, response body, and an optional
    /// Retry-After hint parsed from the response headers.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
