//! HTTP/JSON surface: request submission (buffered and SSE streaming),
//! request inspection and cancellation, provider listings, health, stats,
//! and Prometheus metrics.
//!
//! Auth and rate limiting run as middleware. Rate-limit headers are
//! attached to every non-exempt response; 429 replies carry `Retry-After`
//! and a JSON body with the retry hint.

use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::stream::StreamEvent;
use crate::types::{now, GatewayRequest, RequestStatus};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Authenticated caller details, attached by the auth middleware and read
/// by the rate limiter.
#[derive(Debug, Clone)]
struct AuthedKey {
    key_id: String,
    rate_limit_rpm: Option<i64>,
}

/// Build the full router with middleware attached.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/ask", post(ask))
        .route("/api/ask/stream", post(ask_stream))
        .route("/api/requests", get(list_requests))
        .route(
            "/api/requests/{id}",
            get(get_request).delete(cancel_request),
        )
        .route("/api/providers", get(list_providers))
        .route("/api/stats", get(stats))
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            dispatcher.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            dispatcher.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

/// Bind and serve until ctrl-c, then shut the dispatcher down.
pub async fn serve(dispatcher: Arc<Dispatcher>) -> crate::error::Result<()> {
    let addr = format!(
        "{}:{}",
        dispatcher.config().host,
        dispatcher.config().port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "gateway listening");

    let app = router(dispatcher.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;

    dispatcher.shutdown().await;
    Ok(())
}

fn client_ip(request: &axum::extract::Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

fn is_loopback(request: &axum::extract::Request) -> bool {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
        .unwrap_or(false)
}

async fn auth_middleware(
    State(dispatcher): State<Arc<Dispatcher>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let auth = &dispatcher.config().auth;
    let path = request.uri().path().to_string();
    if !auth.enabled || auth.is_public(&path) {
        return next.run(request).await;
    }
    if auth.allow_localhost && is_loopback(&request) {
        return next.run(request).await;
    }

    let header_name = auth.header_name.to_lowercase();
    let raw = request
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let Some(raw) = raw else {
        return unauthorized("missing API key");
    };
    match dispatcher.store().verify_api_key(&raw) {
        Ok(Some(key)) => {
            request.extensions_mut().insert(AuthedKey {
                key_id: key.key_id,
                rate_limit_rpm: key.rate_limit_rpm,
            });
            next.run(request).await
        }
        Ok(None) => unauthorized("invalid API key"),
        Err(e) => {
            tracing::error!(error = %e, "API key lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
    }
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized", "detail": detail})),
    )
        .into_response()
}

async fn rate_limit_middleware(
    State(dispatcher): State<Arc<Dispatcher>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !dispatcher.limiter().enabled() || dispatcher.config().auth.is_public(&path) {
        return next.run(request).await;
    }

    let authed = request.extensions().get::<AuthedKey>().cloned();
    let ip = client_ip(&request);
    let decision = dispatcher.limiter().check(
        authed.as_ref().map(|k| k.key_id.as_str()),
        ip.as_deref(),
        Some(&path),
        authed.as_ref().and_then(|k| k.rate_limit_rpm),
    );

    if !decision.allowed {
        let key_type = if authed.is_some() { "api_key" } else { "ip" };
        dispatcher.metrics().inc_rate_limit_hit(key_type);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "detail": format!(
                    "Too many requests. Try again in {:.1} seconds.",
                    decision.reset_after_s
                ),
                "retry_after": decision.reset_after_s,
            })),
        )
            .into_response();
        apply_rate_headers(&mut response, &decision);
        if let Ok(value) = HeaderValue::from_str(&format!("{:.0}", decision.reset_after_s.ceil())) {
            response.headers_mut().insert("Retry-After", value);
        }
        return response;
    }

    let mut response = next.run(request).await;
    apply_rate_headers(&mut response, &decision);
    response
}

fn apply_rate_headers(response: &mut Response, decision: &crate::ratelimit::RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

// ---- handlers ----

async fn index() -> impl IntoResponse {
    Json(json!({
        "name": "llm-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct AskBody {
    #[serde(default)]
    provider: Option<String>,
    message: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    timeout_s: Option<f64>,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

fn build_request(dispatcher: &Dispatcher, body: AskBody) -> GatewayRequest {
    let provider = body
        .provider
        .unwrap_or_else(|| dispatcher.config().default_provider.clone());
    let mut request = GatewayRequest::new(provider, body.message);
    if let Some(priority) = body.priority {
        request.priority = priority;
    }
    request.timeout_s = body
        .timeout_s
        .unwrap_or(dispatcher.config().default_timeout_s);
    request.metadata = body.metadata;
    request
}

async fn ask(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<AskBody>,
) -> Response {
    let request = build_request(&dispatcher, body);
    if !dispatcher.has_provider(&request.provider) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown provider: {}", request.provider)})),
        )
            .into_response();
    }

    match dispatcher.ask(request).await {
        Ok(response) => Json(response).into_response(),
        Err(GatewayError::QueueFull) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "queue full",
                "detail": "the request queue is at capacity",
                "retry_after": 5.0,
            })),
        )
            .into_response(),
        Err(GatewayError::Overloaded(reason)) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "gateway overloaded",
                "detail": reason,
                "retry_after": 5.0,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ask failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Keeps the active-connection gauge honest for the lifetime of one SSE
/// stream.
struct ConnectionGuard(Arc<Dispatcher>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.metrics().dec_active_connections();
    }
}

async fn ask_stream(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<AskBody>,
) -> Response {
    let request = build_request(&dispatcher, body);
    if !dispatcher.has_provider(&request.provider) && !request.is_group() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown provider: {}", request.provider)})),
        )
            .into_response();
    }

    let rx = match dispatcher.clone().stream_ask(request) {
        Ok(rx) => rx,
        Err(GatewayError::Overloaded(reason)) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "gateway overloaded",
                    "detail": reason,
                    "retry_after": 5.0,
                })),
            )
                .into_response();
        }
        Err(GatewayError::UnknownProvider(provider)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("unknown provider: {}", provider)})),
            )
                .into_response();
        }
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    dispatcher.metrics().inc_active_connections();
    let guard = ConnectionGuard(dispatcher.clone());
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok::<Event, Infallible>(match event {
            StreamEvent::Chunk(chunk) => Event::default()
                .data(serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string())),
            StreamEvent::Heartbeat => Event::default().comment("heartbeat"),
        })
    });
    Sse::new(stream).into_response()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_requests(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(s) => match RequestStatus::parse(s) {
            Some(status) => Some(status),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("unknown status: {}", s)})),
                )
                    .into_response();
            }
        },
        None => None,
    };
    match dispatcher.store().list_requests(
        status,
        query.provider.as_deref(),
        query.limit.clamp(1, 500),
        query.offset.max(0),
        "created_at",
        true,
    ) {
        Ok(requests) => Json(json!({"requests": requests})).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_request(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(id): Path<String>,
) -> Response {
    let request = match dispatcher.store().get_request(&id) {
        Ok(Some(request)) => request,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "request not found"})),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    };
    let response = match dispatcher.store().get_response(&id) {
        Ok(response) => response,
        Err(e) => return internal_error(e),
    };
    Json(json!({"request": request, "response": response})).into_response()
}

async fn cancel_request(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(id): Path<String>,
) -> Response {
    match dispatcher.store().get_request(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "request not found"})),
            )
                .into_response();
        }
        Err(e) => return internal_error(e),
    }
    match dispatcher.cancel(&id).await {
        Ok(true) => Json(json!({"cancelled": true, "request_id": id})).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "request is not cancellable"})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_providers(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    match dispatcher.store().list_provider_statuses() {
        Ok(providers) => Json(json!({"providers": providers})).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn stats(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    let cache_stats = match dispatcher.cache().stats() {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };
    let costs = dispatcher.store().get_cost_summary(24).unwrap_or_default();
    Json(json!({
        "queue": dispatcher.queue().stats(),
        "cache": cache_stats,
        "backpressure": {
            "load_level": dispatcher.backpressure().current_load().as_str(),
            "metrics": dispatcher.backpressure().metrics(),
            "max_concurrent": dispatcher.backpressure().current_max_concurrent(),
        },
        "reliability": dispatcher.reliability().all_scores(),
        "costs": costs,
    }))
    .into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": now(),
    }))
}

async fn metrics(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    match dispatcher.metrics().export() {
        Ok(text) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: GatewayError) -> Response {
    tracing::error!(error = %e, "handler failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
        .into_response()
}
