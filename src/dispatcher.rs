//! The dispatcher wires every component together: it owns the store, the
//! queue, the backends, the executors, and the background loops (drain,
//! health check, timeout, cleanup, backpressure evaluation).
//!
//! Nothing here is a process-wide singleton; the dispatcher is constructed
//! from a [`GatewayConfig`] and handed to the HTTP surface, and tests build
//! it with mock backends.

use crate::backend::{make_backend, Backend, BackendResult};
use crate::backpressure::BackpressureController;
use crate::cache::CacheManager;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::parallel::ParallelExecutor;
use crate::queue::RequestQueue;
use crate::ratelimit::RateLimiter;
use crate::reliability::ReliabilityTracker;
use crate::retry::{detect_auth_failure, RetryExecutor, RetryState};
use crate::store::Store;
use crate::stream::{StreamEvent, StreamManager};
use crate::types::{
    now, BackendKind, GatewayRequest, GatewayResponse, ProviderInfo, ProviderStatus, RequestStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

const DRAIN_BATCH: usize = 5;
const DRAIN_IDLE_WAIT: Duration = Duration::from_millis(500);
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const METRICS_RETENTION_HOURS: i64 = 168;

/// Outcome of submitting a buffered request.
pub enum SubmitOutcome {
    /// Served synchronously from the cache.
    Completed(GatewayResponse),
    /// Queued; the receiver resolves when the request reaches a terminal
    /// state.
    Pending(oneshot::Receiver<GatewayResponse>),
    /// Refused by backpressure admission control.
    Rejected { reason: String },
}

pub struct Dispatcher {
    config: GatewayConfig,
    store: Arc<Store>,
    queue: Arc<RequestQueue>,
    backends: HashMap<String, Arc<dyn Backend>>,
    retry: RetryExecutor,
    parallel: ParallelExecutor,
    cache: CacheManager,
    streams: Arc<StreamManager>,
    limiter: RateLimiter,
    backpressure: Arc<BackpressureController>,
    reliability: Arc<ReliabilityTracker>,
    metrics: GatewayMetrics,
    waiters: Mutex<HashMap<String, oneshot::Sender<GatewayResponse>>>,
    active: Mutex<HashMap<String, AbortHandle>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Dispatcher {
    /// Build a dispatcher with backends instantiated from the config.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        for (name, provider) in &config.providers {
            if !provider.enabled {
                continue;
            }
            match make_backend(provider) {
                Ok(backend) => {
                    backends.insert(name.clone(), backend);
                }
                Err(e) => {
                    tracing::error!(provider = %name, error = %e, "failed to initialize backend");
                }
            }
        }
        Self::with_backends(config, backends)
    }

    /// Build a dispatcher with explicit backends (dependency injection;
    /// tests pass mocks here).
    pub fn with_backends(
        config: GatewayConfig,
        backends: HashMap<String, Arc<dyn Backend>>,
    ) -> Result<Arc<Self>> {
        let store = Arc::new(Store::open(&config.resolved_db_path())?);
        let queue = Arc::new(RequestQueue::new(
            store.clone(),
            config.max_queue_size,
            config.max_concurrent_requests,
        )?);
        let reliability = Arc::new(ReliabilityTracker::new(config.reliability.clone()));

        let retry = RetryExecutor::new(
            config.retry.clone(),
            backends.clone(),
            reliability.clone(),
        );
        let parallel = ParallelExecutor::new(config.parallel.clone(), backends.clone());
        let cache = CacheManager::new(store.clone(), config.cache.clone());
        let streams = Arc::new(StreamManager::new(config.streaming.clone()));
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let metrics = GatewayMetrics::new()?;

        let queue_for_depth = queue.clone();
        let queue_for_processing = queue.clone();
        let backpressure = Arc::new(BackpressureController::new(
            config.backpressure.clone(),
            config.max_concurrent_requests,
            Box::new(move || queue_for_depth.depth()),
            Box::new(move || queue_for_processing.processing_count()),
        ));
        let queue_for_limit = queue.clone();
        backpressure.set_limit_change_callback(Box::new(move |_, new_limit| {
            queue_for_limit.set_max_concurrent(new_limit);
        }));

        let dispatcher = Arc::new(Self {
            store,
            queue,
            backends,
            retry,
            parallel,
            cache,
            streams,
            limiter,
            backpressure,
            reliability,
            metrics,
            waiters: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            loops: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            config,
        });
        dispatcher.seed_provider_status()?;
        Ok(dispatcher)
    }

    /// Seed provider status rows from the configuration so `/api/providers`
    /// lists everything before the first health check runs.
    fn seed_provider_status(&self) -> Result<()> {
        for (name, provider) in &self.config.providers {
            let mut info = match self.store.get_provider_status(name)? {
                Some(existing) => existing,
                None => ProviderInfo::new(name, provider.backend_type),
            };
            info.backend_kind = provider.backend_type;
            info.enabled = provider.enabled;
            info.priority = provider.priority;
            info.rate_limit_rpm = provider.rate_limit_rpm;
            info.timeout_s = provider.timeout_s;
            self.store.update_provider_status(&info)?;
        }
        Ok(())
    }

    /// Launch the background loops. Idempotent.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut loops = self.loops.lock().unwrap();
        loops.push(tokio::spawn(Arc::clone(&self).drain_loop()));
        loops.push(tokio::spawn(Arc::clone(&self).timeout_loop()));
        loops.push(tokio::spawn(Arc::clone(&self).backpressure_loop()));
        loops.push(tokio::spawn(Arc::clone(&self).cleanup_loop()));
        if self.config.health_check.enabled {
            loops.push(tokio::spawn(Arc::clone(&self).health_loop()));
        }
        tracing::info!(
            providers = self.backends.len(),
            max_concurrent = self.queue.max_concurrent(),
            "dispatcher started"
        );
    }

    /// Stop the loops, cancel active work, shut down backends.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.loops.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.streams.cancel_all();
        for (_, handle) in self.active.lock().unwrap().drain() {
            handle.abort();
        }
        for backend in self.backends.values() {
            backend.shutdown().await;
        }
        tracing::info!("dispatcher stopped");
    }

    // ---- submission ----

    /// Admit, cache-check, and enqueue a request.
    pub fn submit(&self, request: GatewayRequest) -> Result<SubmitOutcome> {
        if !self.backpressure.should_accept_request() {
            let reason = self
                .backpressure
                .rejection_reason()
                .unwrap_or_else(|| "gateway overloaded".to_string());
            return Ok(SubmitOutcome::Rejected { reason });
        }

        if let Some(response) = self.try_cache_hit(&request)? {
            return Ok(SubmitOutcome::Completed(response));
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(request.id.clone(), tx);
        let enqueued = self.queue.enqueue(request.clone())?;
        if !enqueued {
            self.waiters.lock().unwrap().remove(&request.id);
            return Err(GatewayError::QueueFull);
        }
        self.metrics
            .set_queue_depth(&request.provider, self.queue.depth() as i64);
        Ok(SubmitOutcome::Pending(rx))
    }

    /// Submit and wait for the terminal response.
    pub async fn ask(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        let request_id = request.id.clone();
        let timeout_s = request.timeout_s;
        match self.submit(request)? {
            SubmitOutcome::Completed(response) => Ok(response),
            SubmitOutcome::Rejected { reason } => Err(GatewayError::Overloaded(reason)),
            SubmitOutcome::Pending(rx) => {
                // Grace beyond the request's own deadline: the timeout loop
                // resolves the waiter first in the normal case.
                let wait = Duration::from_secs_f64(timeout_s.max(1.0) + 5.0);
                match tokio::time::timeout(wait, rx).await {
                    Ok(Ok(response)) => Ok(response),
                    _ => {
                        // Waiter lost (restart/raced cancel): read the store.
                        if let Some(response) = self.store.get_response(&request_id)? {
                            return Ok(response);
                        }
                        self.cancel(&request_id).await?;
                        self.store
                            .get_response(&request_id)?
                            .ok_or(GatewayError::Cancelled)
                    }
                }
            }
        }
    }

    fn try_cache_hit(&self, request: &GatewayRequest) -> Result<Option<GatewayResponse>> {
        if !self.cache.enabled() {
            return Ok(None);
        }
        let model = self.provider_model(&request.provider);
        let Some(entry) = self
            .cache
            .get(&request.provider, &request.message, model.as_deref())?
        else {
            self.metrics.inc_cache_miss();
            return Ok(None);
        };

        // Persist the request through its legal transitions so the audit
        // trail looks the same as any other completed request.
        self.store.create_request(request)?;
        self.store
            .update_status(&request.id, RequestStatus::Processing, None)?;
        self.store
            .update_status(&request.id, RequestStatus::Completed, None)?;

        let mut response = GatewayResponse::new(&request.id, RequestStatus::Completed);
        response.response = Some(entry.response.clone());
        response.provider = Some(request.provider.clone());
        response.latency_ms = Some(0.0);
        response.tokens_used = entry.tokens_used;
        response.metadata = Some(
            [
                ("cache_hit".to_string(), json!(true)),
                ("cache_key".to_string(), json!(entry.cache_key)),
            ]
            .into_iter()
            .collect(),
        );
        self.store.save_response(&response)?;

        self.metrics.inc_cache_hit();
        self.metrics.inc_requests(&request.provider, "completed");
        self.store.record_metric(
            &request.provider,
            "cache_hit",
            Some(&request.id),
            Some(0.0),
            true,
            None,
        )?;
        tracing::debug!(request_id = %request.id, "cache hit");
        Ok(Some(response))
    }

    fn provider_model(&self, provider: &str) -> Option<String> {
        self.config
            .providers
            .get(provider)
            .and_then(|p| p.model.clone())
    }

    // ---- request processing ----

    async fn drain_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let batch = match self.queue.batch_dequeue(DRAIN_BATCH) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "dequeue failed");
                    tokio::time::sleep(DRAIN_IDLE_WAIT).await;
                    continue;
                }
            };
            if batch.is_empty() {
                self.queue.wait_for_work(DRAIN_IDLE_WAIT).await;
                continue;
            }
            for request in batch {
                if let Err(e) = self.queue.mark_processing(&request.id) {
                    tracing::error!(request_id = %request.id, error = %e, "mark_processing failed");
                }
                self.backpressure.record_request_start();
                let this = Arc::clone(&self);
                let request_id = request.id.clone();
                let handle = tokio::spawn(async move {
                    this.handle_one(request).await;
                });
                self.active
                    .lock()
                    .unwrap()
                    .insert(request_id, handle.abort_handle());
            }
        }
    }

    async fn handle_one(&self, request: GatewayRequest) {
        let started = now();
        let response = if request.is_group() {
            self.handle_parallel(&request).await
        } else {
            self.handle_single(&request).await
        };
        let latency_ms = (now() - started) * 1000.0;

        if let Err(e) = self.finalize(&request, response, latency_ms) {
            tracing::error!(request_id = %request.id, error = %e, "failed to finalize request");
        }
        self.active.lock().unwrap().remove(&request.id);
    }

    async fn handle_single(&self, request: &GatewayRequest) -> GatewayResponse {
        let (result, state) = self.retry.execute_with_retry(request).await;
        self.record_retry_metrics(&state);

        let provider = state.final_provider.clone();
        if result.success {
            self.reliability.record_success(&provider);
        } else {
            let error = result.error.as_deref().unwrap_or_default();
            self.reliability.record_failure(
                &provider,
                detect_auth_failure(error),
                error.to_lowercase().contains("timed out"),
            );
        }

        let mut response = self.response_from_result(request, &result, &provider);
        let metadata = response.metadata.get_or_insert_with(HashMap::new);
        metadata.insert("retry_count".to_string(), json!(state.errors.len()));
        metadata.insert("attempts_total".to_string(), json!(state.total_attempts));
        metadata.insert("fallback_used".to_string(), json!(state.fallback_used()));
        metadata.insert(
            "original_provider".to_string(),
            json!(state.original_provider),
        );
        if !state.errors.is_empty() {
            metadata.insert(
                "attempt_errors".to_string(),
                serde_json::to_value(&state.errors).unwrap_or(json!([])),
            );
        }

        if result.success {
            if let Some(ref text) = result.response {
                let model = self.provider_model(&request.provider);
                if let Err(e) = self.cache.put(
                    &request.provider,
                    &request.message,
                    text,
                    result.tokens_used,
                    model.as_deref(),
                    None,
                ) {
                    tracing::warn!(error = %e, "cache put failed");
                }
            }
        }
        response
    }

    async fn handle_parallel(&self, request: &GatewayRequest) -> GatewayResponse {
        let providers = self.parallel.resolve_group(&request.provider);
        let result = self.parallel.execute_parallel(request, &providers, None).await;

        // Per-branch accounting; aborted branches never report, which keeps
        // cancellation observable.
        for (provider, branch) in &result.all_responses {
            self.reliability
                .record_failure_or_success(provider, branch.success, branch.error.as_deref());
            if let Err(e) = self.store.record_metric(
                provider,
                if branch.success { "completed" } else { "failed" },
                Some(&request.id),
                Some(branch.latency_ms),
                branch.success,
                branch.error.as_deref(),
            ) {
                tracing::warn!(error = %e, "metric record failed");
            }
        }

        let status = if result.success {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };
        let mut response = GatewayResponse::new(&request.id, status);
        response.response = result.selected_response.clone();
        response.error = result.error.clone();
        response.provider = result.selected_provider.clone();
        response.latency_ms = Some(result.total_latency_ms);
        response.tokens_used = result.selected_tokens();
        response.metadata = Some(
            [
                ("strategy".to_string(), json!(result.strategy.as_str())),
                ("group".to_string(), json!(request.provider)),
                (
                    "providers".to_string(),
                    serde_json::to_value(&result.all_responses).unwrap_or(json!({})),
                ),
            ]
            .into_iter()
            .collect(),
        );
        response
    }

    fn response_from_result(
        &self,
        request: &GatewayRequest,
        result: &BackendResult,
        provider: &str,
    ) -> GatewayResponse {
        let status = if result.success {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };
        let mut response = GatewayResponse::new(&request.id, status);
        response.response = result.response.clone();
        response.error = result.error.clone();
        response.provider = Some(provider.to_string());
        response.latency_ms = Some(result.latency_ms);
        response.tokens_used = result.tokens_used;
        response.metadata = result.metadata.clone();
        response.thinking = result.thinking.clone();
        response.raw_output = result.raw_output.clone();
        response
    }

    fn record_retry_metrics(&self, state: &RetryState) {
        for error in &state.errors {
            self.metrics
                .inc_errors(&error.provider, error.error_kind.as_str());
            if error.error_kind.is_retryable() {
                self.metrics
                    .inc_retries(&error.provider, error.error_kind.as_str());
            }
        }
        if state.fallback_used() {
            self.metrics
                .inc_fallbacks(&state.original_provider, &state.final_provider);
        }
    }

    /// Persist the terminal state, release the slot, notify the waiter, and
    /// feed the signal consumers. A request another path already finalised
    /// (timeout, cancel) is left untouched.
    fn finalize(
        &self,
        request: &GatewayRequest,
        mut response: GatewayResponse,
        latency_ms: f64,
    ) -> Result<()> {
        let current = self.store.get_request(&request.id)?;
        if current.map(|r| r.status.is_terminal()).unwrap_or(false) {
            // Timeout or cancel already finalised this request; terminal
            // states are never overwritten.
            self.queue.release(&request.id);
            self.waiters.lock().unwrap().remove(&request.id);
            return Ok(());
        }

        if response.latency_ms.is_none() {
            response.latency_ms = Some(latency_ms);
        }
        let success = response.status == RequestStatus::Completed;

        self.store.save_response(&response)?;
        self.queue.mark_terminal(&request.id, response.status)?;

        let provider = response
            .provider
            .clone()
            .unwrap_or_else(|| request.provider.clone());
        self.metrics
            .inc_requests(&provider, response.status.as_str());
        self.metrics
            .observe_latency(&provider, latency_ms / 1000.0);
        if let Some(tokens) = response.tokens_used {
            self.metrics.add_tokens(&provider, tokens.max(0) as u64);
            let (input, output) = split_tokens(&response, tokens);
            self.store.record_token_cost(
                &provider,
                Some(&request.id),
                input,
                output,
                None,
                self.provider_model(&provider).as_deref(),
            )?;
        }
        self.metrics
            .set_queue_depth(&request.provider, self.queue.depth() as i64);

        if !request.is_group() {
            self.store.record_metric(
                &provider,
                response.status.as_str(),
                Some(&request.id),
                Some(latency_ms),
                success,
                response.error.as_deref(),
            )?;
        }
        self.update_rolling_provider_info(&provider, latency_ms, success)?;
        self.backpressure.record_request_complete(latency_ms, success);

        if let Some(waiter) = self.waiters.lock().unwrap().remove(&request.id) {
            let _ = waiter.send(response);
        }
        Ok(())
    }

    /// EMA over completion latency and success, folded into the persisted
    /// provider snapshot.
    fn update_rolling_provider_info(
        &self,
        provider: &str,
        latency_ms: f64,
        success: bool,
    ) -> Result<()> {
        let Some(mut info) = self.store.get_provider_status(provider)? else {
            return Ok(());
        };
        info.avg_latency_ms = if info.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            info.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
        info.success_rate = info.success_rate * 0.9 + if success { 0.1 } else { 0.0 };
        let stats = self.queue.stats();
        info.queue_depth = stats.by_provider.get(provider).copied().unwrap_or(0) as i64;
        self.store.update_provider_status(&info)
    }

    // ---- cancellation ----

    /// Caller-initiated cancel. Queued requests leave the heap; processing
    /// requests get their task aborted and any stream closed.
    pub async fn cancel(&self, request_id: &str) -> Result<bool> {
        let request = self.store.get_request(request_id)?;
        let cancelled = self.queue.cancel(request_id)?;
        if !cancelled {
            return Ok(false);
        }

        if let Some(handle) = self.active.lock().unwrap().remove(request_id) {
            handle.abort();
        }
        self.streams.cancel(request_id);

        let mut response = GatewayResponse::new(request_id, RequestStatus::Cancelled);
        response.error = Some("cancelled by caller".to_string());
        response.provider = request.as_ref().map(|r| r.provider.clone());
        self.store.save_response(&response)?;

        let provider = request
            .map(|r| r.provider)
            .unwrap_or_else(|| "unknown".to_string());
        self.metrics.inc_requests(&provider, "cancelled");
        self.store.record_metric(
            &provider,
            "cancelled",
            Some(request_id),
            None,
            false,
            Some("cancelled by caller"),
        )?;

        if let Some(waiter) = self.waiters.lock().unwrap().remove(request_id) {
            let _ = waiter.send(response);
        }
        Ok(true)
    }

    // ---- streaming ----

    /// Open a streaming execution for the request. Group aliases are not
    /// streamable.
    pub fn stream_ask(
        self: Arc<Self>,
        request: GatewayRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        if request.is_group() {
            return Err(GatewayError::Other(
                "streaming is not supported for provider groups".to_string(),
            ));
        }
        if !self.backpressure.should_accept_request() {
            return Err(GatewayError::Overloaded(
                self.backpressure
                    .rejection_reason()
                    .unwrap_or_else(|| "gateway overloaded".to_string()),
            ));
        }
        let backend = self
            .backends
            .get(&request.provider)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProvider(request.provider.clone()))?;

        self.store.create_request(&request)?;
        self.store
            .update_status(&request.id, RequestStatus::Processing, Some(backend.kind()))?;

        let mut inner = self.streams.open_stream(&request, backend);
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let mut content = String::new();
            let mut tokens: Option<i64> = None;
            let mut provider: Option<String> = None;
            let mut error: Option<String> = None;
            let mut saw_final = false;

            while let Some(event) = inner.recv().await {
                if let StreamEvent::Chunk(ref chunk) = event {
                    content.push_str(&chunk.content);
                    if chunk.is_final {
                        tokens = chunk.tokens_used;
                        provider = chunk.provider.clone();
                        error = chunk
                            .metadata
                            .as_ref()
                            .and_then(|m| m.get("error"))
                            .and_then(|e| e.as_str())
                            .map(|e| e.to_string());
                        saw_final = true;
                    }
                }
                let is_final = matches!(event, StreamEvent::Chunk(ref c) if c.is_final);
                if tx.send(event).await.is_err() {
                    // Consumer dropped the SSE connection; stop the stream.
                    this.streams.cancel(&request.id);
                    break;
                }
                if is_final {
                    break;
                }
            }

            let status = if !saw_final {
                RequestStatus::Cancelled
            } else if error.is_some() {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            };
            let mut response = GatewayResponse::new(&request.id, status);
            response.provider = provider.or(Some(request.provider.clone()));
            response.tokens_used = tokens;
            match status {
                RequestStatus::Completed => response.response = Some(content),
                RequestStatus::Failed => response.error = error,
                _ => response.error = Some("stream cancelled".to_string()),
            }
            let latency = (now() - request.created_at) * 1000.0;
            response.latency_ms = Some(latency);
            if let Err(e) = this.finalize(&request, response, latency) {
                tracing::error!(request_id = %request.id, error = %e, "failed to finalize stream");
            }
        });
        Ok(rx)
    }

    // ---- background loops ----

    async fn timeout_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TIMEOUT_SCAN_INTERVAL);
        loop {
            ticker.tick().await;
            let timed_out = match self.queue.check_timeouts() {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "timeout scan failed");
                    continue;
                }
            };
            for request_id in timed_out {
                self.finish_timed_out(&request_id);
            }
        }
    }

    fn finish_timed_out(&self, request_id: &str) {
        tracing::warn!(request_id = %request_id, "request timed out");
        if let Some(handle) = self.active.lock().unwrap().remove(request_id) {
            handle.abort();
        }
        self.streams.cancel(request_id);

        let request = match self.store.get_request(request_id) {
            Ok(Some(request)) => request,
            _ => return,
        };
        let mut response = GatewayResponse::new(request_id, RequestStatus::Timeout);
        response.error = Some(format!(
            "Request timed out after {}s",
            request.timeout_s
        ));
        response.provider = Some(request.provider.clone());
        response.latency_ms = Some(request.timeout_s * 1000.0);
        if let Err(e) = self.store.save_response(&response) {
            tracing::error!(error = %e, "failed to save timeout response");
        }

        self.metrics.inc_requests(&request.provider, "timeout");
        let _ = self.store.record_metric(
            &request.provider,
            "timeout",
            Some(request_id),
            Some(request.timeout_s * 1000.0),
            false,
            response.error.as_deref(),
        );
        self.reliability.record_failure(&request.provider, false, true);
        self.backpressure
            .record_request_complete(request.timeout_s * 1000.0, false);

        if let Some(waiter) = self.waiters.lock().unwrap().remove(request_id) {
            let _ = waiter.send(response);
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let interval = Duration::from_secs_f64(self.config.health_check.interval_s.max(1.0));
        let probe_timeout = Duration::from_secs_f64(self.config.health_check.timeout_s.max(1.0));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (name, backend) in &self.backends {
                let healthy = tokio::time::timeout(probe_timeout, backend.health_check())
                    .await
                    .unwrap_or(false);
                if let Err(e) = self.apply_health(name, backend.kind(), healthy) {
                    tracing::error!(provider = %name, error = %e, "health update failed");
                }
            }
        }
    }

    fn apply_health(&self, name: &str, kind: BackendKind, healthy: bool) -> Result<()> {
        let mut info = self
            .store
            .get_provider_status(name)?
            .unwrap_or_else(|| ProviderInfo::new(name, kind));
        info.status = if !healthy {
            ProviderStatus::Unavailable
        } else if self.reliability.is_healthy(name) {
            ProviderStatus::Healthy
        } else {
            ProviderStatus::Degraded
        };
        info.last_check = Some(now());
        info.error = if healthy {
            None
        } else {
            Some("health check failed".to_string())
        };
        let stats = self.queue.stats();
        info.queue_depth = stats.by_provider.get(name).copied().unwrap_or(0) as i64;
        self.metrics.set_queue_depth(name, info.queue_depth);
        self.store.update_provider_status(&info)
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        // The first tick fires immediately; skip it so startup stays cheap.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.store.cleanup_old_requests(self.config.request_ttl_hours) {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "cleaned up old requests");
                }
                Err(e) => tracing::error!(error = %e, "request cleanup failed"),
                _ => {}
            }
            if let Err(e) = self.store.cleanup_old_metrics(METRICS_RETENTION_HOURS) {
                tracing::error!(error = %e, "metrics cleanup failed");
            }
            if let Err(e) = self.cache.cleanup_expired() {
                tracing::error!(error = %e, "cache cleanup failed");
            }
            if let Err(e) = self.cache.enforce_max_entries() {
                tracing::error!(error = %e, "cache eviction failed");
            }
            self.limiter.sweep_stale(now());
        }
    }

    async fn backpressure_loop(self: Arc<Self>) {
        let interval =
            Duration::from_secs_f64(self.config.backpressure.evaluation_interval_s.max(0.1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.backpressure.evaluate_and_adjust();
        }
    }

    // ---- accessors for the HTTP surface ----

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    pub fn reliability(&self) -> &ReliabilityTracker {
        &self.reliability
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        if let Some(alias) = provider.strip_prefix('@') {
            return !self.config.parallel.group(alias).is_empty();
        }
        self.backends.contains_key(provider)
    }
}

impl ReliabilityTracker {
    /// Convenience wrapper used by the parallel accounting path.
    fn record_failure_or_success(&self, provider: &str, success: bool, error: Option<&str>) {
        if success {
            self.record_success(provider);
        } else {
            let error = error.unwrap_or_default();
            self.record_failure(
                provider,
                detect_auth_failure(error),
                error.to_lowercase().contains("timeout"),
            );
        }
    }
}

fn split_tokens(response: &GatewayResponse, total: i64) -> (i64, i64) {
    let meta = response.metadata.as_ref();
    let input = meta
        .and_then(|m| m.get("input_tokens"))
        .and_then(|v| v.as_i64());
    let output = meta
        .and_then(|m| m.get("output_tokens"))
        .and_then(|v| v.as_i64());
    match (input, output) {
        (Some(input), Some(output)) => (input, output),
        _ => (0, total.max(0)),
    }
}
