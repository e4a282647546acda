//! Parallel fan-out execution across a provider group, with five
//! aggregation strategies.
//!
//! Unresolved branches are aborted as soon as the strategy has its answer;
//! an aborted branch never reports a completion, which is how cancellation
//! stays observable in the metrics.

use crate::backend::Backend;
use crate::config::ParallelConfig;
use crate::types::{now, GatewayRequest};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// How the group's responses are reduced to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Race; first success wins, the rest are cancelled.
    FirstSuccess,
    /// First arrival wins, success or not.
    Fastest,
    /// Wait for everyone; first success selected, all responses kept.
    All,
    /// Wait for everyone; median-length success selected.
    Consensus,
    /// Wait for everyone; highest quality score selected.
    BestQuality,
}

impl AggregationStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_success" => Some(Self::FirstSuccess),
            "fastest" => Some(Self::Fastest),
            "all" => Some(Self::All),
            "consensus" => Some(Self::Consensus),
            "best_quality" => Some(Self::BestQuality),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSuccess => "first_success",
            Self::Fastest => "fastest",
            Self::All => "all",
            Self::Consensus => "consensus",
            Self::BestQuality => "best_quality",
        }
    }
}

/// One provider's contribution to a parallel run.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub provider: String,
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub tokens_used: Option<i64>,
}

/// Aggregated result of a parallel run.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelResult {
    pub request_id: String,
    pub strategy: AggregationStrategy,
    pub selected_provider: Option<String>,
    pub selected_response: Option<String>,
    pub all_responses: HashMap<String, ProviderResponse>,
    pub total_latency_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl ParallelResult {
    fn new(request_id: &str, strategy: AggregationStrategy) -> Self {
        Self {
            request_id: request_id.to_string(),
            strategy,
            selected_provider: None,
            selected_response: None,
            all_responses: HashMap::new(),
            total_latency_ms: 0.0,
            success: false,
            error: None,
        }
    }

    fn select(&mut self, response: &ProviderResponse) {
        self.selected_provider = Some(response.provider.clone());
        self.selected_response = response.response.clone();
        self.success = response.success;
        self.error = response.error.clone();
    }

    /// Token count of the selected branch.
    pub fn selected_tokens(&self) -> Option<i64> {
        self.selected_provider
            .as_ref()
            .and_then(|p| self.all_responses.get(p))
            .and_then(|r| r.tokens_used)
    }
}

/// Quality score used by [`AggregationStrategy::BestQuality`]: response
/// length (capped), paragraph and list-structure bonuses, small latency
/// penalty.
fn quality_score(response: &ProviderResponse) -> f64 {
    let Some(ref text) = response.response else {
        return 0.0;
    };
    if !response.success {
        return 0.0;
    }
    let mut score = (text.len() as f64 / 1000.0).min(5.0);
    if text.contains("\n\n") {
        score += 1.0;
    }
    if text.contains("- ") || text.contains("* ") || text.contains("1.") {
        score += 1.0;
    }
    score - response.latency_ms / 10_000.0
}

pub struct ParallelExecutor {
    config: ParallelConfig,
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl ParallelExecutor {
    pub fn new(config: ParallelConfig, backends: HashMap<String, Arc<dyn Backend>>) -> Self {
        Self { config, backends }
    }

    pub fn default_strategy(&self) -> AggregationStrategy {
        AggregationStrategy::parse(&self.config.default_strategy)
            .unwrap_or(AggregationStrategy::FirstSuccess)
    }

    /// Providers behind a `@group` alias, filtered to configured backends.
    pub fn resolve_group(&self, alias: &str) -> Vec<String> {
        self.config
            .group(alias)
            .into_iter()
            .filter(|p| self.backends.contains_key(p))
            .collect()
    }

    /// Fan the request out to `providers` and aggregate per `strategy`.
    pub async fn execute_parallel(
        &self,
        request: &GatewayRequest,
        providers: &[String],
        strategy: Option<AggregationStrategy>,
    ) -> ParallelResult {
        let strategy = strategy.unwrap_or_else(|| self.default_strategy());
        let start = now();
        let mut result = ParallelResult::new(&request.id, strategy);

        let available: Vec<String> = providers
            .iter()
            .filter(|p| self.backends.contains_key(*p))
            .take(self.config.max_concurrent)
            .cloned()
            .collect();
        if available.is_empty() {
            result.error = Some(format!("No available providers from: {:?}", providers));
            return result;
        }

        let mut set = self.spawn_all(request, &available);
        match strategy {
            AggregationStrategy::FirstSuccess => {
                self.collect_first_success(&mut set, &mut result).await;
            }
            AggregationStrategy::Fastest => {
                self.collect_fastest(&mut set, &mut result).await;
            }
            AggregationStrategy::All => {
                self.collect_all(&mut set, &mut result).await;
                select_first_success(&available, &mut result);
            }
            AggregationStrategy::Consensus => {
                self.collect_all(&mut set, &mut result).await;
                select_consensus(&mut result);
            }
            AggregationStrategy::BestQuality => {
                self.collect_all(&mut set, &mut result).await;
                select_best_quality(&mut result);
            }
        }
        set.abort_all();

        result.total_latency_ms = (now() - start) * 1000.0;
        result
    }

    fn spawn_all(
        &self,
        request: &GatewayRequest,
        providers: &[String],
    ) -> JoinSet<ProviderResponse> {
        let mut set = JoinSet::new();
        for provider in providers {
            let backend = self.backends[provider].clone();
            let provider = provider.clone();
            let mut request = request.clone();
            request.provider = provider.clone();
            let call_timeout = Duration::from_secs_f64(self.config.timeout_s.max(0.001));
            set.spawn(async move {
                let start = now();
                match tokio::time::timeout(call_timeout, backend.execute(&request)).await {
                    Ok(result) => ProviderResponse {
                        provider,
                        success: result.success,
                        response: result.response,
                        error: result.error,
                        latency_ms: (now() - start) * 1000.0,
                        tokens_used: result.tokens_used,
                    },
                    Err(_) => ProviderResponse {
                        provider,
                        success: false,
                        response: None,
                        error: Some(format!("Timeout after {}s", call_timeout.as_secs_f64())),
                        latency_ms: (now() - start) * 1000.0,
                        tokens_used: None,
                    },
                }
            });
        }
        set
    }

    fn group_deadline(&self) -> Duration {
        // Per-branch timeouts already bound each task; the group deadline
        // adds slack for scheduling.
        Duration::from_secs_f64(self.config.timeout_s.max(0.001) + 1.0)
    }

    async fn collect_first_success(
        &self,
        set: &mut JoinSet<ProviderResponse>,
        result: &mut ParallelResult,
    ) {
        let deadline = tokio::time::Instant::now() + self.group_deadline();
        let mut first: Option<String> = None;
        loop {
            let joined = tokio::time::timeout_at(deadline, set.join_next()).await;
            match joined {
                Ok(Some(Ok(response))) => {
                    let provider = response.provider.clone();
                    let success = response.success;
                    if first.is_none() {
                        first = Some(provider.clone());
                    }
                    result.all_responses.insert(provider.clone(), response);
                    if success {
                        let selected = result.all_responses[&provider].clone();
                        result.select(&selected);
                        return;
                    }
                }
                Ok(Some(Err(_))) => continue,
                Ok(None) => break,
                Err(_) => {
                    if result.all_responses.is_empty() {
                        result.error = Some("All providers timed out".to_string());
                        return;
                    }
                    break;
                }
            }
        }
        // Nobody succeeded; surface the first completed failure.
        if let Some(first) = first {
            let selected = result.all_responses[&first].clone();
            result.select(&selected);
        } else if result.error.is_none() {
            result.error = Some("All providers timed out".to_string());
        }
    }

    async fn collect_fastest(
        &self,
        set: &mut JoinSet<ProviderResponse>,
        result: &mut ParallelResult,
    ) {
        let joined = tokio::time::timeout(self.group_deadline(), set.join_next()).await;
        match joined {
            Ok(Some(Ok(response))) => {
                let provider = response.provider.clone();
                result.all_responses.insert(provider.clone(), response);
                let selected = result.all_responses[&provider].clone();
                result.select(&selected);
            }
            _ => {
                result.error = Some("All providers timed out".to_string());
            }
        }
    }

    async fn collect_all(&self, set: &mut JoinSet<ProviderResponse>, result: &mut ParallelResult) {
        while let Some(joined) = set.join_next().await {
            if let Ok(response) = joined {
                result.all_responses.insert(response.provider.clone(), response);
            }
        }
    }
}

fn select_first_success(providers: &[String], result: &mut ParallelResult) {
    for provider in providers {
        if let Some(response) = result.all_responses.get(provider) {
            if response.success {
                let selected = response.clone();
                result.select(&selected);
                return;
            }
        }
    }
    result.success = false;
    result.error = Some("No successful responses".to_string());
}

fn select_consensus(result: &mut ParallelResult) {
    let mut successes: Vec<&ProviderResponse> = result
        .all_responses
        .values()
        .filter(|r| r.success && r.response.is_some())
        .collect();
    if successes.is_empty() {
        result.success = false;
        result.error = Some("No successful responses for consensus".to_string());
        return;
    }
    successes.sort_by_key(|r| r.response.as_deref().map(|t| t.len()).unwrap_or(0));
    let median = successes[successes.len() / 2].clone();
    result.select(&median);
}

fn select_best_quality(result: &mut ParallelResult) {
    let best = result
        .all_responses
        .values()
        .map(|r| (quality_score(r), r))
        .filter(|(score, _)| *score > 0.0)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, r)| r.clone());
    match best {
        Some(response) => result.select(&response),
        None => {
            result.success = false;
            result.error = Some("No quality responses found".to_string());
        }
    }
}
