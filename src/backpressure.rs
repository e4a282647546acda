//! Dynamic backpressure: an evaluation loop reads live load signals and
//! resizes the queue's concurrency bound, with admission control under
//! critical load.

use crate::config::BackpressureConfig;
use crate::types::now;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

const SAMPLE_WINDOW: usize = 100;
const RPS_WINDOW_S: f64 = 60.0;

/// System load levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    /// Headroom to take more load.
    Low,
    Normal,
    /// Approaching limits.
    High,
    /// At or over capacity.
    Critical,
}

impl LoadLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadLevel::Low => "low",
            LoadLevel::Normal => "normal",
            LoadLevel::High => "high",
            LoadLevel::Critical => "critical",
        }
    }
}

/// Signals the controller evaluates.
#[derive(Debug, Clone, Serialize)]
pub struct LoadMetrics {
    pub queue_depth: usize,
    pub processing_count: usize,
    pub max_concurrent: usize,
    pub avg_latency_ms: f64,
    pub latency_p95_ms: f64,
    pub success_rate: f64,
    pub requests_per_second: f64,
}

impl LoadMetrics {
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        self.processing_count as f64 / self.max_concurrent as f64
    }
}

type Getter = Box<dyn Fn() -> usize + Send + Sync>;
type LimitCallback = Box<dyn Fn(usize, usize) + Send + Sync>;
type LoadCallback = Box<dyn Fn(LoadLevel, LoadLevel) + Send + Sync>;

struct ControllerState {
    current_max: usize,
    last_adjustment: f64,
    latency_samples: VecDeque<f64>,
    success_samples: VecDeque<bool>,
    request_timestamps: VecDeque<f64>,
    current_load: LoadLevel,
}

pub struct BackpressureController {
    config: BackpressureConfig,
    queue_getter: Getter,
    processing_getter: Getter,
    state: Mutex<ControllerState>,
    on_limit_change: Mutex<Option<LimitCallback>>,
    on_load_change: Mutex<Option<LoadCallback>>,
}

impl BackpressureController {
    pub fn new(
        config: BackpressureConfig,
        initial_concurrent: usize,
        queue_getter: Getter,
        processing_getter: Getter,
    ) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                current_max: initial_concurrent,
                last_adjustment: 0.0,
                latency_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
                success_samples: VecDeque::with_capacity(SAMPLE_WINDOW),
                request_timestamps: VecDeque::new(),
                current_load: LoadLevel::Normal,
            }),
            config,
            queue_getter,
            processing_getter,
            on_limit_change: Mutex::new(None),
            on_load_change: Mutex::new(None),
        }
    }

    /// Called when the controller resizes the bound: `(old, new)`.
    pub fn set_limit_change_callback(&self, callback: LimitCallback) {
        *self.on_limit_change.lock().unwrap() = Some(callback);
    }

    /// Called when the load level changes: `(old, new)`.
    pub fn set_load_change_callback(&self, callback: LoadCallback) {
        *self.on_load_change.lock().unwrap() = Some(callback);
    }

    pub fn record_request_start(&self) {
        let ts = now();
        let mut state = self.state.lock().unwrap();
        state.request_timestamps.push_back(ts);
        let cutoff = ts - RPS_WINDOW_S;
        while state
            .request_timestamps
            .front()
            .map(|&t| t < cutoff)
            .unwrap_or(false)
        {
            state.request_timestamps.pop_front();
        }
    }

    pub fn record_request_complete(&self, latency_ms: f64, success: bool) {
        let mut state = self.state.lock().unwrap();
        state.latency_samples.push_back(latency_ms);
        if state.latency_samples.len() > SAMPLE_WINDOW {
            state.latency_samples.pop_front();
        }
        state.success_samples.push_back(success);
        if state.success_samples.len() > SAMPLE_WINDOW {
            state.success_samples.pop_front();
        }
    }

    pub fn metrics(&self) -> LoadMetrics {
        let state = self.state.lock().unwrap();
        let avg_latency_ms = if state.latency_samples.is_empty() {
            0.0
        } else {
            state.latency_samples.iter().sum::<f64>() / state.latency_samples.len() as f64
        };
        let latency_p95_ms = if state.latency_samples.is_empty() {
            0.0
        } else {
            let mut sorted: Vec<f64> = state.latency_samples.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
            sorted[idx]
        };
        let success_rate = if state.success_samples.is_empty() {
            1.0
        } else {
            state.success_samples.iter().filter(|&&s| s).count() as f64
                / state.success_samples.len() as f64
        };
        let cutoff = now() - RPS_WINDOW_S;
        let recent = state
            .request_timestamps
            .iter()
            .filter(|&&t| t > cutoff)
            .count();

        LoadMetrics {
            queue_depth: (self.queue_getter)(),
            processing_count: (self.processing_getter)(),
            max_concurrent: state.current_max,
            avg_latency_ms,
            latency_p95_ms,
            success_rate,
            requests_per_second: recent as f64 / RPS_WINDOW_S,
        }
    }

    pub fn load_level(&self) -> LoadLevel {
        let metrics = self.metrics();
        let config = &self.config;

        if metrics.queue_depth >= config.queue_depth_critical
            || metrics.success_rate < config.success_rate_critical
            || metrics.latency_p95_ms >= config.latency_critical_ms
        {
            return LoadLevel::Critical;
        }
        if metrics.queue_depth >= config.queue_depth_high
            || metrics.success_rate < config.success_rate_low
            || metrics.latency_p95_ms >= config.latency_high_ms
            || metrics.utilization() > 0.9
        {
            return LoadLevel::High;
        }
        if metrics.queue_depth <= config.queue_depth_low
            && metrics.utilization() < 0.5
            && metrics.latency_p95_ms < config.latency_target_ms
        {
            return LoadLevel::Low;
        }
        LoadLevel::Normal
    }

    /// One evaluation step, honoring the adjustment cooldown. Returns the
    /// new bound when an adjustment happened.
    pub fn evaluate_and_adjust(&self) -> Option<usize> {
        let ts = now();
        {
            let state = self.state.lock().unwrap();
            if ts - state.last_adjustment < self.config.cooldown_s {
                return None;
            }
        }

        let new_load = self.load_level();
        let old_load = {
            let mut state = self.state.lock().unwrap();
            let old = state.current_load;
            state.current_load = new_load;
            old
        };
        if new_load != old_load {
            tracing::info!(from = old_load.as_str(), to = new_load.as_str(), "load level changed");
            if let Some(ref callback) = *self.on_load_change.lock().unwrap() {
                callback(old_load, new_load);
            }
        }

        let (old_limit, new_limit) = {
            let mut state = self.state.lock().unwrap();
            let old_limit = state.current_max;
            let new_limit = match new_load {
                LoadLevel::Critical => old_limit
                    .saturating_sub(self.config.scale_down_step * 2)
                    .max(self.config.min_concurrent),
                LoadLevel::High => old_limit
                    .saturating_sub(self.config.scale_down_step)
                    .max(self.config.min_concurrent),
                LoadLevel::Low => (old_limit + self.config.scale_up_step)
                    .min(self.config.max_concurrent),
                LoadLevel::Normal => old_limit,
            };
            if new_limit != old_limit {
                state.current_max = new_limit;
                state.last_adjustment = ts;
            }
            (old_limit, new_limit)
        };

        if new_limit != old_limit {
            tracing::info!(old = old_limit, new = new_limit, "adjusted concurrency bound");
            if let Some(ref callback) = *self.on_limit_change.lock().unwrap() {
                callback(old_limit, new_limit);
            }
            Some(new_limit)
        } else {
            None
        }
    }

    pub fn current_max_concurrent(&self) -> usize {
        self.state.lock().unwrap().current_max
    }

    pub fn current_load(&self) -> LoadLevel {
        self.state.lock().unwrap().current_load
    }

    /// Admission control: at critical load, only accept while the queue is
    /// still below the critical threshold.
    pub fn should_accept_request(&self) -> bool {
        if self.load_level() == LoadLevel::Critical {
            return (self.queue_getter)() < self.config.queue_depth_critical;
        }
        true
    }

    /// Human-readable reason for rejecting new work, if any.
    pub fn rejection_reason(&self) -> Option<String> {
        let metrics = self.metrics();
        if metrics.queue_depth >= self.config.queue_depth_critical {
            return Some(format!(
                "Queue depth ({}) exceeds critical threshold ({})",
                metrics.queue_depth, self.config.queue_depth_critical
            ));
        }
        if metrics.success_rate < self.config.success_rate_critical {
            return Some(format!(
                "Success rate ({:.0}%) below critical threshold ({:.0}%)",
                metrics.success_rate * 100.0,
                self.config.success_rate_critical * 100.0
            ));
        }
        None
    }
}
