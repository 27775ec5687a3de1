// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Performance optimizer.
//!
//! Ingests latency samples from the miss/compute path, grouped per
//! [`OperationType`] into tumbling windows of `window_size` samples. Each
//! closed window yields p50/p95/throughput. When p95 breaches the target
//! for `breach_windows` (K) consecutive windows, one recommendation is
//! emitted and the streak restarts. An identical recommendation (same
//! scope and parameter) is suppressed until its cooldown elapses.
//!
//! The same debounce applies to the aggregate hit rate: every
//! `min_lookups` lookups close a hit-rate window, and K consecutive windows
//! under `target_hit_rate` produce an `l1_capacity` recommendation.
//!
//! Recommendations are advisory. Nothing here changes configuration.
//!
//! # Example
//!
//! ```rust
//! use doc_cache::config::OptimizerConfig;
//! use doc_cache::optimizer::{timed, OperationType, PerformanceOptimizer, SampleParams};
//!
//! # async fn example() {
//! let optimizer = PerformanceOptimizer::new(OptimizerConfig::default(), 10_000);
//! let params = SampleParams { chunk_size: 512, retrieval_count: 8 };
//!
//! let hits = timed(&optimizer, OperationType::VectorSearch, params, async {
//!     vec!["chunk-1", "chunk-2"]
//! })
//! .await;
//! assert_eq!(hits.len(), 2);
//! # }
//! ```

pub mod recommendation;
pub mod window;

pub use recommendation::{OptimizationRecommendation, Parameter};
pub use window::WindowStats;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use crate::cache_entry::now_millis;
use crate::config::OptimizerConfig;
use window::SampleWindow;

/// Smallest chunk size the optimizer will suggest.
const MIN_CHUNK_SIZE: u64 = 64;

/// Scope used for cache-level (hit rate) recommendations.
pub const CACHE_SCOPE: &str = "cache";

/// Downstream call kinds that are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Embedding,
    VectorSearch,
    LlmCall,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [Self::Embedding, Self::VectorSearch, Self::LlmCall];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::VectorSearch => "vector_search",
            Self::LlmCall => "llm_call",
        }
    }

    /// The parameter a latency breach of this operation is addressed through.
    ///
    /// Embedding cost scales with chunk size; search cost and LLM prompt
    /// length scale with the number of retrieved chunks.
    #[must_use]
    pub fn tuned_parameter(&self) -> Parameter {
        match self {
            Self::Embedding => Parameter::ChunkSize,
            Self::VectorSearch | Self::LlmCall => Parameter::RetrievalCount,
        }
    }

    fn p95_target(&self, config: &OptimizerConfig) -> Duration {
        Duration::from_millis(match self {
            Self::Embedding => config.embedding_p95_target_ms,
            Self::VectorSearch => config.vector_search_p95_target_ms,
            Self::LlmCall => config.llm_p95_target_ms,
        })
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters in effect for a sample. Zero means "not reported" and the
/// configured baseline is assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SampleParams {
    pub chunk_size: u32,
    pub retrieval_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSample {
    pub operation: OperationType,
    pub latency: Duration,
    /// Epoch millis
    pub timestamp: u64,
    pub params: SampleParams,
}

impl PerformanceSample {
    /// A sample stamped now.
    pub fn new(operation: OperationType, latency: Duration, params: SampleParams) -> Self {
        Self {
            operation,
            latency,
            timestamp: now_millis(),
            params,
        }
    }
}

/// Consecutive-breach counter. Resets on a healthy window and after firing.
#[derive(Debug, Default)]
struct Debounce {
    consecutive: usize,
    worst_overshoot: f64,
}

impl Debounce {
    /// Returns the worst overshoot of the streak when it reaches `k`.
    fn observe(&mut self, breached: bool, overshoot: f64, k: usize) -> Option<f64> {
        if !breached {
            self.consecutive = 0;
            self.worst_overshoot = 0.0;
            return None;
        }
        self.consecutive += 1;
        self.worst_overshoot = self.worst_overshoot.max(overshoot);
        if self.consecutive < k.max(1) {
            return None;
        }
        let worst = self.worst_overshoot;
        *self = Self::default();
        Some(worst)
    }
}

#[derive(Debug, Default)]
struct HitRateWindow {
    hits: u64,
    lookups: u64,
}

#[derive(Default)]
struct OptimizerState {
    windows: HashMap<OperationType, SampleWindow>,
    latency_debounce: HashMap<OperationType, Debounce>,
    last_windows: HashMap<OperationType, WindowStats>,
    hit_window: HitRateWindow,
    hit_debounce: Debounce,
    last_hit_rate: Option<f64>,
    cooldowns: HashMap<(String, Parameter), u64>,
    history: VecDeque<OptimizationRecommendation>,
    emitted: u64,
    suppressed: u64,
}

struct Proposal {
    scope: String,
    parameter: Parameter,
    current_value: u64,
    suggested_value: u64,
    justification: String,
    confidence: f64,
}

pub struct PerformanceOptimizer {
    config: RwLock<OptimizerConfig>,
    l1_capacity: AtomicUsize,
    state: Mutex<OptimizerState>,
}

impl PerformanceOptimizer {
    /// `l1_capacity` is the current L1 entry bound, the basis for
    /// capacity recommendations.
    pub fn new(config: OptimizerConfig, l1_capacity: usize) -> Self {
        Self {
            config: RwLock::new(config),
            l1_capacity: AtomicUsize::new(l1_capacity),
            state: Mutex::new(OptimizerState::default()),
        }
    }

    /// Apply new targets and thresholds. Open windows keep their samples
    /// and close at the new size.
    pub fn update_config(&self, config: OptimizerConfig) {
        *self.config.write() = config;
    }

    pub fn set_l1_capacity(&self, capacity: usize) {
        self.l1_capacity.store(capacity, Ordering::Relaxed);
    }

    #[must_use]
    pub fn config(&self) -> OptimizerConfig {
        self.config.read().clone()
    }

    /// Record a latency sample stamped now.
    pub fn record_latency(
        &self,
        operation: OperationType,
        latency: Duration,
        params: SampleParams,
    ) -> Option<OptimizationRecommendation> {
        self.record(PerformanceSample::new(operation, latency, params))
    }

    /// Ingest one sample. Returns a recommendation when this sample closed
    /// the K-th consecutive breaching window and no cooldown applies.
    pub fn record(&self, sample: PerformanceSample) -> Option<OptimizationRecommendation> {
        crate::metrics::record_downstream_latency(sample.operation.as_str(), sample.latency);

        let config = self.config.read().clone();
        let operation = sample.operation;
        let mut state = self.state.lock();

        let stats = state
            .windows
            .entry(operation)
            .or_insert_with(|| SampleWindow::new(operation, config.window_size))
            .push(sample, config.window_size)?;
        state.last_windows.insert(operation, stats.clone());

        let target = operation.p95_target(&config);
        let breached = stats.p95 > target;
        let overshoot = stats.p95.as_secs_f64() / target.as_secs_f64();
        debug!(
            operation = %operation,
            p50_ms = stats.p50.as_millis() as u64,
            p95_ms = stats.p95.as_millis() as u64,
            target_ms = target.as_millis() as u64,
            throughput = stats.throughput,
            breached,
            "Optimizer window closed"
        );

        let worst = state
            .latency_debounce
            .entry(operation)
            .or_default()
            .observe(breached, overshoot, config.breach_windows)?;

        let parameter = operation.tuned_parameter();
        let (current, floor) = match parameter {
            Parameter::ChunkSize => (
                effective(stats.params.chunk_size, config.baseline_chunk_size),
                MIN_CHUNK_SIZE,
            ),
            _ => (
                effective(stats.params.retrieval_count, config.baseline_retrieval_count),
                1,
            ),
        };
        let ratio = target.as_secs_f64() / stats.p95.as_secs_f64();
        let suggested = scale_down(current, ratio, floor);

        let proposal = Proposal {
            scope: operation.as_str().to_string(),
            parameter,
            current_value: current,
            suggested_value: suggested,
            justification: format!(
                "{} p95 {} ms exceeded the {} ms target for {} consecutive windows of {} samples",
                operation,
                stats.p95.as_millis(),
                target.as_millis(),
                config.breach_windows,
                config.window_size,
            ),
            confidence: recommendation::confidence(worst),
        };
        Self::emit(&mut state, &config, proposal, stats.ended_at)
    }

    /// Count one lookup toward the aggregate hit rate.
    pub fn record_lookup(&self, hit: bool) -> Option<OptimizationRecommendation> {
        let config = self.config.read().clone();
        let mut state = self.state.lock();

        state.hit_window.lookups += 1;
        if hit {
            state.hit_window.hits += 1;
        }
        if state.hit_window.lookups < config.min_lookups.max(1) {
            return None;
        }

        let window = std::mem::take(&mut state.hit_window);
        let rate = window.hits as f64 / window.lookups as f64;
        state.last_hit_rate = Some(rate);

        let breached = rate < config.target_hit_rate;
        let overshoot = if rate > 0.0 { config.target_hit_rate / rate } else { f64::INFINITY };
        let worst = state
            .hit_debounce
            .observe(breached, overshoot, config.breach_windows)?;

        let current = self.l1_capacity.load(Ordering::Relaxed) as u64;
        let proposal = Proposal {
            scope: CACHE_SCOPE.to_string(),
            parameter: Parameter::L1Capacity,
            current_value: current,
            suggested_value: current.saturating_mul(2).max(1),
            justification: format!(
                "hit rate {:.2} below the {:.2} target for {} consecutive windows of {} lookups",
                rate, config.target_hit_rate, config.breach_windows, window.lookups,
            ),
            confidence: recommendation::confidence(worst),
        };
        Self::emit(&mut state, &config, proposal, now_millis())
    }

    fn emit(
        state: &mut OptimizerState,
        config: &OptimizerConfig,
        proposal: Proposal,
        now: u64,
    ) -> Option<OptimizationRecommendation> {
        let key = (proposal.scope.clone(), proposal.parameter);
        if let Some(&until) = state.cooldowns.get(&key) {
            if now < until {
                state.suppressed += 1;
                debug!(
                    scope = %proposal.scope,
                    parameter = %proposal.parameter,
                    remaining_ms = until - now,
                    "Recommendation suppressed by cooldown"
                );
                return None;
            }
        }

        let cooldown_until = now.saturating_add(config.cooldown().as_millis() as u64);
        let rec = OptimizationRecommendation {
            scope: proposal.scope,
            parameter: proposal.parameter,
            current_value: proposal.current_value,
            suggested_value: proposal.suggested_value,
            justification: proposal.justification,
            confidence: proposal.confidence,
            emitted_at: now,
            cooldown_until,
        };

        state.cooldowns.insert(key, cooldown_until);
        state.history.push_back(rec.clone());
        while state.history.len() > config.history_len.max(1) {
            state.history.pop_front();
        }
        state.emitted += 1;

        crate::metrics::record_recommendation(&rec.scope, rec.parameter.as_str());
        info!(
            scope = %rec.scope,
            parameter = %rec.parameter,
            current = rec.current_value,
            suggested = rec.suggested_value,
            confidence = rec.confidence,
            "{}", rec.justification
        );
        Some(rec)
    }

    /// Emitted recommendations, oldest first (bounded by `history_len`).
    #[must_use]
    pub fn recommendations(&self) -> Vec<OptimizationRecommendation> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Recommendations whose cooldown has not elapsed at `now`.
    #[must_use]
    pub fn active_recommendations(&self, now: u64) -> Vec<OptimizationRecommendation> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|r| r.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Stats of the most recently closed window for `operation`.
    #[must_use]
    pub fn latest_window(&self, operation: OperationType) -> Option<WindowStats> {
        self.state.lock().last_windows.get(&operation).cloned()
    }

    /// Hit rate of the most recently closed hit-rate window.
    #[must_use]
    pub fn last_hit_rate(&self) -> Option<f64> {
        self.state.lock().last_hit_rate
    }

    #[must_use]
    pub fn emitted_count(&self) -> u64 {
        self.state.lock().emitted
    }

    /// Recommendations withheld because an identical one was cooling down.
    #[must_use]
    pub fn suppressed_count(&self) -> u64 {
        self.state.lock().suppressed
    }
}

#[inline]
fn effective(reported: u32, baseline: u32) -> u64 {
    if reported == 0 { baseline as u64 } else { reported as u64 }
}

/// Scale `current` by `ratio` (< 1), staying at or above `floor` and
/// strictly below `current` while there is room to shrink.
fn scale_down(current: u64, ratio: f64, floor: u64) -> u64 {
    let scaled = (current as f64 * ratio.clamp(0.0, 1.0)).floor() as u64;
    let ceiling = current.saturating_sub(1).max(floor);
    scaled.clamp(floor, ceiling)
}

/// Time `fut` and record it as a sample for `operation`.
///
/// Composed explicitly at the call site, around the downstream call only.
pub async fn timed<F, T>(
    optimizer: &PerformanceOptimizer,
    operation: OperationType,
    params: SampleParams,
    fut: F,
) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let output = fut.await;
    optimizer.record_latency(operation, start.elapsed(), params);
    output
}
