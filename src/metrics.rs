// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push-side instrumentation through the `metrics` facade.
//!
//! The host service installs the exporter (Prometheus, OTEL, etc.). The
//! pull-based [`crate::aggregator::MetricsSnapshot`] is kept separately
//! in-process and does not depend on a recorder being installed.
//!
//! Names carry the `doc_cache_` prefix, counters end in `_total` and
//! duration histograms in `_seconds`. Label values are static strings:
//!
//! | label       | values                                   |
//! |-------------|------------------------------------------|
//! | `tier`      | `L1`, `L2`, `L3`                         |
//! | `operation` | tier calls (`get`, `put`, `delete`, ...) |
//! | `status`    | `hit`, `miss`, `success`, `error`, ...   |
//! | `pool`      | registered pool names                    |

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::cache_entry::TierId;

pub fn record_operation(tier: TierId, operation: &'static str, status: &'static str) {
    counter!("doc_cache_operations_total", "tier" => tier.as_str(), "operation" => operation, "status" => status)
        .increment(1);
}

pub fn record_tier_latency(tier: TierId, operation: &'static str, elapsed: Duration) {
    histogram!("doc_cache_tier_call_seconds", "tier" => tier.as_str(), "operation" => operation)
        .record(elapsed.as_secs_f64());
}

pub fn record_timeout(tier: TierId, operation: &'static str) {
    counter!("doc_cache_tier_timeouts_total", "tier" => tier.as_str(), "operation" => operation).increment(1);
}

/// Entry failed to decode; it was counted as a miss and evicted.
pub fn record_serialization_error(tier: TierId) {
    counter!("doc_cache_serialization_errors_total", "tier" => tier.as_str()).increment(1);
}

pub fn record_promotion(from: TierId, to: TierId) {
    counter!("doc_cache_promotions_total", "from" => from.as_str(), "to" => to.as_str()).increment(1);
}

pub fn record_skipped_dirty(tier: TierId) {
    counter!("doc_cache_dirty_bypass_total", "tier" => tier.as_str()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// L1 occupancy and removals
// ═══════════════════════════════════════════════════════════════════════════

pub fn set_l1_occupancy(entries: usize, bytes: usize) {
    gauge!("doc_cache_l1_entries").set(entries as f64);
    gauge!("doc_cache_l1_bytes").set(bytes as f64);
}

pub fn record_evictions(tier: TierId, count: usize) {
    counter!("doc_cache_evictions_total", "tier" => tier.as_str()).increment(count as u64);
}

pub fn record_expirations(tier: TierId, count: u64) {
    counter!("doc_cache_expirations_total", "tier" => tier.as_str()).increment(count);
}

// ═══════════════════════════════════════════════════════════════════════════
// Invalidation and dirty tiers
// ═══════════════════════════════════════════════════════════════════════════

/// One tier's share of an invalidation: `success`, `queued` or `dirty`.
pub fn record_invalidation(tier: TierId, status: &'static str, removed: u64) {
    counter!("doc_cache_invalidations_total", "tier" => tier.as_str(), "status" => status).increment(1);
    if removed > 0 {
        counter!("doc_cache_invalidated_entries_total", "tier" => tier.as_str()).increment(removed);
    }
}

pub fn set_tier_dirty(tier: TierId, dirty: bool) {
    gauge!("doc_cache_tier_dirty", "tier" => tier.as_str()).set(if dirty { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// Circuit breakers
// ═══════════════════════════════════════════════════════════════════════════

/// 0 closed, 1 half-open, 2 open
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!("doc_cache_circuit_state", "circuit" => circuit.to_owned()).set(f64::from(state));
}

pub fn record_circuit_call(circuit: &str, outcome: &'static str) {
    counter!("doc_cache_circuit_calls_total", "circuit" => circuit.to_owned(), "outcome" => outcome).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection pools
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_pool_exhausted(pool: &str) {
    counter!("doc_cache_pool_exhausted_total", "pool" => pool.to_owned()).increment(1);
}

pub fn record_pool_wait(pool: &str, waited: Duration) {
    histogram!("doc_cache_pool_wait_seconds", "pool" => pool.to_owned()).record(waited.as_secs_f64());
}

/// Idle connection failed its checkout probe and was dropped.
pub fn record_pool_unhealthy(pool: &str) {
    counter!("doc_cache_pool_unhealthy_total", "pool" => pool.to_owned()).increment(1);
}

pub fn set_pool_utilization(pool: &str, utilization: f64) {
    gauge!("doc_cache_pool_utilization", "pool" => pool.to_owned()).set(utilization);
}

// ═══════════════════════════════════════════════════════════════════════════
// Optimizer and read-through
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_downstream_latency(operation: &'static str, elapsed: Duration) {
    histogram!("doc_cache_downstream_seconds", "operation" => operation).record(elapsed.as_secs_f64());
}

pub fn record_recommendation(scope: &str, parameter: &'static str) {
    counter!("doc_cache_recommendations_total", "scope" => scope.to_owned(), "parameter" => parameter)
        .increment(1);
}

pub fn record_compute(status: &'static str) {
    counter!("doc_cache_compute_total", "status" => status).increment(1);
}

pub fn set_engine_state(state: &'static str) {
    counter!("doc_cache_state_transitions_total", "state" => state).increment(1);
}

/// Records a tier call's latency when dropped, so early returns and `?`
/// are still timed.
pub struct LatencyTimer {
    tier: TierId,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(tier: TierId, operation: &'static str) -> Self {
        Self { tier, operation, start: Instant::now() }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_tier_latency(self.tier, self.operation, self.start.elapsed());
    }
}
