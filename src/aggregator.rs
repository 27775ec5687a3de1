// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process counters behind the pull-based [`MetricsSnapshot`].
//!
//! Every `record_*` call also forwards to the push-based [`crate::metrics`]
//! facade, so the coordinator instruments each event once.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use crate::cache_entry::{now_millis, TierId};
use crate::metrics;
use crate::optimizer::OptimizationRecommendation;
use crate::pool::PoolStats;

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    unavailable: AtomicU64,
    timeouts: AtomicU64,
    serialization_errors: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    skipped_dirty: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidated: AtomicU64,
    promotions_in: AtomicU64,
}

/// Outcome of one `get_or_compute` miss path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeOutcome {
    Computed,
    Failed,
    TimedOut,
    PoolExhausted,
}

impl ComputeOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Computed => "computed",
            Self::Failed => "failed",
            Self::TimedOut => "timeout",
            Self::PoolExhausted => "pool_exhausted",
        }
    }
}

/// Per-tier counters and rates.
///
/// Rates are over `attempts = hits + misses + unavailable`, the lookups
/// that reached this tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSnapshot {
    pub tier: TierId,
    pub hits: u64,
    pub misses: u64,
    pub unavailable: u64,
    pub timeouts: u64,
    pub serialization_errors: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub unavailable_rate: f64,
    pub writes: u64,
    pub write_failures: u64,
    /// Reads and writes skipped because the tier was dirty
    pub skipped_dirty: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidated: u64,
    pub promotions_in: u64,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Epoch millis
    pub taken_at: u64,
    pub tiers: Vec<TierSnapshot>,
    /// `get` calls, whatever tier answered
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub computes: u64,
    pub compute_failures: u64,
    pub compute_timeouts: u64,
    pub pool_exhausted: u64,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub dirty_tiers: Vec<TierId>,
    pub pools: Vec<PoolStats>,
    /// Recommendations still inside their cooldown
    pub recommendations: Vec<OptimizationRecommendation>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn tier(&self, tier: TierId) -> Option<&TierSnapshot> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

#[inline]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    tiers: [TierCounters; 3],
    lookups: AtomicU64,
    hits: AtomicU64,
    computes: AtomicU64,
    compute_failures: AtomicU64,
    compute_timeouts: AtomicU64,
    pool_exhausted: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn of(&self, tier: TierId) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn record_hit(&self, tier: TierId) {
        self.of(tier).hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_operation(tier, "get", "hit");
    }

    pub fn record_miss(&self, tier: TierId) {
        self.of(tier).misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_operation(tier, "get", "miss");
    }

    /// A call that failed, timed out, or was rejected by the circuit.
    pub fn record_unavailable(&self, tier: TierId, operation: &'static str) {
        if operation == "get" {
            self.of(tier).unavailable.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_operation(tier, operation, "unavailable");
    }

    pub fn record_timeout(&self, tier: TierId, operation: &'static str) {
        self.of(tier).timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::record_timeout(tier, operation);
    }

    pub fn record_serialization_error(&self, tier: TierId) {
        self.of(tier).serialization_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_serialization_error(tier);
    }

    pub fn record_write(&self, tier: TierId, ok: bool) {
        let counters = self.of(tier);
        if ok {
            counters.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_operation(tier, "put", if ok { "success" } else { "error" });
    }

    pub fn record_skipped_dirty(&self, tier: TierId) {
        self.of(tier).skipped_dirty.fetch_add(1, Ordering::Relaxed);
        metrics::record_skipped_dirty(tier);
    }

    pub fn record_evictions(&self, tier: TierId, count: usize) {
        if count == 0 {
            return;
        }
        self.of(tier).evictions.fetch_add(count as u64, Ordering::Relaxed);
        metrics::record_evictions(tier, count);
    }

    pub fn record_expirations(&self, tier: TierId, count: u64) {
        if count == 0 {
            return;
        }
        self.of(tier).expirations.fetch_add(count, Ordering::Relaxed);
        metrics::record_expirations(tier, count);
    }

    pub fn record_invalidated(&self, tier: TierId, removed: u64) {
        self.of(tier).invalidated.fetch_add(removed, Ordering::Relaxed);
        metrics::record_invalidation(tier, "success", removed);
    }

    pub fn record_promotion(&self, from: TierId, to: TierId) {
        self.of(to).promotions_in.fetch_add(1, Ordering::Relaxed);
        metrics::record_promotion(from, to);
    }

    /// One `get` call finished.
    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_compute(&self, outcome: ComputeOutcome) {
        let counter = match outcome {
            ComputeOutcome::Computed => &self.computes,
            ComputeOutcome::Failed => &self.compute_failures,
            ComputeOutcome::TimedOut => &self.compute_timeouts,
            ComputeOutcome::PoolExhausted => &self.pool_exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_compute(outcome.as_str());
    }

    #[must_use]
    pub fn tier(&self, tier: TierId) -> TierSnapshot {
        let c = self.of(tier);
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let unavailable = c.unavailable.load(Ordering::Relaxed);
        let attempts = hits + misses + unavailable;
        TierSnapshot {
            tier,
            hits,
            misses,
            unavailable,
            timeouts: c.timeouts.load(Ordering::Relaxed),
            serialization_errors: c.serialization_errors.load(Ordering::Relaxed),
            hit_rate: ratio(hits, attempts),
            miss_rate: ratio(misses, attempts),
            unavailable_rate: ratio(unavailable, attempts),
            writes: c.writes.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            skipped_dirty: c.skipped_dirty.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
            promotions_in: c.promotions_in.load(Ordering::Relaxed),
        }
    }

    /// Counter part of the snapshot. Engine-level fields (L1 size, pools,
    /// dirty tiers, recommendations) are left empty for the caller to fill.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        MetricsSnapshot {
            taken_at: now_millis(),
            tiers: TierId::ALL.iter().map(|t| self.tier(*t)).collect(),
            lookups,
            hits,
            misses: lookups.saturating_sub(hits),
            hit_rate: ratio(hits, lookups),
            computes: self.computes.load(Ordering::Relaxed),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            compute_timeouts: self.compute_timeouts.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            l1_entries: 0,
            l1_bytes: 0,
            dirty_tiers: Vec::new(),
            pools: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}
