// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! A remote tier (L2 or L3) as the coordinator sees it.
//!
//! Every call is bounded by the tier timeout and routed through the tier's
//! circuit breaker. Timeouts, connection failures, and open circuits all
//! come back as [`StorageError::Unavailable`]. Decode failures pass through
//! as [`StorageError::Serialization`] without counting against the circuit.
//!
//! A dirty tier is bypassed: reads miss, writes are skipped. It keeps the
//! patterns it failed (or never got) to delete, and is clean again once
//! [`RemoteTier::resync`] replays all of them.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::aggregator::MetricsAggregator;
use crate::cache_entry::TierId;
use crate::pattern::KeyPattern;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::storage::traits::{CacheStore, StorageError};

/// Past this many pending patterns the backlog collapses to `*`.
pub(crate) const MAX_PENDING_PATTERNS: usize = 4096;

/// Failures the circuit counts.
enum TierFault {
    Timeout,
    Unavailable(StorageError),
}

#[derive(Default)]
struct Backlog {
    patterns: Vec<KeyPattern>,
    /// Bumped whenever the backlog is collapsed, so an in-flight replay
    /// knows its prefix is gone
    generation: u64,
}

pub(crate) struct RemoteTier {
    id: TierId,
    store: Arc<dyn CacheStore>,
    circuit: CircuitBreaker,
    timeout_ms: AtomicU64,
    dirty: AtomicBool,
    pending: Mutex<Backlog>,
}

impl RemoteTier {
    pub(crate) fn new(id: TierId, store: Arc<dyn CacheStore>, circuit: &CircuitConfig, timeout: Duration) -> Self {
        Self {
            id,
            store,
            circuit: CircuitBreaker::new(id.as_str(), circuit),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            dirty: AtomicBool::new(false),
            pending: Mutex::new(Backlog::default()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> TierId {
        self.id
    }

    #[inline]
    pub(crate) fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().patterns.len()
    }

    /// Bypass this tier until `pattern` (and everything queued before it)
    /// has been deleted from it.
    pub(crate) fn mark_dirty(&self, pattern: KeyPattern) {
        let mut backlog = self.pending.lock();
        if backlog.patterns.len() >= MAX_PENDING_PATTERNS {
            if let Ok(all) = KeyPattern::parse("*") {
                backlog.patterns = vec![all];
                backlog.generation += 1;
            }
        } else {
            backlog.patterns.push(pattern);
        }
        if !self.dirty.swap(true, Ordering::AcqRel) {
            warn!(tier = %self.id, "Tier marked dirty, bypassing until resync");
            crate::metrics::set_tier_dirty(self.id, true);
        }
    }

    /// Run one store call with timeout and circuit protection.
    pub(crate) async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        metrics: &MetricsAggregator,
        f: F,
    ) -> Result<T, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let timeout = self.timeout();
        let _timer = crate::metrics::LatencyTimer::new(self.id, operation);

        let outcome = self
            .circuit
            .call(|| async move {
                match tokio::time::timeout(timeout, f()).await {
                    Err(_) => Err(TierFault::Timeout),
                    Ok(Err(e)) if e.is_unavailable() => Err(TierFault::Unavailable(e)),
                    Ok(other) => Ok(other),
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitError::Rejected { .. }) => {
                metrics.record_unavailable(self.id, operation);
                Err(StorageError::unavailable(format!("{} circuit open", self.id)))
            }
            Err(CircuitError::Inner(TierFault::Timeout)) => {
                metrics.record_timeout(self.id, operation);
                metrics.record_unavailable(self.id, operation);
                Err(StorageError::unavailable(format!(
                    "{} {} timed out after {} ms",
                    self.id,
                    operation,
                    timeout.as_millis()
                )))
            }
            Err(CircuitError::Inner(TierFault::Unavailable(e))) => {
                metrics.record_unavailable(self.id, operation);
                Err(e)
            }
        }
    }

    /// Replay pending deletes. Returns `true` when the tier came back clean.
    pub(crate) async fn resync(&self, metrics: &MetricsAggregator) -> bool {
        if !self.is_dirty() {
            return false;
        }
        let (patterns, generation) = {
            let backlog = self.pending.lock();
            (backlog.patterns.clone(), backlog.generation)
        };

        let mut replayed = 0usize;
        for pattern in &patterns {
            match self.call("resync", metrics, || self.store.delete_matching(pattern)).await {
                Ok(removed) => {
                    debug!(tier = %self.id, pattern = %pattern, removed, "Replayed pending invalidation");
                    replayed += 1;
                }
                Err(e) => {
                    debug!(tier = %self.id, error = %e, "Resync attempt failed, tier stays dirty");
                    break;
                }
            }
        }

        let mut backlog = self.pending.lock();
        if backlog.generation != generation {
            return false;
        }
        let done = replayed.min(backlog.patterns.len());
        backlog.patterns.drain(..done);
        if backlog.patterns.is_empty() {
            self.dirty.store(false, Ordering::Release);
            crate::metrics::set_tier_dirty(self.id, false);
            info!(tier = %self.id, replayed, "Tier resynchronized");
            true
        } else {
            false
        }
    }
}
