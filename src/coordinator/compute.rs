// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through helper: `get`, and on a miss compute with a pooled
//! connection and `put` the result.
//!
//! ```text
//!   get ──hit──► return
//!    │
//!   miss ──► pool.acquire ──► timed(timeout(compute)) ──► put ──► return
//!               │ exhausted          │ timeout / error
//!               ▼                    ▼
//!         ComputeError::Pool   ComputeError::{Timeout, Inner}   (nothing cached)
//! ```
//!
//! Concurrent misses on one key each compute; the last `put` wins.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{Lookup, PutReport};
use super::CacheCoordinator;
use crate::aggregator::ComputeOutcome;
use crate::cache_entry::TierId;
use crate::optimizer::{timed, OperationType, SampleParams};
use crate::pool::{Connector, Pool, PoolError, PoolHandle};
use crate::tier_hints::TierHints;

/// Why a miss could not be filled.
#[derive(Error, Debug)]
pub enum ComputeError<E> {
    /// No connection to the dependency (backpressure when exhausted)
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("compute timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The caller's compute failed
    #[error("compute failed: {0}")]
    Inner(#[source] E),
}

impl<E> ComputeError<E> {
    /// Pool exhausted: the caller should back off.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Pool(PoolError::Exhausted { .. }))
    }
}

/// How to fill a miss.
#[derive(Debug, Clone, Copy)]
pub struct ComputeRequest {
    /// Downstream operation the compute performs, for latency tracking
    pub operation: OperationType,
    pub params: SampleParams,
    /// Requested TTL; capped per tier like any `put`
    pub ttl: Option<Duration>,
    pub hints: TierHints,
}

impl ComputeRequest {
    #[must_use]
    pub fn new(operation: OperationType) -> Self {
        Self {
            operation,
            params: SampleParams::default(),
            ttl: None,
            hints: TierHints::all(),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: SampleParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_hints(mut self, hints: TierHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Result of [`CacheCoordinator::get_or_compute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Computed {
    pub value: Vec<u8>,
    /// Tier that served a hit; `None` when the value was computed
    pub served_from: Option<TierId>,
    /// Where the computed value was stored
    pub put: Option<PutReport>,
}

impl Computed {
    #[must_use]
    pub fn was_cached(&self) -> bool {
        self.served_from.is_some()
    }
}

impl CacheCoordinator {
    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// `compute` receives a connection checked out of `pool`; it is returned
    /// to the pool when `compute` finishes, fails, or times out. Its latency
    /// is recorded for `request.operation`.
    ///
    /// # Errors
    ///
    /// - [`ComputeError::Pool`] when no connection is available in time
    /// - [`ComputeError::Timeout`] when `compute` exceeds `compute_timeout_ms`
    /// - [`ComputeError::Inner`] when `compute` itself fails
    ///
    /// Nothing is cached on error.
    #[tracing::instrument(skip(self, pool, request, compute), fields(operation = %request.operation, pool = pool.name()))]
    pub async fn get_or_compute<C, F, Fut, E>(
        &self,
        key: &str,
        pool: &Arc<Pool<C>>,
        request: ComputeRequest,
        compute: F,
    ) -> Result<Computed, ComputeError<E>>
    where
        C: Connector,
        F: FnOnce(PoolHandle<C>) -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: std::fmt::Display,
    {
        if let Lookup::Hit { entry, tier } = self.get(key).await {
            return Ok(Computed {
                value: entry.value,
                served_from: Some(tier),
                put: None,
            });
        }

        let handle = match pool.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                let outcome = if matches!(e, PoolError::Exhausted { .. }) {
                    ComputeOutcome::PoolExhausted
                } else {
                    ComputeOutcome::Failed
                };
                self.metrics.record_compute(outcome);
                return Err(e.into());
            }
        };

        let timeout = self.config.read().compute_timeout();
        let result = timed(
            &self.optimizer,
            request.operation,
            request.params,
            tokio::time::timeout(timeout, compute(handle)),
        )
        .await;

        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Compute failed, nothing cached");
                self.metrics.record_compute(ComputeOutcome::Failed);
                return Err(ComputeError::Inner(e));
            }
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(key = %key, timeout_ms, "Compute timed out, nothing cached");
                self.metrics.record_compute(ComputeOutcome::TimedOut);
                return Err(ComputeError::Timeout { timeout_ms });
            }
        };
        self.metrics.record_compute(ComputeOutcome::Computed);

        let report = self.put(key, value.clone(), request.ttl, request.hints).await;
        debug!(key = %key, written = ?report.written, "Computed value stored");
        Ok(Computed {
            value,
            served_from: None,
            put: Some(report),
        })
    }
}
