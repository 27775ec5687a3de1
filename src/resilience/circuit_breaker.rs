// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-tier circuit breakers on top of `recloser`.
//!
//! Each remote tier (Redis L2, SQL L3) sits behind its own breaker. While
//! the breaker is open, calls fail fast and the coordinator treats the tier
//! as unavailable without waiting on its timeout.
//!
//! ```text
//!   Closed ──(error rate over window ≥ threshold)──► Open
//!     ▲                                               │
//!     └──(trial calls succeed)── HalfOpen ◄──(wait)───┘
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Observed breaker state, exported as a gauge (0 closed, 1 half-open, 2 open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Open,
            1 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Open circuit, the call never reached the tier
    #[error("circuit open for {circuit}")]
    Rejected { circuit: String },

    #[error("tier call failed: {0}")]
    Inner(#[source] E),
}

/// Breaker tuning for one tier, read from the `[l2_circuit]` / `[l3_circuit]`
/// config tables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CircuitConfig {
    /// Calls in the closed-state window the error rate is measured over
    #[serde(default = "default_window")]
    pub failure_threshold: u32,
    /// Failure fraction (0..=1) over the window that trips the circuit
    #[serde(default = "default_error_rate")]
    pub error_rate: f32,
    /// Trial calls allowed in half-open before deciding
    #[serde(default = "default_trial_calls")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_window() -> u32 { 10 }
fn default_error_rate() -> f32 { 0.5 }
fn default_trial_calls() -> u32 { 2 }
fn default_recovery_timeout_ms() -> u64 { 30_000 }

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_window(),
            error_rate: default_error_rate(),
            success_threshold: default_trial_calls(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitConfig {
    /// Redis L2: a blip is cheap to ride out, so tolerate more and probe
    /// again sooner.
    #[must_use]
    pub fn shared_tier() -> Self {
        Self {
            failure_threshold: 20,
            error_rate: 0.7,
            success_threshold: 1,
            recovery_timeout_ms: 15_000,
        }
    }

    /// SQL L3: trips earlier and recovers cautiously.
    #[must_use]
    pub fn durable_tier() -> Self {
        Self {
            failure_threshold: 5,
            error_rate: 0.4,
            success_threshold: 3,
            recovery_timeout_ms: 60_000,
        }
    }

    /// Never trips in practice. For tests that inject failures and expect
    /// every call to reach the store.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            failure_threshold: 1024,
            error_rate: 1.0,
            success_threshold: 1,
            recovery_timeout_ms: 1,
        }
    }

    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Call outcomes seen by one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    last_state: AtomicU8,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate.clamp(0.0, 1.0))
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout())
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            last_state: AtomicU8::new(CircuitState::Closed as u8),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last observed state.
    ///
    /// recloser does not expose its state, so this is inferred: a rejected
    /// call means open, a success means closed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.last_state.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, state: CircuitState) {
        let previous = CircuitState::from_u8(self.last_state.swap(state as u8, Ordering::Relaxed));
        if previous == state {
            return;
        }
        match state {
            CircuitState::Open => warn!(circuit = %self.name, "Circuit opened, failing fast"),
            CircuitState::Closed | CircuitState::HalfOpen => {
                info!(circuit = %self.name, from = %previous, "Circuit closed")
            }
        }
        crate::metrics::set_circuit_state(&self.name, state as u8);
    }

    /// Run `f` through the breaker. The future is only polled if the
    /// circuit lets the call through.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Closed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                self.transition(CircuitState::Open);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected { circuit: self.name.clone() })
            }
            Err(RecloserError::Inner(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }
}
