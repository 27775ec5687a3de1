// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retries with exponential backoff.
//!
//! Two budgets matter to the cache engine:
//! - backend connects at startup, which should fail fast on bad config
//! - invalidation acknowledgements, which decide when a tier goes dirty
//!
//! ```
//! use doc_cache::RetryConfig;
//! use std::time::Duration;
//!
//! let budget = RetryConfig::invalidation(3, Duration::from_millis(50));
//! assert_eq!(budget.max_attempts, Some(3));
//! assert_eq!(budget.backoff(1), Duration::from_millis(50));
//! assert_eq!(budget.backoff(2), Duration::from_millis(100));
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// `max_attempts` counts every call including the first; `None` never
/// gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Backend connect at `start()`: 5 attempts, roughly 3 s worst case.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Per-tier invalidation acknowledgement budget. `invalidate` blocks
    /// until every tier acknowledges or is marked dirty, so keep it short.
    #[must_use]
    pub fn invalidation(attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            initial_delay,
            max_delay: initial_delay.saturating_mul(8),
            factor: 2.0,
        }
    }

    /// Sleep before attempt `failed + 1`, after `failed` failures (1-based).
    #[must_use]
    pub fn backoff(&self, failed: usize) -> Duration {
        let exponent = failed.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn exhausted(&self, failed: usize) -> bool {
        self.max_attempts.is_some_and(|max| failed >= max)
    }
}

/// Run `operation` until it succeeds or the budget runs out, returning the
/// last error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed = 0usize;
    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    debug!(operation = operation_name, failed, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                failed += 1;
                if config.exhausted(failed) {
                    warn!(operation = operation_name, attempts = failed, error = %err, "Retry budget exhausted");
                    return Err(err);
                }
                let delay = config.backoff(failed);
                warn!(
                    operation = operation_name,
                    attempt = failed,
                    max_attempts = ?config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(attempts: usize) -> RetryConfig {
        RetryConfig::invalidation(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_first_success_makes_one_call() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry("get", &quick(3), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("hit")
        })
        .await;

        assert_eq!(result.unwrap(), "hit");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = retry("delete_matching", &quick(3), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("blip {}", n)) } else { Ok(n) }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry("invalidate_L2", &quick(2), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("tier down {}", n))
        })
        .await;

        assert_eq!(result.unwrap_err(), "tier down 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidation_budget_never_zero() {
        let config = RetryConfig::invalidation(0, Duration::from_millis(10));
        assert_eq!(config.max_attempts, Some(1));
        assert_eq!(config.max_delay, Duration::from_millis(80));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::startup();
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(10), Duration::from_secs(2));
        assert_eq!(config.backoff(usize::MAX), Duration::from_secs(2));
    }
}
