// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pattern invalidation across all tiers.
//!
//! `invalidate` returns only after every configured tier has either
//! acknowledged the delete or been marked dirty. A dirty tier is bypassed
//! by reads and writes until a resync replays the pattern, so no caller can
//! observe an invalidated entry once `invalidate` has returned.

use std::time::Duration;
use tracing::{info, warn};

use super::tier::RemoteTier;
use super::types::{InvalidationReport, TierInvalidation};
use super::CacheCoordinator;
use crate::cache_entry::TierId;
use crate::pattern::{KeyPattern, PatternError};
use crate::resilience::retry::{retry, RetryConfig};

impl CacheCoordinator {
    /// Remove every entry matching `pattern` from every tier.
    #[tracing::instrument(skip(self), fields(pattern = %pattern))]
    pub async fn invalidate(&self, pattern: &KeyPattern) -> InvalidationReport {
        // Held until every tier is cleared or dirty; overlapping fills are skipped
        let (_epoch, l1_removed) = self.epoch.begin(|| self.l1.remove_matching(pattern) as u64);
        self.metrics.record_invalidated(TierId::L1, l1_removed);

        let budget = {
            let config = self.config.read();
            RetryConfig::invalidation(
                config.invalidation_retries,
                Duration::from_millis(config.invalidation_retry_delay_ms),
            )
        };

        let (l2, l3) = tokio::join!(
            self.invalidate_remote(self.l2.as_ref(), pattern, &budget),
            self.invalidate_remote(self.l3.as_ref(), pattern, &budget),
        );

        let tiers = vec![
            (TierId::L1, TierInvalidation::Cleared { removed: l1_removed }),
            (TierId::L2, l2),
            (TierId::L3, l3),
        ];
        let dirty_tiers: Vec<TierId> = tiers
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TierInvalidation::Dirty { .. }))
            .map(|(tier, _)| *tier)
            .collect();

        let report = InvalidationReport {
            pattern: pattern.to_string(),
            tiers,
            dirty_tiers,
        };
        if report.is_clean() {
            info!(removed = report.removed_total(), "Invalidation complete");
        } else {
            warn!(dirty = ?report.dirty_tiers, "Invalidation left tiers dirty");
        }
        report
    }

    /// Parse a glob and invalidate it.
    ///
    /// # Errors
    ///
    /// The glob is malformed.
    pub async fn invalidate_glob(&self, pattern: &str) -> Result<InvalidationReport, PatternError> {
        let pattern = KeyPattern::parse(pattern)?;
        Ok(self.invalidate(&pattern).await)
    }

    async fn invalidate_remote(
        &self,
        tier: Option<&RemoteTier>,
        pattern: &KeyPattern,
        budget: &RetryConfig,
    ) -> TierInvalidation {
        let Some(tier) = tier else {
            return TierInvalidation::Absent;
        };
        let id = tier.id();

        // Already bypassed: queue behind the existing backlog
        if tier.is_dirty() {
            tier.mark_dirty(pattern.clone());
            crate::metrics::record_invalidation(id, "queued", 0);
            return TierInvalidation::Dirty {
                reason: "tier already dirty".into(),
            };
        }

        let operation = format!("invalidate_{}", id.as_str());
        let outcome = retry(&operation, budget, || {
            tier.call("delete_matching", &self.metrics, move || tier.store().delete_matching(pattern))
        })
        .await;

        match outcome {
            Ok(removed) => {
                self.metrics.record_invalidated(id, removed);
                TierInvalidation::Cleared { removed }
            }
            Err(e) => {
                warn!(tier = %id, error = %e, "Invalidation not acknowledged, marking dirty");
                crate::metrics::record_invalidation(id, "dirty", 0);
                tier.mark_dirty(pattern.clone());
                TierInvalidation::Dirty { reason: e.to_string() }
            }
        }
    }

    /// Replay pending invalidations on every dirty tier. Returns the tiers
    /// that came back clean.
    pub async fn resync_dirty_tiers(&self) -> Vec<TierId> {
        let mut clean = Vec::new();
        for tier in self.remote_tiers() {
            if tier.resync(&self.metrics).await {
                clean.push(tier.id());
            }
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_entry::CacheEntry;
    use crate::config::CacheConfig;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::CacheStore;
    use crate::tier_hints::TierHints;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn coordinator() -> (CacheCoordinator, Arc<InMemoryStore>, Arc<InMemoryStore>) {
        let config = CacheConfig {
            l1_shards: 1,
            l2_circuit: CircuitConfig::disabled(),
            l3_circuit: CircuitConfig::disabled(),
            invalidation_retry_delay_ms: 1,
            ..Default::default()
        };
        let l2 = Arc::new(InMemoryStore::new());
        let l3 = Arc::new(InMemoryStore::new());
        let (_tx, rx) = watch::channel(config.clone());
        let coord = CacheCoordinator::new(config, rx)
            .with_l2_store(l2.clone())
            .with_l3_store(l3.clone());
        (coord, l2, l3)
    }

    #[tokio::test]
    async fn test_invalidate_clears_every_tier() {
        let (coord, l2, l3) = coordinator();
        for key in ["doc:1:q:a", "doc:1:q:b", "doc:2:q:a"] {
            coord.put(key, b"v".to_vec(), None, TierHints::all()).await;
        }

        let report = coord.invalidate_glob("doc:1:*").await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.removed(TierId::L1), 2);
        assert_eq!(report.removed(TierId::L2), 2);
        assert_eq!(report.removed(TierId::L3), 2);

        assert!(!coord.get("doc:1:q:a").await.is_hit());
        assert!(coord.get("doc:2:q:a").await.is_hit());
        assert_eq!(l2.len(), 1);
        assert_eq!(l3.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_without_remote_tiers() {
        let config = CacheConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        let coord = CacheCoordinator::new(config, rx);

        let report = coord.invalidate_glob("*").await.unwrap();
        assert!(report.is_clean());
        assert!(report.tiers.contains(&(TierId::L2, TierInvalidation::Absent)));
    }

    #[tokio::test]
    async fn test_invalidating_dirty_tier_queues_pattern() {
        let (coord, l2, _l3) = coordinator();
        l2.put(&CacheEntry::new("q:1", vec![1], TierId::L2, Duration::from_secs(60)))
            .await
            .unwrap();
        let tier = coord.l2.as_ref().unwrap();
        tier.mark_dirty(KeyPattern::parse("other:*").unwrap());

        let report = coord.invalidate_glob("q:*").await.unwrap();
        assert_eq!(report.dirty_tiers, vec![TierId::L2]);
        assert_eq!(tier.pending_count(), 2);
        assert_eq!(l2.len(), 1);

        assert_eq!(coord.resync_dirty_tiers().await, vec![TierId::L2]);
        assert!(l2.is_empty());
        assert!(coord.dirty_tiers().is_empty());
    }
}
