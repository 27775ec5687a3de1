// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, maintenance loop, health, shutdown.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::tier::RemoteTier;
use super::types::{HealthReport, MaintenanceReport, TierHealth};
use super::{CacheCoordinator, EngineState};
use crate::aggregator::MetricsSnapshot;
use crate::cache_entry::{now_millis, TierId};
use crate::config::CacheConfig;
use crate::pool::DrainReport;
use crate::storage::redis::{RedisStore, REDIS_POOL_NAME};
use crate::storage::sql::{SqlStore, SQL_POOL_NAME};
use crate::storage::traits::StorageError;

impl CacheCoordinator {
    /// Connect the configured backends.
    ///
    /// Startup order:
    /// 1. Connect to SQL (L3): the durable tier. Failure is fatal.
    /// 2. Connect to Redis (L2): a cache. Failure leaves the engine
    ///    running without L2.
    /// 3. Ready!
    ///
    /// Stores attached with `with_l2_store`/`with_l3_store` are kept and
    /// their URL is not dialed.
    #[tracing::instrument(skip(self), fields(has_redis, has_sql))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        let startup_start = Instant::now();
        info!("Starting cache engine...");
        self.set_state(EngineState::Connecting);

        let config = self.config();

        // ========== L3: durable ==========
        if self.l3.is_none() {
            if let Some(ref sql_url) = config.sql_url {
                info!("Connecting to SQL (L3 - durable)...");
                match SqlStore::new(sql_url, &self.pools.config_for(SQL_POOL_NAME)).await {
                    Ok(store) => {
                        self.pools.register_external(store.managed_pool());
                        self.l3 = Some(RemoteTier::new(
                            TierId::L3,
                            Arc::new(store),
                            &config.l3_circuit,
                            config.tier_timeout(),
                        ));
                        info!("SQL (L3) connected");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to connect to SQL, cannot start");
                        self.set_state(EngineState::Stopped);
                        return Err(e);
                    }
                }
            }
        }
        tracing::Span::current().record("has_sql", self.l3.is_some());

        // ========== L2: shared cache ==========
        if self.l2.is_none() {
            if let Some(ref redis_url) = config.redis_url {
                info!(prefix = %config.redis_prefix, "Connecting to Redis (L2 - cache)...");
                let pool_config = self.pools.config_for(REDIS_POOL_NAME);
                match RedisStore::connect(redis_url, &config.redis_prefix, pool_config).await {
                    Ok(store) => {
                        self.pools.register_external(store.pool());
                        self.l2 = Some(RemoteTier::new(
                            TierId::L2,
                            Arc::new(store),
                            &config.l2_circuit,
                            config.tier_timeout(),
                        ));
                        info!("Redis (L2) connected");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to connect to Redis, continuing without L2 cache");
                    }
                }
            }
        }
        tracing::Span::current().record("has_redis", self.l2.is_some());

        self.set_state(EngineState::Ready);
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Cache engine ready");
        Ok(())
    }

    /// Spawn the maintenance task (TTL sweep, durable purge, resync,
    /// runtime config). Stopped by [`shutdown()`](Self::shutdown).
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            debug!("Maintenance task already running");
            return;
        }
        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { engine.maintenance_loop().await }));
        self.set_state(EngineState::Running);
        info!("Cache engine running");
    }

    async fn maintenance_loop(&self) {
        loop {
            let interval = self.config.read().sweep_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Maintenance task cancelled");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
            }
        }
    }

    /// Perform one maintenance pass (for manual control instead of the task).
    pub async fn tick(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            config_applied: self.apply_config_update().await,
            ..Default::default()
        };

        let now = now_millis();
        report.l1_expired = self.l1.sweep_expired(now);
        self.metrics.record_expirations(TierId::L1, report.l1_expired as u64);
        crate::metrics::set_l1_occupancy(self.l1.len(), self.l1.size_bytes());

        if let Some(l3) = self.l3.as_ref().filter(|t| !t.is_dirty()) {
            match l3.call("purge_expired", &self.metrics, || l3.store().purge_expired()).await {
                Ok(purged) => {
                    report.l3_purged = purged;
                    self.metrics.record_expirations(TierId::L3, purged);
                }
                Err(e) => debug!(error = %e, "L3 purge skipped"),
            }
        }

        report.resynced = self.resync_dirty_tiers().await;

        for stats in self.pools.stats() {
            crate::metrics::set_pool_utilization(&stats.name, stats.utilization);
        }
        report
    }

    /// Apply a pending config update. L1 sizing and circuit settings are
    /// fixed at construction; everything else takes effect here.
    async fn apply_config_update(&self) -> bool {
        let mut rx = self.config_rx.lock().await;
        if !rx.has_changed().unwrap_or(false) {
            return false;
        }
        let mut next: CacheConfig = rx.borrow_and_update().clone();
        if let Err(e) = next.validate() {
            warn!(error = %e, "Rejected config update");
            return false;
        }

        let mut config = self.config.write();
        if next.l1_max_entries != config.l1_max_entries
            || next.l1_max_bytes != config.l1_max_bytes
            || next.l1_shards != config.l1_shards
        {
            warn!("L1 sizing changes take effect on restart");
        }
        next.l1_max_entries = config.l1_max_entries;
        next.l1_max_bytes = config.l1_max_bytes;
        next.l1_shards = config.l1_shards;
        next.l1_max_entry_bytes = config.l1_max_entry_bytes;

        self.optimizer.update_config(next.optimizer.clone());
        for tier in self.remote_tiers() {
            tier.set_timeout(next.tier_timeout());
        }
        info!(
            tier_timeout_ms = next.tier_timeout_ms,
            sweep_interval_ms = next.sweep_interval_ms,
            "Config updated"
        );
        *config = next;
        true
    }

    /// Probe every configured tier.
    pub async fn health_check(&self) -> HealthReport {
        let mut tiers = vec![TierHealth {
            tier: TierId::L1,
            configured: true,
            reachable: None,
            dirty: false,
            pending_invalidations: 0,
            circuit: None,
            ping_ms: None,
            error: None,
        }];

        for (id, tier) in [(TierId::L2, self.l2.as_ref()), (TierId::L3, self.l3.as_ref())] {
            let Some(tier) = tier else {
                tiers.push(TierHealth {
                    tier: id,
                    configured: false,
                    reachable: None,
                    dirty: false,
                    pending_invalidations: 0,
                    circuit: None,
                    ping_ms: None,
                    error: None,
                });
                continue;
            };

            let started = Instant::now();
            let ping = tier.call("ping", &self.metrics, || tier.store().ping()).await;
            tiers.push(TierHealth {
                tier: id,
                configured: true,
                reachable: Some(ping.is_ok()),
                dirty: tier.is_dirty(),
                pending_invalidations: tier.pending_count(),
                circuit: Some(tier.circuit_state()),
                ping_ms: ping.is_ok().then(|| started.elapsed().as_millis() as u64),
                error: ping.err().map(|e| e.to_string()),
            });
        }

        let state = self.state();
        let healthy = state.is_serving()
            && tiers
                .iter()
                .filter(|t| t.configured)
                .all(|t| t.reachable != Some(false) && !t.dirty);

        HealthReport {
            state,
            healthy,
            tiers,
            l1_entries: self.l1.len(),
            l1_bytes: self.l1.size_bytes(),
            pools: self.pools.stats(),
        }
    }

    /// Point-in-time metrics, including pools and active recommendations.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.l1_entries = self.l1.len();
        snapshot.l1_bytes = self.l1.size_bytes();
        snapshot.dirty_tiers = self.dirty_tiers();
        snapshot.pools = self.pools.stats();
        snapshot.recommendations = self.optimizer.active_recommendations(snapshot.taken_at);
        snapshot
    }

    /// Initiate graceful shutdown.
    ///
    /// Stops the maintenance task first, then drains every pool (bounded
    /// by each pool's drain timeout).
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Vec<DrainReport> {
        if self.state() == EngineState::Stopped {
            return Vec::new();
        }
        let shutdown_start = Instant::now();
        info!("Initiating cache engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.cancel.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }

        let reports = self.pools.shutdown().await;
        self.set_state(EngineState::Stopped);
        info!(
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            pools = reports.len(),
            "Cache engine shutdown complete"
        );
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::storage::memory::InMemoryStore;
    use crate::tier_hints::TierHints;
    use std::time::Duration;
    use tokio::sync::watch;

    fn config() -> CacheConfig {
        CacheConfig {
            l1_shards: 1,
            sweep_interval_ms: 10,
            l2_circuit: CircuitConfig::disabled(),
            l3_circuit: CircuitConfig::disabled(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_without_backends() {
        let config = config();
        let (_tx, rx) = watch::channel(config.clone());
        let mut coord = CacheCoordinator::new(config, rx);

        coord.start().await.unwrap();
        assert_eq!(coord.state(), EngineState::Ready);
        assert!(!coord.has_tier(TierId::L2));
        assert!(!coord.has_tier(TierId::L3));
    }

    #[tokio::test]
    async fn test_sql_failure_is_fatal() {
        let config = CacheConfig {
            sql_url: Some("sqlite:/nonexistent-dir/cache.db".into()),
            ..config()
        };
        let (_tx, rx) = watch::channel(config.clone());
        let mut coord = CacheCoordinator::new(config, rx);

        assert!(coord.start().await.is_err());
        assert_eq!(coord.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_redis_failure_degrades() {
        let config = CacheConfig {
            redis_url: Some("redis://127.0.0.1:1".into()),
            default_pool: PoolConfig {
                acquire_timeout_ms: 50,
                ..Default::default()
            },
            ..config()
        };
        let (_tx, rx) = watch::channel(config.clone());
        let mut coord = CacheCoordinator::new(config, rx);

        coord.start().await.unwrap();
        assert!(coord.is_ready());
        assert!(!coord.has_tier(TierId::L2));
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_and_shutdown_stops() {
        let config = config();
        let (_tx, rx) = watch::channel(config.clone());
        let mut coord = CacheCoordinator::new(config, rx).with_l3_store(Arc::new(InMemoryStore::new()));
        coord.start().await.unwrap();
        let coord = Arc::new(coord);
        coord.spawn_maintenance();
        assert_eq!(coord.state(), EngineState::Running);

        coord.put("short", vec![1], Some(Duration::from_millis(20)), TierHints::all()).await;
        assert_eq!(coord.l1_len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coord.l1_len(), 0);

        coord.shutdown().await;
        assert_eq!(coord.state(), EngineState::Stopped);
        assert!(coord.maintenance.lock().is_none());
        assert!(coord.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_runtime_config_update() {
        let config = config();
        let (tx, rx) = watch::channel(config.clone());
        let coord = CacheCoordinator::new(config.clone(), rx).with_l2_store(Arc::new(InMemoryStore::new()));

        assert!(!coord.tick().await.config_applied);

        let mut next = config.clone();
        next.tier_timeout_ms = 999;
        next.l1_max_entries = 5;
        next.optimizer.cooldown_secs = 7;
        tx.send(next).unwrap();

        assert!(coord.tick().await.config_applied);
        let applied = coord.config();
        assert_eq!(applied.tier_timeout_ms, 999);
        assert_eq!(applied.l1_max_entries, config.l1_max_entries);
        assert_eq!(coord.optimizer().config().cooldown_secs, 7);
        assert_eq!(coord.l2.as_ref().unwrap().timeout(), Duration::from_millis(999));

        let mut invalid = config.clone();
        invalid.sweep_interval_ms = 0;
        tx.send(invalid).unwrap();
        assert!(!coord.tick().await.config_applied);
        assert_eq!(coord.config().sweep_interval_ms, 10);
    }

    #[tokio::test]
    async fn test_health_and_snapshot() {
        let config = config();
        let (_tx, rx) = watch::channel(config.clone());
        let mut coord = CacheCoordinator::new(config, rx).with_l2_store(Arc::new(InMemoryStore::new()));
        coord.start().await.unwrap();

        let health = coord.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.tier(TierId::L2).unwrap().reachable, Some(true));
        assert!(!health.tier(TierId::L3).unwrap().configured);

        coord.put("k", vec![1, 2, 3], None, TierHints::all()).await;
        coord.get("k").await;
        let snap = coord.metrics_snapshot();
        assert_eq!(snap.l1_entries, 1);
        assert_eq!(snap.hits, 1);
        assert!(snap.dirty_tiers.is_empty());
    }
}
