// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry of every pool the engine owns.

use super::{Connector, DrainReport, Pool, PoolStats};
use crate::config::{CacheConfig, PoolConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Type-erased view of a pool for stats and shutdown.
#[async_trait]
pub trait ManagedPool: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> PoolStats;
    async fn shutdown(&self) -> DrainReport;
}

#[async_trait]
impl<C: Connector> ManagedPool for Pool<C> {
    fn name(&self) -> &str {
        Pool::name(self)
    }

    fn stats(&self) -> PoolStats {
        Pool::stats(self)
    }

    async fn shutdown(&self) -> DrainReport {
        Pool::shutdown(self).await
    }
}

/// One bounded pool per downstream dependency, keyed by name.
///
/// Pool bounds come from `CacheConfig::pools[name]`, falling back to
/// `CacheConfig::default_pool`.
pub struct ConnectionPoolManager {
    default_pool: PoolConfig,
    overrides: HashMap<String, PoolConfig>,
    pools: DashMap<String, Arc<dyn ManagedPool>>,
}

impl ConnectionPoolManager {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            default_pool: config.default_pool.clone(),
            overrides: config.pools.clone(),
            pools: DashMap::new(),
        }
    }

    /// Pool bounds for a dependency name.
    #[must_use]
    pub fn config_for(&self, name: &str) -> PoolConfig {
        self.overrides.get(name).cloned().unwrap_or_else(|| self.default_pool.clone())
    }

    /// Create and register a pool. Re-registering a name replaces the old
    /// entry (the old pool is not drained).
    pub fn register<C: Connector>(&self, name: &str, connector: C) -> Arc<Pool<C>> {
        let pool = Pool::new(name, connector, self.config_for(name));
        self.pools.insert(name.to_string(), pool.clone() as Arc<dyn ManagedPool>);
        info!(pool = %name, max_size = pool.stats().max_size, "Registered connection pool");
        pool
    }

    /// Track a pool created elsewhere (e.g. a backing store's own pool).
    pub fn register_external(&self, pool: Arc<dyn ManagedPool>) {
        let name = pool.name().to_string();
        info!(pool = %name, "Registered external pool");
        self.pools.insert(name, pool);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Stats for every pool, sorted by name.
    #[must_use]
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut all: Vec<PoolStats> = self.pools.iter().map(|p| p.value().stats()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Drain every pool. Pools stay registered so their final stats remain visible.
    pub async fn shutdown(&self) -> Vec<DrainReport> {
        let pools: Vec<Arc<dyn ManagedPool>> = self.pools.iter().map(|p| p.value().clone()).collect();
        let mut reports = Vec::with_capacity(pools.len());
        for pool in pools {
            reports.push(pool.shutdown().await);
        }
        reports.sort_by(|a, b| a.pool.cmp(&b.pool));
        reports
    }
}
