// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache coordinator.
//!
//! The [`CacheCoordinator`] ties the tiers together:
//! - L1 in-process strict LRU ([`LruTier`])
//! - L2 shared store (Redis) behind a circuit breaker and timeout
//! - L3 durable store (SQL) behind a circuit breaker and timeout
//! - the performance optimizer, pool manager, and metrics aggregator
//!
//! # Read path
//!
//! `get` probes L1 → L2 → L3. A hit in a lower tier is copied into every
//! faster tier (L1, and L2 for an L3 hit). A tier that is unavailable or
//! dirty is skipped; an entry that fails to decode is evicted and treated
//! as a miss.
//!
//! # Write path
//!
//! `put` writes every tier the [`TierHints`] accept. L1 is written only
//! after a lower tier accepted the value. Tiers the hints exclude have any
//! older copy of the key removed, so a `put` always supersedes the key.
//!
//! # Ordering
//!
//! Per-key operations hold a key-striped lock. Nothing is held across the
//! keyspace: `invalidate` bumps an epoch instead, and a lookup or write
//! that overlapped one skips filling faster tiers, so a copy read before
//! an invalidation never lands in a tier that invalidation cleared.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_cache::{CacheCoordinator, CacheConfig, EngineState, TierHints};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     sql_url: Some("sqlite:cache.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut cache = CacheCoordinator::new(config, rx);
//! assert_eq!(cache.state(), EngineState::Created);
//!
//! cache.start().await.expect("start failed");
//! let cache = Arc::new(cache);
//! cache.spawn_maintenance();
//!
//! cache.put("q:abc", b"answer".to_vec(), None, TierHints::all()).await;
//! assert!(cache.get("q:abc").await.is_hit());
//!
//! cache.shutdown().await;
//! # }
//! ```

mod compute;
mod epoch;
mod invalidate;
mod key_locks;
mod lifecycle;
mod tier;
mod types;

pub use compute::{ComputeError, ComputeRequest, Computed};
pub use types::{
    EngineState, HealthReport, InvalidationReport, Lookup, MaintenanceReport, PutReport,
    TierHealth, TierInvalidation,
};

use std::sync::Arc;
use std::time::Duration;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregator::MetricsAggregator;
use crate::cache_entry::{now_millis, CacheEntry, TierId};
use crate::config::CacheConfig;
use crate::optimizer::PerformanceOptimizer;
use crate::pattern::KeyPattern;
use crate::pool::ConnectionPoolManager;
use crate::storage::lru_tier::{LruTier, Probe};
use crate::storage::traits::{CacheStore, StorageError};
use crate::tier_hints::TierHints;

use epoch::InvalidationEpoch;
use key_locks::{KeyLocks, DEFAULT_STRIPES};
use tier::RemoteTier;

/// Effective TTL for one tier: the request capped at the tier's TTL, or the
/// tier default when none was requested.
fn tier_ttl(config: &CacheConfig, tier: TierId, requested: Option<Duration>) -> Duration {
    let cap = Duration::from_secs(match tier {
        TierId::L1 => config.l1_ttl_secs,
        TierId::L2 => config.l2_ttl_secs,
        TierId::L3 => config.l3_ttl_secs,
    });
    requested.map_or(cap, |ttl| ttl.min(cap))
}

/// Outcome of writing one remote tier.
enum RemoteWrite {
    Written(TierId),
    Failed(TierId),
    SkippedDirty(TierId),
    /// Not targeted by the hints (any older copy was removed), or absent
    Untouched,
}

/// Main cache coordinator.
///
/// Build one at startup, call [`start()`](Self::start), wrap it in an
/// `Arc` and share it.
///
/// # Thread Safety
///
/// The coordinator is `Send + Sync`. Disjoint keys never contend beyond a
/// shared lock stripe; L1 is sharded.
pub struct CacheCoordinator {
    /// Configuration (updated at runtime via the watch channel)
    pub(super) config: RwLock<CacheConfig>,

    /// Runtime config updates, checked on every maintenance tick
    pub(super) config_rx: Mutex<watch::Receiver<CacheConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// L1: in-process strict LRU
    pub(super) l1: LruTier,

    /// L2: shared store (optional)
    pub(super) l2: Option<RemoteTier>,

    /// L3: durable store (optional)
    pub(super) l3: Option<RemoteTier>,

    pub(super) pools: ConnectionPoolManager,
    pub(super) optimizer: PerformanceOptimizer,
    pub(super) metrics: MetricsAggregator,
    pub(super) key_locks: KeyLocks,

    /// Bumped by `invalidate`; fills and promotions check it
    pub(super) epoch: InvalidationEpoch,

    /// Stops the maintenance task
    pub(super) cancel: CancellationToken,
    pub(super) maintenance: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Create a new coordinator.
    ///
    /// Starts in `Created` state with only L1. Call [`start()`](Self::start)
    /// to connect the configured backends, or attach stores directly with
    /// [`with_l2_store`](Self::with_l2_store) / [`with_l3_store`](Self::with_l3_store).
    pub fn new(config: CacheConfig, config_rx: watch::Receiver<CacheConfig>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Self {
            l1: LruTier::new(
                config.l1_max_entries,
                config.l1_max_bytes,
                config.l1_shards,
                config.l1_max_entry_bytes,
            ),
            l2: None,
            l3: None,
            pools: ConnectionPoolManager::new(&config),
            optimizer: PerformanceOptimizer::new(config.optimizer.clone(), config.l1_max_entries),
            metrics: MetricsAggregator::new(),
            key_locks: KeyLocks::new(DEFAULT_STRIPES),
            epoch: InvalidationEpoch::new(),
            cancel: CancellationToken::new(),
            maintenance: parking_lot::Mutex::new(None),
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
        }
    }

    /// Use `store` as the shared tier instead of connecting `redis_url`.
    #[must_use]
    pub fn with_l2_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        let config = self.config.read().clone();
        self.l2 = Some(RemoteTier::new(TierId::L2, store, &config.l2_circuit, config.tier_timeout()));
        self
    }

    /// Use `store` as the durable tier instead of connecting `sql_url`.
    #[must_use]
    pub fn with_l3_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        let config = self.config.read().clone();
        self.l3 = Some(RemoteTier::new(TierId::L3, store, &config.l3_circuit, config.tier_timeout()));
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_serving()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    /// Current configuration (including applied runtime updates).
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Pool registry. Register downstream dependencies (embedding, LLM,
    /// search endpoints) here so they are reported and drained with the engine.
    #[must_use]
    pub fn pools(&self) -> &ConnectionPoolManager {
        &self.pools
    }

    #[must_use]
    pub fn optimizer(&self) -> &PerformanceOptimizer {
        &self.optimizer
    }

    #[must_use]
    pub fn has_tier(&self, tier: TierId) -> bool {
        match tier {
            TierId::L1 => true,
            TierId::L2 => self.l2.is_some(),
            TierId::L3 => self.l3.is_some(),
        }
    }

    /// Tiers currently bypassed pending resync.
    #[must_use]
    pub fn dirty_tiers(&self) -> Vec<TierId> {
        self.remote_tiers().filter(|t| t.is_dirty()).map(|t| t.id()).collect()
    }

    #[must_use]
    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    #[must_use]
    pub fn l1_size_bytes(&self) -> usize {
        self.l1.size_bytes()
    }

    #[inline]
    pub(super) fn remote_tiers(&self) -> impl Iterator<Item = &RemoteTier> {
        self.l2.iter().chain(self.l3.iter())
    }

    /// Queue a delete of `key` on a tier that may now hold a stale copy.
    fn mark_key_dirty(&self, tier: &RemoteTier, key: &str) {
        match KeyPattern::exact(key).or_else(|_| KeyPattern::parse("*")) {
            Ok(pattern) => tier.mark_dirty(pattern),
            Err(e) => warn!(tier = %tier.id(), error = %e, "Cannot express key as pattern"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════

    /// Look up `key` in L1 → L2 → L3.
    ///
    /// Returns a snapshot copy. Never fails: unavailable tiers are skipped.
    #[tracing::instrument(skip(self), fields(tier))]
    pub async fn get(&self, key: &str) -> Lookup {
        let seen = self.epoch.current();
        let lookup = {
            let _key = self.key_locks.lock(key).await;
            self.lookup_locked(key, seen).await
        };

        let hit = lookup.is_hit();
        self.metrics.record_lookup(hit);
        self.optimizer.record_lookup(hit);
        tracing::Span::current().record("tier", lookup.tier().map_or("miss", |t| t.as_str()));
        lookup
    }

    async fn lookup_locked(&self, key: &str, seen: u64) -> Lookup {
        match self.l1.get(key, now_millis()) {
            Probe::Hit(entry) => {
                self.metrics.record_hit(TierId::L1);
                return Lookup::Hit { entry, tier: TierId::L1 };
            }
            Probe::Expired => {
                self.metrics.record_expirations(TierId::L1, 1);
                self.metrics.record_miss(TierId::L1);
            }
            Probe::Miss => self.metrics.record_miss(TierId::L1),
        }

        for tier in self.remote_tiers() {
            let id = tier.id();
            if tier.is_dirty() {
                self.metrics.record_skipped_dirty(id);
                continue;
            }

            match tier.call("get", &self.metrics, || tier.store().get(key)).await {
                Ok(Some(entry)) if !entry.is_expired_at(now_millis()) => {
                    self.metrics.record_hit(id);
                    self.promote(&entry, id, seen).await;
                    return Lookup::Hit { entry, tier: id };
                }
                Ok(_) => self.metrics.record_miss(id),
                Err(StorageError::Serialization { reason, .. }) => {
                    warn!(tier = %id, key = %key, reason = %reason, "Undecodable entry, evicting");
                    self.metrics.record_serialization_error(id);
                    self.metrics.record_miss(id);
                    if let Err(e) = tier.call("delete", &self.metrics, || tier.store().delete(key)).await {
                        debug!(tier = %id, error = %e, "Evicting undecodable entry failed");
                        self.mark_key_dirty(tier, key);
                    }
                }
                Err(e) => {
                    debug!(tier = %id, error = %e, "Tier unavailable, falling through");
                }
            }
        }

        Lookup::Miss
    }

    /// Copy a lower-tier hit into every faster tier, unless an invalidation
    /// overlapped the lookup that read it.
    async fn promote(&self, entry: &CacheEntry, source: TierId, seen: u64) {
        let now = now_millis();
        let (l1_cap, l2_cap) = {
            let config = self.config.read();
            (tier_ttl(&config, TierId::L1, None), tier_ttl(&config, TierId::L2, None))
        };

        if source == TierId::L3 {
            if let Some(l2) = self.l2.as_ref().filter(|t| !t.is_dirty()) {
                self.promote_remote(l2, entry, source, l2_cap, seen, now).await;
            }
        }

        let copy = entry.promoted_copy(source, l1_cap, now);
        if copy.remaining_ttl(now).is_zero() {
            return;
        }
        let Some(outcome) = self.epoch.fill_if_current(seen, || self.l1.insert(copy)) else {
            debug!(key = %entry.key, "Invalidation overlapped lookup, not promoting into L1");
            return;
        };
        self.metrics.record_evictions(TierId::L1, outcome.evicted);
        if !outcome.rejected {
            self.metrics.record_promotion(source, TierId::L1);
        }
    }

    /// The remote write cannot sit inside the epoch's critical section, so
    /// a copy that raced an invalidation is deleted again afterwards.
    async fn promote_remote(
        &self,
        tier: &RemoteTier,
        entry: &CacheEntry,
        source: TierId,
        cap: Duration,
        seen: u64,
        now: u64,
    ) {
        let copy = entry.promoted_copy(source, cap, now);
        if copy.remaining_ttl(now).is_zero() || !self.epoch.is_current(seen) {
            return;
        }
        match tier.call("promote", &self.metrics, || tier.store().put(&copy)).await {
            Ok(()) => self.metrics.record_promotion(source, tier.id()),
            Err(e) => {
                debug!(tier = %tier.id(), error = %e, "Promotion failed");
                return;
            }
        }

        if !self.epoch.is_current(seen) {
            debug!(tier = %tier.id(), key = %entry.key, "Invalidation overlapped promotion, withdrawing copy");
            if let Err(e) = tier.call("delete", &self.metrics, || tier.store().delete(&entry.key)).await {
                debug!(tier = %tier.id(), error = %e, "Withdrawing promoted copy failed");
                self.mark_key_dirty(tier, &entry.key);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write path
    // ═══════════════════════════════════════════════════════════════════════

    /// Write `value` through to every tier `hints` accepts.
    ///
    /// `ttl` is capped per tier; `None` uses each tier's default. L1 is
    /// written only if a lower tier accepted the value.
    #[tracing::instrument(skip(self, value, hints), fields(bytes = value.len()))]
    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        hints: TierHints,
    ) -> PutReport {
        let seen = self.epoch.current();
        let _key = self.key_locks.lock(key).await;

        let now = now_millis();
        let [l1_ttl, l2_ttl, l3_ttl] = {
            let config = self.config.read();
            TierId::ALL.map(|t| tier_ttl(&config, t, ttl))
        };

        let (l2, l3) = tokio::join!(
            self.write_remote(self.l2.as_ref(), key, &value, l2_ttl, hints, now),
            self.write_remote(self.l3.as_ref(), key, &value, l3_ttl, hints, now),
        );

        let mut report = PutReport::default();
        for outcome in [l2, l3] {
            match outcome {
                RemoteWrite::Written(id) => report.written.push(id),
                RemoteWrite::Failed(id) => report.failed.push(id),
                RemoteWrite::SkippedDirty(id) => report.skipped_dirty.push(id),
                RemoteWrite::Untouched => {}
            }
        }

        if hints.l1 && report.is_stored() && !l1_ttl.is_zero() {
            let entry = CacheEntry::new_at(key, value, TierId::L1, l1_ttl, now);
            match self.epoch.fill_if_current(seen, || self.l1.insert(entry)) {
                Some(outcome) => {
                    self.metrics.record_evictions(TierId::L1, outcome.evicted);
                    self.metrics.record_write(TierId::L1, !outcome.rejected);
                    report.l1_evicted = outcome.evicted;
                    report.l1_rejected = outcome.rejected;
                    if outcome.rejected {
                        self.l1.remove(key);
                    } else {
                        report.written.insert(0, TierId::L1);
                    }
                }
                None => {
                    debug!(key = %key, "Invalidation overlapped write, L1 not filled");
                    self.l1.remove(key);
                }
            }
        } else {
            self.l1.remove(key);
        }

        if !report.failed.is_empty() {
            warn!(key = %key, failed = ?report.failed, "Write-through incomplete");
        }
        report
    }

    async fn write_remote(
        &self,
        tier: Option<&RemoteTier>,
        key: &str,
        value: &[u8],
        ttl: Duration,
        hints: TierHints,
        now: u64,
    ) -> RemoteWrite {
        let Some(tier) = tier else {
            return RemoteWrite::Untouched;
        };
        let id = tier.id();

        if tier.is_dirty() {
            self.metrics.record_skipped_dirty(id);
            self.mark_key_dirty(tier, key);
            return RemoteWrite::SkippedDirty(id);
        }

        if !hints.includes(id) || ttl.is_zero() {
            if let Err(e) = tier.call("delete", &self.metrics, || tier.store().delete(key)).await {
                debug!(tier = %id, error = %e, "Could not remove superseded copy");
                self.mark_key_dirty(tier, key);
            }
            return RemoteWrite::Untouched;
        }

        let entry = CacheEntry::new_at(key, value.to_vec(), id, ttl, now);
        match tier.call("put", &self.metrics, || tier.store().put(&entry)).await {
            Ok(()) => {
                self.metrics.record_write(id, true);
                RemoteWrite::Written(id)
            }
            Err(e) => {
                self.metrics.record_write(id, false);
                warn!(tier = %id, key = %key, error = %e, "Tier write failed, marking dirty");
                self.mark_key_dirty(tier, key);
                RemoteWrite::Failed(id)
            }
        }
    }
}
