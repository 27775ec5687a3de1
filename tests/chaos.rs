//! Chaos Testing for Doc Cache
//!
//! This module tests failure scenarios using:
//! 1. **FailingCacheStore wrappers** - error injection, switchable outages
//! 2. **Slow stores** - tier timeouts
//! 3. **Data corruption** - undecodable entries in storage backends
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos
//! cargo test --test chaos -- --ignored --nocapture   # Redis-backed cases
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use doc_cache::storage::memory::InMemoryStore;
use doc_cache::{
    CacheConfig, CacheCoordinator, CacheEntry, CacheStore, CircuitConfig, CircuitState,
    EngineState, KeyPattern, StorageError, TierHints, TierId,
};

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

// =============================================================================
// Failing Store Wrappers - Precise Error Injection
// =============================================================================

/// A wrapper that fails every call while `down` is set, and optionally on
/// specific call numbers.
pub struct FailingCacheStore<S: CacheStore> {
    inner: S,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    down: AtomicBool,
}

impl<S: CacheStore> FailingCacheStore<S> {
    pub fn new(inner: S) -> Self {
        Self::failing_on(inner, vec![])
    }

    pub fn failing_on(inner: S, fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count) {
            Err(StorageError::unavailable("injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for FailingCacheStore<S> {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.maybe_fail()?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.put(entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.delete(key).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.delete_matching(pattern).await
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        self.maybe_fail()?;
        self.inner.purge_expired().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.ping().await
    }
}

/// Reports listed keys as undecodable until they are deleted.
pub struct CorruptingStore {
    inner: InMemoryStore,
    corrupt: Mutex<HashSet<String>>,
}

impl CorruptingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            corrupt: Mutex::new(HashSet::new()),
        }
    }

    fn corrupt(&self, key: &str) {
        self.corrupt.lock().insert(key.to_string());
    }
}

#[async_trait]
impl CacheStore for CorruptingStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        if self.corrupt.lock().contains(key) {
            return Err(StorageError::serialization(key, "truncated envelope"));
        }
        self.inner.get(key).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.corrupt.lock().remove(&entry.key);
        self.inner.put(entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.corrupt.lock().remove(key);
        self.inner.delete(key).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        self.corrupt.lock().retain(|k| !pattern.matches(k));
        self.inner.delete_matching(pattern).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Answers nothing in time.
pub struct HangingStore;

#[async_trait]
impl CacheStore for HangingStore {
    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }

    async fn put(&self, _entry: &CacheEntry) -> Result<(), StorageError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_matching(&self, _pattern: &KeyPattern) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

/// Reads `slow_key` normally, then holds the answer for `delay` before
/// returning it.
pub struct SlowReadStore {
    inner: InMemoryStore,
    slow_key: String,
    delay: Duration,
}

impl SlowReadStore {
    fn new(slow_key: &str, delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            slow_key: slow_key.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl CacheStore for SlowReadStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let found = self.inner.get(key).await?;
        if key == self.slow_key {
            tokio::time::sleep(self.delay).await;
        }
        Ok(found)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.inner.put(entry).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        self.inner.delete_matching(pattern).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn chaos_config() -> CacheConfig {
    CacheConfig {
        tier_timeout_ms: 50,
        invalidation_retries: 2,
        invalidation_retry_delay_ms: 1,
        l2_circuit: CircuitConfig::disabled(),
        l3_circuit: CircuitConfig::disabled(),
        ..Default::default()
    }
}

fn coordinator(config: CacheConfig) -> CacheCoordinator {
    let (_tx, rx) = watch::channel(config.clone());
    CacheCoordinator::new(config, rx)
}

fn l2_only() -> TierHints {
    TierHints { l1: false, l2: true, l3: false }
}

fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

// =============================================================================
// Tier Outages
// =============================================================================

#[tokio::test]
async fn chaos_l2_outage_falls_through_to_l3() {
    let l2 = Arc::new(FailingCacheStore::new(InMemoryStore::new()));
    let l3 = Arc::new(InMemoryStore::new());
    let cache = coordinator(chaos_config())
        .with_l2_store(l2.clone())
        .with_l3_store(l3.clone());

    let hints = TierHints { l1: false, l2: true, l3: true };
    cache.put("q:both", b"v".to_vec(), None, hints).await;
    cache.put("q:only-l2", b"w".to_vec(), None, l2_only()).await;

    l2.set_down(true);

    let both = cache.get("q:both").await;
    assert_eq!(both.tier(), Some(TierId::L3));

    let only_l2 = cache.get("q:only-l2").await;
    assert!(!only_l2.is_hit());

    let snap = cache.metrics_snapshot();
    let l2_stats = snap.tier(TierId::L2).unwrap();
    assert_eq!(l2_stats.unavailable, 2);
    assert_eq!(l2_stats.misses, 0);
    assert_eq!(snap.tier(TierId::L3).unwrap().misses, 1);
    assert_eq!(snap.misses, 1);
}

#[tokio::test]
async fn chaos_failed_invalidation_marks_dirty_until_resync() {
    let l2 = Arc::new(FailingCacheStore::new(InMemoryStore::new()));
    let cache = coordinator(chaos_config()).with_l2_store(l2.clone());

    cache.put("doc:1:q:a", b"stale".to_vec(), None, l2_only()).await;

    l2.set_down(true);
    let report = cache.invalidate_glob("doc:1:*").await.unwrap();
    assert_eq!(report.dirty_tiers, vec![TierId::L2]);
    assert_eq!(cache.dirty_tiers(), vec![TierId::L2]);

    // Bypassed: even with the store back, the stale copy is never served
    l2.set_down(false);
    assert!(!cache.get("doc:1:q:a").await.is_hit());
    assert_eq!(cache.metrics_snapshot().tier(TierId::L2).unwrap().skipped_dirty, 1);

    let report = cache.tick().await;
    assert_eq!(report.resynced, vec![TierId::L2]);
    assert!(cache.dirty_tiers().is_empty());
    assert!(!cache.get("doc:1:q:a").await.is_hit());
    assert_eq!(cache.metrics_snapshot().tier(TierId::L2).unwrap().misses, 1);
}

#[tokio::test]
async fn chaos_failed_write_never_serves_stale_copy() {
    let l2 = Arc::new(FailingCacheStore::new(InMemoryStore::new()));
    let l3 = Arc::new(InMemoryStore::new());
    let cache = coordinator(chaos_config())
        .with_l2_store(l2.clone())
        .with_l3_store(l3.clone());

    cache.put("q:k", b"v1".to_vec(), None, TierHints::all()).await;

    l2.set_down(true);
    let report = cache.put("q:k", b"v2".to_vec(), None, TierHints::all()).await;
    assert_eq!(report.failed, vec![TierId::L2]);
    assert!(report.wrote(TierId::L3));
    assert!(report.wrote(TierId::L1));
    l2.set_down(false);
    assert_eq!(cache.dirty_tiers(), vec![TierId::L2]);

    // L2 still holds v1 but is bypassed until the key's delete is replayed
    assert_eq!(l2.inner.peek("q:k").map(|e| e.value), Some(b"v1".to_vec()));
    let skip_l1 = TierHints { l1: false, l2: true, l3: true };
    let report = cache.put("q:other", vec![0], None, skip_l1).await;
    assert_eq!(report.skipped_dirty, vec![TierId::L2]);
    assert_eq!(cache.get("q:k").await.into_entry().unwrap().value, b"v2");

    assert_eq!(cache.resync_dirty_tiers().await, vec![TierId::L2]);
    assert!(l2.inner.peek("q:k").is_none());
    assert!(cache.dirty_tiers().is_empty());
}

#[tokio::test]
async fn chaos_tier_timeout_is_bounded() {
    let cache = coordinator(chaos_config()).with_l2_store(Arc::new(HangingStore));

    let started = Instant::now();
    assert!(!cache.get("q:slow").await.is_hit());
    assert!(started.elapsed() < Duration::from_secs(2));

    let snap = cache.metrics_snapshot();
    assert_eq!(snap.tier(TierId::L2).unwrap().timeouts, 1);
    assert_eq!(snap.tier(TierId::L2).unwrap().unavailable, 1);

    let health = cache.health_check().await;
    assert_eq!(health.tier(TierId::L2).unwrap().reachable, Some(false));
    assert!(!health.healthy);
}

#[tokio::test]
async fn chaos_circuit_opens_and_stops_calling_the_store() {
    let config = CacheConfig {
        l2_circuit: CircuitConfig {
            failure_threshold: 4,
            error_rate: 0.5,
            success_threshold: 1,
            recovery_timeout_ms: 60_000,
        },
        ..chaos_config()
    };
    let l2 = Arc::new(FailingCacheStore::new(InMemoryStore::new()));
    let cache = coordinator(config).with_l2_store(l2.clone());
    l2.set_down(true);

    for i in 0..20 {
        assert!(!cache.get(&format!("q:{}", i)).await.is_hit());
    }

    assert!(l2.calls() < 20);
    assert_eq!(cache.metrics_snapshot().tier(TierId::L2).unwrap().unavailable, 20);
    let health = cache.health_check().await;
    assert_eq!(health.tier(TierId::L2).unwrap().circuit, Some(CircuitState::Open));
}

#[tokio::test]
async fn chaos_intermittent_invalidation_failure_is_retried() {
    let l2 = Arc::new(FailingCacheStore::failing_on(InMemoryStore::new(), vec![2]));
    let cache = coordinator(chaos_config()).with_l2_store(l2.clone());

    // Call 1: put succeeds. Call 2: first delete_matching fails, retry succeeds.
    cache.put("q:a", vec![1], None, l2_only()).await;
    let report = cache.invalidate_glob("q:*").await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.removed(TierId::L2), 1);
}

// =============================================================================
// Data Corruption
// =============================================================================

#[tokio::test]
async fn chaos_corrupt_entry_is_evicted_and_missed() {
    let l2 = Arc::new(CorruptingStore::new());
    let l3 = Arc::new(InMemoryStore::new());
    let cache = coordinator(chaos_config())
        .with_l2_store(l2.clone())
        .with_l3_store(l3.clone());

    let hints = TierHints { l1: false, l2: true, l3: true };
    cache.put("q:bad", b"good".to_vec(), None, hints).await;
    l2.corrupt("q:bad");

    let lookup = cache.get("q:bad").await;
    assert_eq!(lookup.tier(), Some(TierId::L3));
    assert_eq!(cache.metrics_snapshot().tier(TierId::L2).unwrap().serialization_errors, 1);

    // Evicted, then repopulated by promotion from L3
    assert_eq!(l2.inner.peek("q:bad").map(|e| e.value), Some(b"good".to_vec()));
    assert!(cache.dirty_tiers().is_empty());
}

// =============================================================================
// Lifecycle Abuse
// =============================================================================

#[tokio::test]
async fn chaos_shutdown_without_start() {
    let cache = coordinator(chaos_config());
    assert!(cache.shutdown().await.is_empty());
    assert_eq!(cache.state(), EngineState::Stopped);
    assert!(cache.shutdown().await.is_empty());
}

#[tokio::test]
async fn chaos_concurrent_reads_during_invalidation() {
    let l2 = Arc::new(InMemoryStore::new());
    let cache = Arc::new(coordinator(chaos_config()).with_l2_store(l2.clone()));
    for i in 0..50 {
        cache.put(&format!("doc:1:q:{}", i), vec![i as u8], None, TierHints::all()).await;
    }

    let readers: Vec<_> = (0..8)
        .map(|r| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    cache.get(&format!("doc:1:q:{}", (i + r) % 50)).await;
                }
            })
        })
        .collect();

    let report = cache.invalidate_glob("doc:1:*").await.unwrap();
    assert!(report.is_clean());
    for reader in readers {
        reader.await.unwrap();
    }

    for i in 0..50 {
        assert!(!cache.get(&format!("doc:1:q:{}", i)).await.is_hit());
    }
    assert!(l2.is_empty());
}

#[tokio::test]
async fn chaos_slow_durable_read_does_not_stall_other_keys() {
    let config = CacheConfig { tier_timeout_ms: 2_000, ..chaos_config() };
    let l3 = Arc::new(SlowReadStore::new("q:slow", Duration::from_millis(300)));
    let cache = Arc::new(
        coordinator(config)
            .with_l2_store(Arc::new(InMemoryStore::new()))
            .with_l3_store(l3.clone()),
    );
    cache.put("q:hot", b"warm".to_vec(), None, TierHints::all()).await;

    let slow = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("q:slow").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let invalidation = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.invalidate_glob("other:*").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let hot = cache.get("q:hot").await;
    let elapsed = started.elapsed();

    assert_eq!(hot.tier(), Some(TierId::L1));
    assert!(elapsed < Duration::from_millis(100), "L1 hit took {:?}", elapsed);
    assert!(invalidation.await.unwrap().unwrap().is_clean());
    assert!(!slow.await.unwrap().is_hit());
}

#[tokio::test]
async fn chaos_read_overlapping_invalidation_is_not_promoted() {
    let config = CacheConfig { tier_timeout_ms: 2_000, ..chaos_config() };
    let l2 = Arc::new(InMemoryStore::new());
    let l3 = Arc::new(SlowReadStore::new("doc:1:q", Duration::from_millis(150)));
    let cache = Arc::new(
        coordinator(config)
            .with_l2_store(l2.clone())
            .with_l3_store(l3.clone()),
    );
    l3.put(&CacheEntry::new("doc:1:q", b"old".to_vec(), TierId::L3, Duration::from_secs(600)))
        .await
        .unwrap();

    // The read picks up the old value, then stalls while the invalidation runs
    let read = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("doc:1:q").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let report = cache.invalidate_glob("doc:1:*").await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.removed(TierId::L3), 1);

    // Concurrent with the invalidation, so it may still answer
    assert_eq!(read.await.unwrap().tier(), Some(TierId::L3));

    assert_eq!(cache.l1_len(), 0);
    assert!(l2.is_empty());
    assert!(!cache.get("doc:1:q").await.is_hit());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn chaos_garbage_bytes_in_redis() {
    let docker = Cli::default();
    let redis = redis_container(&docker);
    let url = format!("redis://127.0.0.1:{}", redis.get_host_port_ipv4(6379));

    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SET")
        .arg("qa:q:garbage")
        .arg(&b"\xff\x00not-an-envelope"[..])
        .query_async(&mut conn)
        .await
        .unwrap();

    let config = CacheConfig {
        redis_url: Some(url),
        redis_prefix: "qa:".into(),
        ..chaos_config()
    };
    let (_tx, rx) = watch::channel(config.clone());
    let mut cache = CacheCoordinator::new(config, rx);
    cache.start().await.unwrap();

    assert!(!cache.get("q:garbage").await.is_hit());
    let exists: bool = redis::cmd("EXISTS")
        .arg("qa:q:garbage")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(!exists);
    cache.shutdown().await;
}
