// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Doc Cache
//!
//! A multi-tier cache and performance-optimization engine for document
//! question answering services.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CacheCoordinator                        │
//! │  • get / put / invalidate / get_or_compute                 │
//! │  • Key-striped locks, invalidation epoch                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    L1: In-Process LRU                       │
//! │  • Sharded strict LRU, entry and byte bounds               │
//! │  • TTL checked on read, swept by the maintenance task      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (miss: fall through, hit: promote up)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   L2: Redis (shared)                        │
//! │  • Native key expiry, SCAN-based pattern deletes           │
//! │  • Circuit breaker + per-call timeout                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  L3: MySQL/SQLite (durable)                 │
//! │  • created_at persisted, TTL survives restarts             │
//! │  • Expired rows purged on maintenance ticks                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Alongside the tiers:
//! - [`optimizer`]: windowed latency percentiles per downstream operation,
//!   debounced tuning recommendations
//! - [`pool`]: bounded connection pools per dependency
//! - [`aggregator`]: pull-based [`MetricsSnapshot`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use doc_cache::{fingerprint, CacheCoordinator, CacheConfig, TierHints};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         sql_url: Some("sqlite:doc_cache.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let mut cache = CacheCoordinator::new(config, rx);
//!     cache.start().await.expect("Failed to start");
//!     let cache = Arc::new(cache);
//!     cache.spawn_maintenance();
//!
//!     let key = fingerprint("q", ["doc42", "what is the refund policy?"]);
//!     cache.put(&key, b"30 days".to_vec(), None, TierHints::all()).await;
//!
//!     // L1 → L2 → L3 fallback
//!     if let Some(entry) = cache.get(&key).await.into_entry() {
//!         println!("Found: {:?}", entry.value);
//!     }
//!
//!     cache.invalidate_glob("q:*").await.expect("valid pattern");
//!     cache.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`CacheConfig`] for all configuration options.

pub mod aggregator;
pub mod cache_entry;
pub mod config;
pub mod coordinator;
pub mod fingerprint;
pub mod metrics;
pub mod optimizer;
pub mod pattern;
pub mod pool;
pub mod resilience;
pub mod storage;
pub mod tier_hints;

pub use aggregator::{MetricsAggregator, MetricsSnapshot, TierSnapshot};
pub use cache_entry::{CacheEntry, TierId};
pub use config::{CacheConfig, ConfigError, OptimizerConfig, PoolConfig};
pub use coordinator::{
    CacheCoordinator, ComputeError, ComputeRequest, Computed, EngineState, HealthReport,
    InvalidationReport, Lookup, MaintenanceReport, PutReport, TierHealth, TierInvalidation,
};
pub use fingerprint::fingerprint;
pub use optimizer::{
    timed, OperationType, OptimizationRecommendation, Parameter, PerformanceOptimizer,
    PerformanceSample, SampleParams, WindowStats,
};
pub use pattern::{KeyPattern, PatternError};
pub use pool::{Connector, ConnectionPoolManager, DrainReport, Pool, PoolError, PoolHandle, PoolStats};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{CacheStore, StorageError};
pub use tier_hints::TierHints;
pub use metrics::LatencyTimer;
