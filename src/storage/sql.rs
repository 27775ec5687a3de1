// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for the L3 durable tier.
//!
//! One row per entry:
//! ```sql
//! CREATE TABLE cache_entries (
//!   cache_key        VARCHAR(512) PRIMARY KEY,
//!   value            LONGBLOB NOT NULL,
//!   origin           VARCHAR(4) NOT NULL,  -- 'L1' | 'L2' | 'L3'
//!   created_at       BIGINT NOT NULL,      -- epoch millis of the original write
//!   last_accessed_at BIGINT NOT NULL,
//!   ttl_ms           BIGINT NOT NULL,
//!   expires_at       BIGINT NOT NULL,      -- created_at + ttl_ms, indexed
//!   size_bytes       BIGINT NOT NULL,
//!   hit_count        BIGINT NOT NULL
//! )
//! ```
//!
//! `created_at` is persisted, so an entry's TTL keeps counting from its
//! original write across process restarts. Reads filter on `expires_at`;
//! [`CacheStore::purge_expired`] deletes elapsed rows.
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver has no unsigned integers, so counters and timestamps
//! are bound as `i64`. MySQL text columns can come back as bytes, so text
//! reads fall back to `Vec<u8>` (same as for LONGTEXT payloads).
//!
//! `LIKE` is case-insensitive under SQLite's default and MySQL's default
//! collations, so pattern deletes select candidates with `LIKE` and
//! re-check each key against the glob before deleting.

use async_trait::async_trait;
use sqlx::{AnyPool, Row, any::AnyPoolOptions, any::AnyRow};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use crate::cache_entry::{now_millis, CacheEntry, TierId};
use crate::config::PoolConfig;
use crate::pattern::{KeyPattern, SQL_LIKE_ESCAPE};
use crate::pool::{DrainReport, ManagedPool, PoolStats};
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{CacheStore, StorageError};

/// Pool name used for the L3 connection pool.
pub const SQL_POOL_NAME: &str = "sql_l3";

const DELETE_CHUNK: usize = 200;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// The sqlx pool behind [`SqlStore`], exposed to the pool manager.
pub struct SqlPool {
    pool: AnyPool,
    max_size: usize,
    drain_timeout: Duration,
    exhausted: AtomicU64,
}

impl SqlPool {
    fn record_error(&self, e: &sqlx::Error) {
        if matches!(e, sqlx::Error::PoolTimedOut) {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_pool_exhausted(SQL_POOL_NAME);
        }
    }
}

#[async_trait]
impl ManagedPool for SqlPool {
    fn name(&self) -> &str {
        SQL_POOL_NAME
    }

    fn stats(&self) -> PoolStats {
        let size = self.pool.size() as usize;
        let idle = self.pool.num_idle().min(size);
        let in_use = size - idle;
        PoolStats {
            name: SQL_POOL_NAME.to_string(),
            max_size: self.max_size,
            size,
            idle,
            in_use,
            utilization: in_use as f64 / self.max_size.max(1) as f64,
            exhausted: self.exhausted.load(Ordering::Relaxed),
            evicted_unhealthy: 0,
            created: size as u64,
            closed: self.pool.is_closed(),
        }
    }

    async fn shutdown(&self) -> DrainReport {
        let idle = self.pool.num_idle();
        let timed_out = tokio::time::timeout(self.drain_timeout, self.pool.close())
            .await
            .is_err();
        if timed_out {
            warn!(pool = SQL_POOL_NAME, "SQL pool drain timed out");
        }
        DrainReport {
            pool: SQL_POOL_NAME.to_string(),
            closed_idle: idle,
            abandoned: if timed_out { self.pool.size() as usize } else { 0 },
            timed_out,
        }
    }
}

pub struct SqlStore {
    pool: Arc<SqlPool>,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str, pool_config: &PoolConfig) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let max_size = pool_config.max_size.max(1);

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_size as u32)
                .acquire_timeout(pool_config.acquire_timeout())
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::unavailable)
        })
        .await?;

        let store = Self {
            pool: Arc::new(SqlPool {
                pool,
                max_size,
                drain_timeout: pool_config.drain_timeout(),
                exhausted: AtomicU64::new(0),
            }),
            is_sqlite,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    /// The store's pool, for registration with the pool manager.
    #[must_use]
    pub fn managed_pool(&self) -> Arc<SqlPool> {
        self.pool.clone()
    }

    #[inline]
    fn db(&self) -> &AnyPool {
        &self.pool.pool
    }

    fn unavailable(&self, e: sqlx::Error) -> StorageError {
        self.pool.record_error(&e);
        StorageError::unavailable(e)
    }

    /// Enable WAL mode for SQLite: readers don't block the writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(self.db())
            .await
            .map_err(|e| StorageError::unavailable(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(self.db())
            .await
            .map_err(|e| StorageError::unavailable(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    cache_key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    origin TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    last_accessed_at INTEGER NOT NULL,
                    ttl_ms INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    hit_count INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries (expires_at)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    cache_key VARCHAR(512) PRIMARY KEY,
                    value LONGBLOB NOT NULL,
                    origin VARCHAR(4) NOT NULL,
                    created_at BIGINT NOT NULL,
                    last_accessed_at BIGINT NOT NULL,
                    ttl_ms BIGINT NOT NULL,
                    expires_at BIGINT NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    hit_count BIGINT NOT NULL DEFAULT 0,
                    INDEX idx_expires (expires_at)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(self.db())
                    .await
                    .map_err(StorageError::unavailable)
            })
            .await?;
        }
        Ok(())
    }

    /// Text column read that tolerates MySQL returning bytes.
    fn read_text(row: &AnyRow, column: &str) -> Option<String> {
        row.try_get::<String, _>(column).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    fn parse_origin(key: &str, raw: Option<String>) -> Result<TierId, StorageError> {
        match raw.as_deref() {
            Some("L1") => Ok(TierId::L1),
            Some("L2") => Ok(TierId::L2),
            Some("L3") => Ok(TierId::L3),
            other => Err(StorageError::serialization(key, format!("unknown origin {:?}", other))),
        }
    }

    fn row_to_entry(key: &str, row: &AnyRow) -> Result<CacheEntry, StorageError> {
        let value: Vec<u8> = row
            .try_get("value")
            .map_err(|e| StorageError::serialization(key, e))?;
        let origin = Self::parse_origin(key, Self::read_text(row, "origin"))?;
        let int = |column: &str| -> Result<u64, StorageError> {
            let raw: i64 = row
                .try_get(column)
                .map_err(|e| StorageError::serialization(key, e))?;
            u64::try_from(raw).map_err(|_| StorageError::serialization(key, format!("negative {}", column)))
        };

        Ok(CacheEntry {
            key: key.to_string(),
            value,
            origin,
            created_at: int("created_at")?,
            last_accessed_at: int("last_accessed_at")?,
            ttl_ms: int("ttl_ms")?,
            size_bytes: int("size_bytes")? as usize,
            hit_count: int("hit_count")?,
        })
    }

    /// Count rows, expired included.
    pub async fn count_all(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM cache_entries")
            .fetch_one(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;
        let count: i64 = row.try_get("cnt").map_err(|e| self.unavailable(e))?;
        Ok(count.max(0) as u64)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM cache_entries WHERE cache_key IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key);
            }
            removed += query
                .execute(self.db())
                .await
                .map_err(|e| self.unavailable(e))?
                .rows_affected();
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for SqlStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let now = now_millis();
        let row = sqlx::query(
            "SELECT value, origin, created_at, last_accessed_at, ttl_ms, size_bytes, hit_count \
             FROM cache_entries WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now as i64)
        .fetch_optional(self.db())
        .await
        .map_err(|e| self.unavailable(e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut entry = Self::row_to_entry(key, &row)?;

        sqlx::query(
            "UPDATE cache_entries SET hit_count = hit_count + 1, last_accessed_at = ? WHERE cache_key = ?",
        )
        .bind(now as i64)
        .bind(key)
        .execute(self.db())
        .await
        .map_err(|e| self.unavailable(e))?;

        entry.record_hit(now);
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO cache_entries (cache_key, value, origin, created_at, last_accessed_at, ttl_ms, expires_at, size_bytes, hit_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(cache_key) DO UPDATE SET \
                value = excluded.value, \
                origin = excluded.origin, \
                created_at = excluded.created_at, \
                last_accessed_at = excluded.last_accessed_at, \
                ttl_ms = excluded.ttl_ms, \
                expires_at = excluded.expires_at, \
                size_bytes = excluded.size_bytes, \
                hit_count = excluded.hit_count"
        } else {
            "INSERT INTO cache_entries (cache_key, value, origin, created_at, last_accessed_at, ttl_ms, expires_at, size_bytes, hit_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                value = VALUES(value), \
                origin = VALUES(origin), \
                created_at = VALUES(created_at), \
                last_accessed_at = VALUES(last_accessed_at), \
                ttl_ms = VALUES(ttl_ms), \
                expires_at = VALUES(expires_at), \
                size_bytes = VALUES(size_bytes), \
                hit_count = VALUES(hit_count)"
        };

        sqlx::query(sql)
            .bind(&entry.key)
            .bind(&entry.value)
            .bind(entry.origin.as_str())
            .bind(entry.created_at as i64)
            .bind(entry.last_accessed_at as i64)
            .bind(entry.ttl_ms as i64)
            .bind(entry.expires_at() as i64)
            .bind(entry.size_bytes as i64)
            .bind(entry.hit_count as i64)
            .execute(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        if let Some(key) = pattern.literal() {
            let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
                .bind(key)
                .execute(self.db())
                .await
                .map_err(|e| self.unavailable(e))?;
            return Ok(result.rows_affected());
        }

        let sql = format!(
            "SELECT cache_key FROM cache_entries WHERE cache_key LIKE ? ESCAPE '{}'",
            SQL_LIKE_ESCAPE
        );
        let rows = sqlx::query(&sql)
            .bind(pattern.to_sql_like())
            .fetch_all(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;

        let doomed: Vec<String> = rows
            .iter()
            .filter_map(|row| Self::read_text(row, "cache_key"))
            .filter(|key| pattern.matches(key))
            .collect();

        let removed = self.delete_keys(&doomed).await?;
        debug!(pattern = %pattern, candidates = rows.len(), removed, "SQL invalidation complete");
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let started = Instant::now();
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_millis() as i64)
            .execute(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;
        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, elapsed_ms = started.elapsed().as_millis() as u64, "Purged expired L3 rows");
        }
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(self.db())
            .await
            .map_err(|e| self.unavailable(e))?;
        Ok(())
    }
}
