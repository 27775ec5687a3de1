// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis storage backend for the L2 tier.
//!
//! Each entry is one Redis STRING holding a bincode envelope of the full
//! [`CacheEntry`] (value plus bookkeeping), written with `SET ... PX` so
//! Redis expires it at the same instant the entry's TTL elapses.
//!
//! Connections come from a bounded [`Pool`] of multiplexed connections,
//! registered with the engine's pool manager as `redis_l2`.
//!
//! Invalidation uses `SCAN MATCH` + `DEL` in batches, never `KEYS`.
//!
//! A hit rewrites the envelope with the bumped hit count, but only if the
//! key still holds the bytes that were read. A concurrent put or delete
//! wins and the bump is dropped.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script, cmd};
use std::sync::Arc;
use tracing::{debug, warn};
use crate::cache_entry::{now_millis, CacheEntry};
use crate::config::PoolConfig;
use crate::pattern::KeyPattern;
use crate::pool::{Connector, Pool, PoolHandle};
use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{CacheStore, StorageError};

/// Pool name used for the L2 connection pool.
pub const REDIS_POOL_NAME: &str = "redis_l2";

const SCAN_BATCH: usize = 500;

/// KEYS[1] = key, ARGV = [bytes read, new envelope, remaining PX].
const RECORD_HIT_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return false
";

/// Opens multiplexed connections and probes them with `PING`.
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(StorageError::unavailable)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn connect(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn is_healthy(&self, conn: &mut MultiplexedConnection) -> bool {
        cmd("PING").query_async::<String>(conn).await.is_ok()
    }
}

pub struct RedisStore {
    pool: Arc<Pool<RedisConnector>>,
    /// Optional key prefix for namespacing (e.g., "qa:" → "qa:q:abc")
    prefix: String,
}

impl RedisStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use doc_cache::storage::redis::RedisStore;
    /// # use doc_cache::config::PoolConfig;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Keys will be prefixed: "qa:q:abc", "qa:emb:xyz"
    /// let store = RedisStore::connect("redis://localhost", "qa:", PoolConfig::default()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(
        connection_string: &str,
        prefix: &str,
        pool_config: PoolConfig,
    ) -> Result<Self, StorageError> {
        let connector = RedisConnector::new(connection_string)?;
        let store = Self {
            pool: Pool::new(REDIS_POOL_NAME, connector, pool_config),
            prefix: prefix.to_string(),
        };

        retry("redis_connect", &RetryConfig::startup(), || store.ping()).await?;
        Ok(store)
    }

    /// The store's connection pool (for registration with the pool manager).
    #[must_use]
    pub fn pool(&self) -> Arc<Pool<RedisConnector>> {
        self.pool.clone()
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    async fn conn(&self) -> Result<PoolHandle<RedisConnector>, StorageError> {
        self.pool.acquire().await.map_err(StorageError::unavailable)
    }

    fn encode(entry: &CacheEntry) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StorageError::serialization(&entry.key, e))
    }

    /// Write the bumped bookkeeping back unless the key changed since `read`.
    /// Failure only loses the count, never the hit.
    async fn persist_hit(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
        read: &[u8],
        entry: &CacheEntry,
        now: u64,
    ) {
        let remaining = entry.remaining_ttl(now).as_millis() as u64;
        if remaining == 0 {
            return;
        }
        let data = match Self::encode(entry) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Hit count not persisted");
                return;
            }
        };
        let outcome = Script::new(RECORD_HIT_LUA)
            .key(self.prefixed_key(key))
            .arg(read)
            .arg(data)
            .arg(remaining)
            .invoke_async::<()>(conn)
            .await;
        if let Err(e) = outcome {
            debug!(key = %key, error = %e, "Hit count not persisted");
        }
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<CacheEntry, StorageError> {
        let (entry, _): (CacheEntry, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StorageError::serialization(key, e))?;
        if entry.key != key {
            return Err(StorageError::serialization(
                key,
                format!("envelope holds key '{}'", entry.key),
            ));
        }
        Ok(entry)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let mut conn = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut conn;

        let data: Option<Vec<u8>> = conn
            .get(self.prefixed_key(key))
            .await
            .map_err(StorageError::unavailable)?;

        let Some(bytes) = data else {
            return Ok(None);
        };
        let mut entry = Self::decode(key, &bytes)?;

        // PX expiry and our clock can disagree by a few millis
        let now = now_millis();
        if entry.is_expired_at(now) {
            return Ok(None);
        }
        entry.record_hit(now);
        self.persist_hit(conn, key, &bytes, &entry, now).await;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let remaining = entry.remaining_ttl(now_millis()).as_millis() as u64;
        if remaining == 0 {
            return Ok(());
        }
        let data = Self::encode(entry)?;

        let mut conn = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut conn;
        cmd("SET")
            .arg(self.prefixed_key(&entry.key))
            .arg(data)
            .arg("PX")
            .arg(remaining)
            .query_async::<()>(conn)
            .await
            .map_err(StorageError::unavailable)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut conn;
        conn.del::<_, ()>(self.prefixed_key(key))
            .await
            .map_err(StorageError::unavailable)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        let mut conn = self.conn().await?;
        let conn: &mut MultiplexedConnection = &mut conn;

        if let Some(key) = pattern.literal() {
            return conn
                .del::<_, u64>(self.prefixed_key(key))
                .await
                .map_err(StorageError::unavailable);
        }

        let glob = pattern.to_redis_match(&self.prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&glob)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(StorageError::unavailable)?;

            if !keys.is_empty() {
                removed += conn
                    .del::<_, u64>(keys)
                    .await
                    .map_err(StorageError::unavailable)?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "Redis invalidation complete");
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map(|_| ())
            .map_err(StorageError::unavailable)
    }
}
