// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use crate::cache_entry::CacheEntry;
use crate::pattern::KeyPattern;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Timeout, refused connection, open circuit. The coordinator falls
    /// through to the next tier.
    #[error("tier unavailable: {reason}")]
    Unavailable { reason: String },
    /// Stored bytes could not be decoded. The entry is evicted and the
    /// lookup treated as a miss.
    #[error("corrupt entry '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

impl StorageError {
    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::Unavailable { reason: reason.to_string() }
    }

    pub fn serialization(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::Serialization {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Contract shared by the L2 and L3 backing stores.
///
/// Stores never return an entry whose TTL has elapsed, swept or not.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry, counting the hit where the backend can do so
    /// cheaply.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Insert or overwrite. The entry's `created_at` and `ttl_ms` are kept
    /// as given.
    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError>;

    /// Remove one key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key matching `pattern`, returning how many went.
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError>;

    /// Drop rows whose TTL elapsed. Backends with native expiry keep the default.
    async fn purge_expired(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;
}
