// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use crate::cache_entry::{now_millis, CacheEntry};
use crate::pattern::KeyPattern;
use super::traits::{CacheStore, StorageError};

/// A `CacheStore` backed by a `DashMap`.
///
/// Stands in for L2/L3 in tests and single-process deployments. Honors
/// TTLs on read and on `purge_expired`.
pub struct InMemoryStore {
    data: DashMap<String, CacheEntry>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current entry count (expired-but-unpurged included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw read: no TTL check, no hit.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.data.get(key).map(|r| r.value().clone())
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let now = now_millis();
        if let Some(mut entry) = self.data.get_mut(key) {
            if !entry.is_expired_at(now) {
                entry.record_hit(now);
                return Ok(Some(entry.clone()));
            }
        }
        self.data.remove_if(key, |_, e| e.is_expired_at(now));
        Ok(None)
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.data.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, StorageError> {
        if let Some(key) = pattern.literal() {
            return Ok(u64::from(self.data.remove(key).is_some()));
        }
        let mut removed = 0;
        self.data.retain(|k, _| {
            let doomed = pattern.matches(k);
            removed += u64::from(doomed);
            !doomed
        });
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<u64, StorageError> {
        let now = now_millis();
        let mut purged = 0;
        self.data.retain(|_, e| {
            let expired = e.is_expired_at(now);
            purged += u64::from(expired);
            !expired
        });
        Ok(purged)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_entry::TierId;
    use std::time::Duration;

    fn test_entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, format!("value-{}", key).into_bytes(), TierId::L2, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_put_and_get_counts_hits() {
        let store = InMemoryStore::new();
        store.put(&test_entry("q:1")).await.unwrap();

        let first = store.get("q:1").await.unwrap().unwrap();
        assert_eq!(first.value, b"value-q:1");
        assert_eq!(first.hit_count, 1);
        let second = store.get("q:1").await.unwrap().unwrap();
        assert_eq!(second.hit_count, 2);
    }

    #[tokio::test]
    async fn test_get_nonexistent_returns_none() {
        let store = InMemoryStore::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_not_returned() {
        let store = InMemoryStore::new();
        let stale = CacheEntry::new_at("old", vec![1], TierId::L2, Duration::from_millis(1), 0);
        store.put(&stale).await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemoryStore::new();
        assert!(store.delete("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_matching() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.put(&test_entry(&format!("q:doc1:{}", i))).await.unwrap();
            store.put(&test_entry(&format!("emb:doc1:{}", i))).await.unwrap();
        }

        let pattern = KeyPattern::parse("q:*").unwrap();
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 5);
        assert_eq!(store.len(), 5);
        assert_eq!(store.delete_matching(&pattern).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryStore::new();
        store.put(&CacheEntry::new_at("a", vec![], TierId::L3, Duration::from_millis(1), 0)).await.unwrap();
        store.put(&test_entry("b")).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.peek("a").is_none());
        assert!(store.peek("b").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    let entry = test_entry(&format!("batch-{}-item-{}", batch, i));
                    store_clone.put(&entry).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
