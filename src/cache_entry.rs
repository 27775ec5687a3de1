// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entry data structure.
//!
//! A [`CacheEntry`] is the unit every tier stores. Entries are owned by the
//! tier holding them; promotion between tiers always copies.
//!
//! # Example
//!
//! ```
//! use doc_cache::{CacheEntry, TierId};
//! use std::time::Duration;
//!
//! let entry = CacheEntry::new("q:abc", b"answer".to_vec(), TierId::L1, Duration::from_secs(60));
//!
//! assert_eq!(entry.key, "q:abc");
//! assert_eq!(entry.hit_count, 0);
//! assert_eq!(entry.ttl_seconds(), 60);
//! assert!(!entry.is_expired_at(entry.created_at));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Approximate per-entry bookkeeping overhead counted against byte budgets.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Current wall-clock time in epoch millis.
///
/// Wall-clock (not monotonic) so durable entries keep their TTL semantics
/// across process restarts.
#[inline]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity of a cache tier.
///
/// Ordered fastest-first: `L1 < L2 < L3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TierId {
    /// In-process, strict LRU
    L1,
    /// Shared / networked (Redis)
    L2,
    /// Durable (SQLite / MySQL)
    L3,
}

impl TierId {
    pub const ALL: [TierId; 3] = [TierId::L1, TierId::L2, TierId::L3];

    /// Metric/log label for this tier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        }
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            Self::L1 => 0,
            Self::L2 => 1,
            Self::L3 => 2,
        }
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached artifact plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Opaque fingerprint of query + context + active parameters
    pub key: String,
    /// Serialized artifact bytes (embedding, search results, completion)
    pub value: Vec<u8>,
    /// Tier this copy was written to or promoted from
    pub origin: TierId,
    /// Write (or promotion) time, epoch millis
    pub created_at: u64,
    /// Last hit, epoch millis
    pub last_accessed_at: u64,
    /// Time-to-live in millis, counted from `created_at`
    pub ttl_ms: u64,
    /// Approximate footprint used for byte budgets
    pub size_bytes: usize,
    /// Number of `get` hits served from this copy
    pub hit_count: u64,
}

impl CacheEntry {
    /// Create a fresh entry written now.
    pub fn new(key: impl Into<String>, value: Vec<u8>, origin: TierId, ttl: Duration) -> Self {
        Self::new_at(key, value, origin, ttl, now_millis())
    }

    /// Create an entry with an explicit write timestamp.
    pub fn new_at(
        key: impl Into<String>,
        value: Vec<u8>,
        origin: TierId,
        ttl: Duration,
        created_at: u64,
    ) -> Self {
        let key = key.into();
        let size_bytes = Self::estimate_size(&key, &value);
        Self {
            key,
            value,
            origin,
            created_at,
            last_accessed_at: created_at,
            ttl_ms: ttl.as_millis() as u64,
            size_bytes,
            hit_count: 0,
        }
    }

    #[inline]
    fn estimate_size(key: &str, value: &[u8]) -> usize {
        key.len() + value.len() + ENTRY_OVERHEAD_BYTES
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_ms / 1000
    }

    /// Absolute expiry time, epoch millis.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl_ms)
    }

    /// An entry is logically gone once `now >= expires_at`, swept or not.
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Lifetime left at `now` (zero when expired).
    #[must_use]
    pub fn remaining_ttl(&self, now: u64) -> Duration {
        Duration::from_millis(self.expires_at().saturating_sub(now))
    }

    /// Count a hit served from this copy.
    pub fn record_hit(&mut self, now: u64) {
        self.hit_count = self.hit_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// Copy this entry for a faster tier.
    ///
    /// The copy never outlives the source: its TTL is the source's remaining
    /// lifetime, capped at the receiving tier's TTL cap.
    #[must_use]
    pub fn promoted_copy(&self, source: TierId, ttl_cap: Duration, now: u64) -> Self {
        let ttl = self.remaining_ttl(now).min(ttl_cap);
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            origin: source,
            created_at: now,
            last_accessed_at: now,
            ttl_ms: ttl.as_millis() as u64,
            size_bytes: self.size_bytes,
            hit_count: self.hit_count,
        }
    }
}
