// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: in-process, sharded, strict LRU.
//!
//! Each shard is an [`LruCache`] behind a `parking_lot::Mutex`. Sharding
//! only spreads lock contention: the entry and byte budgets are global,
//! and recency is global too. Every entry carries a stamp from one shared
//! clock, taken under its shard lock on insert and on every hit, so each
//! shard's LRU tail is its oldest stamp and the tier-wide LRU entry is the
//! oldest of the shard tails. An overflowing insert evicts that entry,
//! whichever shard holds it.
//!
//! Size accounting is updated under the shard lock on every path that
//! removes an entry (eviction, sweep, invalidation, expired-on-read), so
//! `len()`/`size_bytes()` are exact whenever no insert is in flight.

use crate::cache_entry::CacheEntry;
use crate::pattern::KeyPattern;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Rescans allowed when a shard tail moves under a concurrent eviction.
const EVICT_ATTEMPTS: usize = 4;

/// Outcome of an L1 lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Live entry; the returned copy already carries the new hit.
    Hit(CacheEntry),
    /// Entry was present but its TTL elapsed; it has been removed.
    Expired,
    Miss,
}

/// Outcome of an L1 insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// LRU evictions performed to make room
    pub evicted: usize,
    /// Entry not admitted (too large, or tier has zero capacity)
    pub rejected: bool,
}

struct Slot {
    /// Last insert or hit on the tier-wide clock
    stamp: u64,
    entry: CacheEntry,
}

type Shard = LruCache<String, Slot>;

/// The L1 tier.
pub struct LruTier {
    shards: Box<[Mutex<Shard>]>,
    hasher: RandomState,
    clock: AtomicU64,
    max_entries: usize,
    max_bytes: usize,
    max_entry_bytes: usize,
    len: AtomicUsize,
    bytes: AtomicUsize,
}

impl LruTier {
    /// Build a tier holding at most `max_entries` entries in total, spread
    /// over at most `shards` shards.
    ///
    /// `max_bytes = 0` disables the byte budget. `max_entries = 0` makes
    /// every insert a rejection.
    pub fn new(max_entries: usize, max_bytes: usize, shards: usize, max_entry_bytes: usize) -> Self {
        let count = shards.max(1).min(max_entries.max(1));
        let shards: Vec<Mutex<Shard>> = (0..count).map(|_| Mutex::new(LruCache::unbounded())).collect();

        Self {
            shards: shards.into_boxed_slice(),
            hasher: RandomState::new(),
            clock: AtomicU64::new(0),
            max_entries,
            max_bytes,
            max_entry_bytes,
            len: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Call with the shard lock held so stamps stay ordered within a shard.
    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `key`, moving a live entry to most-recently-used.
    pub fn get(&self, key: &str, now: u64) -> Probe {
        let mut shard = self.shard(key).lock();

        match shard.get_mut(key) {
            None => return Probe::Miss,
            Some(slot) if !slot.entry.is_expired_at(now) => {
                slot.stamp = self.tick();
                slot.entry.record_hit(now);
                return Probe::Hit(slot.entry.clone());
            }
            Some(_) => {}
        }

        if let Some(gone) = shard.pop(key) {
            self.account_removed(gone.entry.size_bytes);
        }
        Probe::Expired
    }

    fn over_budget(&self) -> bool {
        self.len.load(Ordering::Relaxed) > self.max_entries
            || (self.max_bytes > 0 && self.bytes.load(Ordering::Relaxed) > self.max_bytes)
    }

    /// Insert or replace, evicting tier-wide least-recently-used entries
    /// until both budgets hold again.
    pub fn insert(&self, entry: CacheEntry) -> InsertOutcome {
        let size = entry.size_bytes;
        if self.max_entries == 0
            || size > self.max_entry_bytes
            || (self.max_bytes > 0 && size > self.max_bytes)
        {
            return InsertOutcome { evicted: 0, rejected: true };
        }

        {
            let mut shard = self.shard(&entry.key).lock();
            // Replacing a key never counts as an eviction
            if let Some(old) = shard.pop(&entry.key) {
                self.account_removed(old.entry.size_bytes);
            }
            let stamp = self.tick();
            shard.push(entry.key.clone(), Slot { stamp, entry });
            self.len.fetch_add(1, Ordering::Relaxed);
            self.bytes.fetch_add(size, Ordering::Relaxed);
        }

        let mut evicted = 0;
        while self.over_budget() && self.evict_stalest() {
            evicted += 1;
        }
        InsertOutcome { evicted, rejected: false }
    }

    /// Evict the entry with the oldest stamp across all shards. Holds one
    /// shard lock at a time.
    fn evict_stalest(&self) -> bool {
        for _ in 0..EVICT_ATTEMPTS {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(idx, shard)| shard.lock().peek_lru().map(|(_, slot)| (idx, slot.stamp)))
                .min_by_key(|(_, stamp)| *stamp);
            let Some((idx, stamp)) = oldest else {
                return false;
            };

            let mut shard = self.shards[idx].lock();
            if shard.peek_lru().is_some_and(|(_, slot)| slot.stamp == stamp) {
                if let Some((_, gone)) = shard.pop_lru() {
                    self.account_removed(gone.entry.size_bytes);
                    return true;
                }
            }
        }
        false
    }

    /// Remove one key. Returns true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut shard = self.shard(key).lock();
        match shard.pop(key) {
            Some(gone) => {
                self.account_removed(gone.entry.size_bytes);
                true
            }
            None => false,
        }
    }

    /// Remove every key matching `pattern`.
    pub fn remove_matching(&self, pattern: &KeyPattern) -> usize {
        if let Some(key) = pattern.literal() {
            return usize::from(self.remove(key));
        }
        self.remove_where(|key, _| pattern.matches(key))
    }

    /// Remove every entry whose TTL elapsed at `now`, regardless of recency.
    pub fn sweep_expired(&self, now: u64) -> usize {
        self.remove_where(|_, entry| entry.is_expired_at(now))
    }

    fn remove_where(&self, doomed: impl Fn(&str, &CacheEntry) -> bool) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let keys: Vec<String> = shard
                .iter()
                .filter(|(k, slot)| doomed(k.as_str(), &slot.entry))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Some(gone) = shard.pop(&key) {
                    self.account_removed(gone.entry.size_bytes);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Read without touching recency or hit counts.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.shard(key).lock().peek(key).map(|slot| slot.entry.clone())
    }

    #[inline]
    fn account_removed(&self, bytes: usize) {
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[must_use]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
