// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache coordinator.

use serde::Serialize;
use crate::cache_entry::{CacheEntry, TierId};
use crate::pool::PoolStats;
use crate::resilience::circuit_breaker::CircuitState;

/// Engine lifecycle state.
///
/// Use [`super::CacheCoordinator::state()`] to check current state or
/// [`super::CacheCoordinator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to backends (L2/L3)
    Connecting,
    /// Backends connected, serving requests
    Ready,
    /// Serving requests with the maintenance task running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Pools drained, no further work
    Stopped,
}

impl EngineState {
    /// Whether `get`/`put` are expected to be served.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Connecting => "Connecting",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Snapshot copy of the entry and the tier that served it
    Hit { entry: CacheEntry, tier: TierId },
    Miss,
}

impl Lookup {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    #[must_use]
    pub fn tier(&self) -> Option<TierId> {
        match self {
            Self::Hit { tier, .. } => Some(*tier),
            Self::Miss => None,
        }
    }

    #[must_use]
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Self::Hit { entry, .. } => Some(entry),
            Self::Miss => None,
        }
    }

    #[must_use]
    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            Self::Hit { entry, .. } => Some(entry),
            Self::Miss => None,
        }
    }
}

/// Where a `put` landed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutReport {
    /// Tiers that accepted the write
    pub written: Vec<TierId>,
    /// Tiers that were targeted but failed (now dirty)
    pub failed: Vec<TierId>,
    /// Tiers skipped because they are dirty
    pub skipped_dirty: Vec<TierId>,
    /// L1 entries evicted to make room
    pub l1_evicted: usize,
    /// L1 refused the entry (larger than its per-entry or total budget)
    pub l1_rejected: bool,
}

impl PutReport {
    /// At least one tier holds the value.
    #[must_use]
    pub fn is_stored(&self) -> bool {
        !self.written.is_empty()
    }

    #[must_use]
    pub fn wrote(&self, tier: TierId) -> bool {
        self.written.contains(&tier)
    }
}

/// One tier's part of an invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TierInvalidation {
    /// The tier acknowledged; `removed` matching entries deleted
    Cleared { removed: u64 },
    /// No acknowledgement within the retry budget; tier bypassed until resync
    Dirty { reason: String },
    /// Tier not configured
    Absent,
}

/// Result of `invalidate`. Never an error: unacknowledged tiers are
/// reported in `dirty_tiers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub pattern: String,
    /// Indexed by tier: L1, L2, L3
    pub tiers: Vec<(TierId, TierInvalidation)>,
    pub dirty_tiers: Vec<TierId>,
}

impl InvalidationReport {
    /// Entries removed from `tier` (zero if dirty or absent).
    #[must_use]
    pub fn removed(&self, tier: TierId) -> u64 {
        self.tiers
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, outcome)| match outcome {
                TierInvalidation::Cleared { removed } => *removed,
                _ => 0,
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn removed_total(&self) -> u64 {
        TierId::ALL.iter().map(|t| self.removed(*t)).sum()
    }

    /// Every configured tier acknowledged.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dirty_tiers.is_empty()
    }
}

/// Health of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierHealth {
    pub tier: TierId,
    pub configured: bool,
    /// `ping` result; `None` for L1 and unconfigured tiers
    pub reachable: Option<bool>,
    pub dirty: bool,
    /// Patterns waiting to be replayed on resync
    pub pending_invalidations: usize,
    pub circuit: Option<CircuitState>,
    pub ping_ms: Option<u64>,
    pub error: Option<String>,
}

/// Result of [`super::CacheCoordinator::health_check()`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: EngineState,
    /// Serving, and every configured tier reachable and clean
    pub healthy: bool,
    pub tiers: Vec<TierHealth>,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub pools: Vec<PoolStats>,
}

impl HealthReport {
    #[must_use]
    pub fn tier(&self, tier: TierId) -> Option<&TierHealth> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

/// What one maintenance tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub l1_expired: usize,
    pub l3_purged: u64,
    /// Dirty tiers that came back clean
    pub resynced: Vec<TierId>,
    pub config_applied: bool,
}
