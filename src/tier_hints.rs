// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier hints for caller-controlled write routing.
//!
//! The coordinator writes through to every tier whose policy accepts an
//! entry. Hints let the caller narrow that set, e.g. large artifacts that
//! should not occupy L1.
//!
//! # Example
//!
//! ```rust
//! use doc_cache::{TierHints, TierId};
//!
//! // Default: all three tiers
//! let all = TierHints::default();
//! assert!(all.includes(TierId::L1));
//!
//! // Large artifact: skip the in-process tier
//! let large = TierHints::skip_memory();
//! assert!(!large.includes(TierId::L1));
//! assert!(large.includes(TierId::L3));
//! ```

use crate::cache_entry::TierId;

/// Which tiers a `put` may write to.
///
/// L1 is only ever written when at least one lower tier accepts the same
/// write, so a hint set that names L1 alone stores nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierHints {
    /// Store in the in-process LRU tier.
    ///
    /// Default: `true`
    pub l1: bool,

    /// Store in the shared tier (Redis).
    ///
    /// Default: `true`
    pub l2: bool,

    /// Store in the durable tier (SQL).
    ///
    /// Default: `true`
    pub l3: bool,
}

impl Default for TierHints {
    fn default() -> Self {
        Self::all()
    }
}

impl TierHints {
    /// Write through to every tier.
    #[must_use]
    pub fn all() -> Self {
        Self { l1: true, l2: true, l3: true }
    }

    /// Shared + durable only. Use for large artifacts.
    #[must_use]
    pub fn skip_memory() -> Self {
        Self { l1: false, l2: true, l3: true }
    }

    /// Hot, short-lived artifacts not worth persisting.
    ///
    /// - L1: yes
    /// - L2: yes
    /// - L3: no
    #[must_use]
    pub fn ephemeral() -> Self {
        Self { l1: true, l2: true, l3: false }
    }

    /// Rare but expensive artifacts: durable tier only.
    #[must_use]
    pub fn durable_only() -> Self {
        Self { l1: false, l2: false, l3: true }
    }

    #[must_use]
    pub fn includes(&self, tier: TierId) -> bool {
        match tier {
            TierId::L1 => self.l1,
            TierId::L2 => self.l2,
            TierId::L3 => self.l3,
        }
    }

    /// Returns true if a tier below L1 is targeted.
    #[must_use]
    pub fn has_lower_tier(&self) -> bool {
        self.l2 || self.l3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_all() {
        assert_eq!(TierHints::default(), TierHints::all());
        for tier in TierId::ALL {
            assert!(TierHints::default().includes(tier));
        }
    }

    #[test]
    fn test_presets() {
        assert!(!TierHints::skip_memory().l1);
        assert!(!TierHints::ephemeral().l3);
        let durable = TierHints::durable_only();
        assert!(durable.l3 && !durable.l2 && !durable.l1);
    }

    #[test]
    fn test_has_lower_tier() {
        assert!(TierHints::all().has_lower_tier());
        assert!(TierHints::durable_only().has_lower_tier());
        let memory_only = TierHints { l1: true, l2: false, l3: false };
        assert!(!memory_only.has_lower_tier());
    }
}
