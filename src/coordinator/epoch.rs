// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation epoch.
//!
//! Lookups and writes never wait on an invalidation. Instead they note the
//! epoch before touching a remote tier, and only copy what they read into
//! a faster tier if no invalidation started or ran in the meantime.
//!
//! ```text
//!   begin():  epoch += 1, running += 1, clear L1   (one critical section)
//!   ...remote tiers cleared or marked dirty...
//!   drop:     epoch += 1, running -= 1
//! ```
//!
//! A fill that checks in after `begin()` sees a changed epoch (or a running
//! invalidation) and is skipped, so nothing read before the invalidation
//! can land in L1 once it has cleared.

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct State {
    epoch: u64,
    running: usize,
}

#[derive(Debug, Default)]
pub(crate) struct InvalidationEpoch {
    state: RwLock<State>,
}

impl InvalidationEpoch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current(&self) -> u64 {
        self.state.read().epoch
    }

    /// `seen` is still current and no invalidation is running.
    pub(crate) fn is_current(&self, seen: u64) -> bool {
        let state = self.state.read();
        state.epoch == seen && state.running == 0
    }

    /// Run `fill` only if `seen` is still current. `fill` runs inside the
    /// read section, so an invalidation cannot begin halfway through it.
    /// Keep it synchronous and short.
    pub(crate) fn fill_if_current<R>(&self, seen: u64, fill: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.read();
        (state.epoch == seen && state.running == 0).then(fill)
    }

    /// Start an invalidation, running `clear` in the same critical section
    /// that bumps the epoch. The invalidation ends when the guard drops.
    pub(crate) fn begin<R>(&self, clear: impl FnOnce() -> R) -> (EpochGuard<'_>, R) {
        let mut state = self.state.write();
        state.epoch += 1;
        state.running += 1;
        let cleared = clear();
        (EpochGuard { owner: self }, cleared)
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.state.read().running
    }
}

/// Ends the invalidation on drop, including when the future is cancelled.
pub(crate) struct EpochGuard<'a> {
    owner: &'a InvalidationEpoch,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.owner.state.write();
        state.epoch += 1;
        state.running = state.running.saturating_sub(1);
    }
}
