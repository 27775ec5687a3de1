// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier storage: the in-process LRU (L1) and the remote stores behind
//! [`traits::CacheStore`] (Redis for L2, SQL for L3, memory for tests).

pub mod lru_tier;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
