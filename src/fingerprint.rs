// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Normalized cache keys.
//!
//! A key is `"{namespace}:{hex(sha256(parts))}"`. The namespace stays
//! readable so whole families can be invalidated with `"{namespace}:*"`.
//! Each part is hashed with a length prefix, so `["ab", "c"]` and
//! `["a", "bc"]` produce different keys.

use sha2::{Digest, Sha256};

/// Build a cache key from a namespace and the inputs that determine the artifact.
///
/// ```
/// use doc_cache::fingerprint::fingerprint;
///
/// let key = fingerprint("q", ["what is a cache?", "doc-42", "chunk=512"]);
/// assert!(key.starts_with("q:"));
/// assert_eq!(key.len(), 2 + 64);
/// ```
pub fn fingerprint<I, P>(namespace: &str, parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{}:{}", namespace, hex::encode(hasher.finalize()))
}
