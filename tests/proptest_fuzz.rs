//! Property-based tests (fuzzing) for key patterns, the L1 tier and
//! fingerprints.
//!
//! Uses proptest to generate random/malformed inputs and verify the cache
//! never panics and keeps its bounds.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

use doc_cache::storage::lru_tier::{LruTier, Probe};
use doc_cache::{fingerprint, CacheEntry, KeyPattern, TierId};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Keys shaped like real cache keys: "q:doc42:chunk-7"
fn cache_key_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,4}(:[a-zA-Z0-9_%\\-\\[\\]]{1,8}){0,4}"
}

/// Arbitrary strings, including wildcard and escape characters
fn hostile_string_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just('*'),
            Just('?'),
            Just('\\'),
            Just('%'),
            Just('_'),
            Just('!'),
            Just('['),
            any::<char>(),
        ],
        0..32,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

fn entry(key: &str, value_len: usize) -> CacheEntry {
    CacheEntry::new_at(key, vec![0u8; value_len], TierId::L1, Duration::from_secs(60), 1_000)
}

// =============================================================================
// Key Patterns
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn fuzz_pattern_parse_never_panics(source in hostile_string_strategy(), key in ".*") {
        if let Ok(pattern) = KeyPattern::parse(&source) {
            let _ = pattern.matches(&key);
            let _ = pattern.to_sql_like();
            let _ = pattern.literal();
        }
    }

    #[test]
    fn prop_exact_matches_only_itself(key in hostile_string_strategy(), other in hostile_string_strategy()) {
        let pattern = KeyPattern::exact(&key).unwrap();
        prop_assert!(pattern.matches(&key));
        prop_assert_eq!(pattern.matches(&other), key == other);
        prop_assert_eq!(pattern.literal(), Some(key.as_str()));
    }

    #[test]
    fn prop_prefix_pattern_matches_extensions(prefix in cache_key_strategy(), suffix in ".*") {
        let pattern = KeyPattern::parse(&format!("{}*", KeyPattern::escape(&prefix))).unwrap();
        let extended = format!("{}{}", prefix, suffix);
        prop_assert!(pattern.matches(&extended));
        prop_assert!(pattern.matches(&prefix));
    }

    #[test]
    fn prop_single_wildcard_is_one_char(key in cache_key_strategy(), c in any::<char>()) {
        let pattern = KeyPattern::parse(&format!("{}?", KeyPattern::escape(&key))).unwrap();
        let one_more = format!("{}{}", key, c);
        let two_more = format!("{}{}{}", key, c, c);
        prop_assert!(pattern.matches(&one_more));
        prop_assert!(!pattern.matches(&key));
        prop_assert!(!pattern.matches(&two_more));
    }
}

// =============================================================================
// L1 Tier Bounds
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_lru_never_exceeds_bounds(
        ops in prop::collection::vec((cache_key_strategy(), 0usize..2048), 1..200),
        max_entries in 1usize..64,
        shards in 1usize..8,
    ) {
        let max_bytes = 16 * 1024;
        let tier = LruTier::new(max_entries, max_bytes, shards, 4096);
        for (key, len) in &ops {
            tier.insert(entry(key, *len));
            prop_assert!(tier.len() <= max_entries);
            prop_assert!(tier.size_bytes() <= max_bytes);
        }
    }

    #[test]
    fn prop_lru_keeps_most_recent(
        keys in prop::collection::hash_set(cache_key_strategy(), 2..40),
        capacity in 1usize..10,
        shards in 1usize..=16,
    ) {
        let keys: Vec<String> = keys.into_iter().collect();
        let tier = LruTier::new(capacity, usize::MAX, shards, usize::MAX);
        for key in &keys {
            tier.insert(entry(key, 1));
        }

        let kept: HashSet<&String> = keys.iter().rev().take(capacity).collect();
        for key in &keys {
            let present = matches!(tier.get(key, 2_000), Probe::Hit(_));
            prop_assert_eq!(present, kept.contains(key));
        }
    }

    #[test]
    fn prop_remove_matching_removes_exactly_matches(
        keys in prop::collection::hash_set(cache_key_strategy(), 1..50),
        prefix in "[a-z]{1,2}",
    ) {
        let tier = LruTier::new(1024, usize::MAX, 4, usize::MAX);
        for key in &keys {
            tier.insert(entry(key, 4));
        }
        let pattern = KeyPattern::parse(&format!("{}*", prefix)).unwrap();
        let expected = keys.iter().filter(|k| k.starts_with(&prefix)).count();

        prop_assert_eq!(tier.remove_matching(&pattern), expected);
        prop_assert_eq!(tier.len(), keys.len() - expected);
        for key in &keys {
            prop_assert_eq!(tier.peek(key).is_some(), !key.starts_with(&prefix));
        }
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

proptest! {
    #[test]
    fn prop_fingerprint_deterministic(ns in "[a-z]{1,6}", parts in prop::collection::vec(".*", 0..6)) {
        let a = fingerprint(&ns, &parts);
        let b = fingerprint(&ns, &parts);
        prop_assert_eq!(&a, &b);
        let expected_prefix = format!("{}:", ns);
        prop_assert!(a.starts_with(&expected_prefix));
        prop_assert_eq!(a.len(), ns.len() + 1 + 64);
    }

    #[test]
    fn prop_fingerprint_part_boundaries_matter(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
        let joined = format!("{}{}", a, b);
        prop_assert_ne!(fingerprint("q", [a.as_str(), b.as_str()]), fingerprint("q", [joined.as_str()]));
    }
}
