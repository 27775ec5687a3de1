// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;
use std::fmt;

/// The tunable a recommendation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    ChunkSize,
    RetrievalCount,
    L1Capacity,
}

impl Parameter {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChunkSize => "chunk_size",
            Self::RetrievalCount => "retrieval_count",
            Self::L1Capacity => "l1_capacity",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory configuration change. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecommendation {
    /// What was measured: an operation type name, or `"cache"` for hit rate
    pub scope: String,
    pub parameter: Parameter,
    pub current_value: u64,
    pub suggested_value: u64,
    pub justification: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Epoch millis
    pub emitted_at: u64,
    /// Identical recommendations are suppressed until this instant, epoch millis
    pub cooldown_until: u64,
}

impl OptimizationRecommendation {
    /// Whether the cooldown is still running at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: u64) -> bool {
        now < self.cooldown_until
    }
}

/// Confidence grows with how far the observed value misses its target.
///
/// `overshoot` is `observed / target` for latency (>1 when breaching) or
/// `target / observed` for hit rate. A marginal breach scores 0.5.
pub(crate) fn confidence(overshoot: f64) -> f64 {
    if overshoot.is_nan() || overshoot <= 1.0 {
        return 0.5;
    }
    (0.5 + 0.5 * (1.0 - 1.0 / overshoot)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(confidence(1.0), 0.5);
        assert_eq!(confidence(f64::NAN), 0.5);
        assert_eq!(confidence(f64::INFINITY), 1.0);
        assert!((confidence(2.0) - 0.75).abs() < 1e-9);
        assert!(confidence(1_000.0) < 1.0);
        assert!(confidence(1.8) > confidence(1.2));
    }

    #[test]
    fn test_active_window() {
        let rec = OptimizationRecommendation {
            scope: "llm_call".into(),
            parameter: Parameter::RetrievalCount,
            current_value: 10,
            suggested_value: 6,
            justification: String::new(),
            confidence: 0.7,
            emitted_at: 1_000,
            cooldown_until: 2_000,
        };
        assert!(rec.is_active_at(1_999));
        assert!(!rec.is_active_at(2_000));
    }
}
