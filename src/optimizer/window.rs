// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tumbling sample windows.
//!
//! A window closes after exactly `window_size` samples and is replaced by
//! an empty one; samples never count toward two windows.

use serde::Serialize;
use std::time::Duration;
use super::{OperationType, PerformanceSample, SampleParams};

/// Statistics for one closed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStats {
    pub operation: OperationType,
    pub samples: usize,
    pub p50: Duration,
    pub p95: Duration,
    pub mean: Duration,
    /// Samples per second over the window span
    pub throughput: f64,
    /// Timestamp of the first sample, epoch millis
    pub started_at: u64,
    /// Timestamp of the last sample, epoch millis
    pub ended_at: u64,
    /// Parameters in effect for the most recent sample
    pub params: SampleParams,
}

/// Nearest-rank percentile over sorted latencies. `sorted` must be non-empty.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug)]
pub(crate) struct SampleWindow {
    operation: OperationType,
    samples: Vec<PerformanceSample>,
}

impl SampleWindow {
    pub(crate) fn new(operation: OperationType, capacity: usize) -> Self {
        Self {
            operation,
            samples: Vec::with_capacity(capacity),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    /// Add a sample; returns the window's stats when it fills.
    pub(crate) fn push(&mut self, sample: PerformanceSample, window_size: usize) -> Option<WindowStats> {
        self.samples.push(sample);
        if self.samples.len() < window_size.max(1) {
            return None;
        }
        let closed = std::mem::replace(&mut self.samples, Vec::with_capacity(window_size));
        Some(Self::summarize(self.operation, &closed))
    }

    fn summarize(operation: OperationType, samples: &[PerformanceSample]) -> WindowStats {
        let mut latencies: Vec<Duration> = samples.iter().map(|s| s.latency).collect();
        latencies.sort();

        let total: Duration = latencies.iter().sum();
        let mean = total / latencies.len().max(1) as u32;

        let started_at = samples.iter().map(|s| s.timestamp).min().unwrap_or(0);
        let ended_at = samples.iter().map(|s| s.timestamp).max().unwrap_or(0);
        // Samples stamped in the same millisecond still span one
        let span_secs = (ended_at.saturating_sub(started_at)).max(1) as f64 / 1000.0;

        WindowStats {
            operation,
            samples: samples.len(),
            p50: percentile(&latencies, 0.50),
            p95: percentile(&latencies, 0.95),
            mean,
            throughput: samples.len() as f64 / span_secs,
            started_at,
            ended_at,
            params: samples.last().map(|s| s.params).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64, at: u64) -> PerformanceSample {
        PerformanceSample {
            operation: OperationType::VectorSearch,
            latency: Duration::from_millis(ms),
            timestamp: at,
            params: SampleParams::default(),
        }
    }

    #[test]
    fn test_window_closes_at_size() {
        let mut w = SampleWindow::new(OperationType::VectorSearch, 3);
        assert!(w.push(sample(10, 0), 3).is_none());
        assert!(w.push(sample(20, 1), 3).is_none());
        let stats = w.push(sample(30, 2), 3).unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let mut w = SampleWindow::new(OperationType::Embedding, 20);
        let mut stats = None;
        for i in 1..=20 {
            stats = w.push(sample(i * 10, i), 20);
        }
        let stats = stats.unwrap();
        assert_eq!(stats.p50, Duration::from_millis(100));
        assert_eq!(stats.p95, Duration::from_millis(190));
        assert_eq!(stats.mean, Duration::from_millis(105));
    }

    #[test]
    fn test_throughput_over_span() {
        let mut w = SampleWindow::new(OperationType::LlmCall, 5);
        let mut stats = None;
        for i in 0..5 {
            stats = w.push(sample(1, 1_000 + i * 500), 5);
        }
        let stats = stats.unwrap();
        // 5 samples over 2 seconds
        assert!((stats.throughput - 2.5).abs() < 1e-9);
        assert_eq!(stats.started_at, 1_000);
        assert_eq!(stats.ended_at, 3_000);
    }

    #[test]
    fn test_single_sample_window() {
        let mut w = SampleWindow::new(OperationType::LlmCall, 1);
        let stats = w.push(sample(42, 7), 1).unwrap();
        assert_eq!(stats.p50, Duration::from_millis(42));
        assert_eq!(stats.p95, Duration::from_millis(42));
        assert!((stats.throughput - 1000.0).abs() < 1e-9);
    }
}
