//! Latency percentile calculation.
//!
//! Two flavors live here:
//! - [`LatencyStats::from_latencies`] computes exact nearest-rank percentiles
//!   over a finished level. It sorts its input first, so the result does not
//!   depend on the order outcomes arrived in.
//! - [`PercentileTracker`] wraps an HdrHistogram for cheap running
//!   percentiles while a stress run is still in progress.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::warn;

use crate::utils::duration_ms;

/// Nearest-rank percentile of an ascending-sorted slice.
///
/// rank = ceil(p / 100 * n), clamped to `[1, n]`. Returns 0.0 for an empty
/// slice.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = ((percentile / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// Exact latency summary for one level, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    /// Summarize a set of latencies. Empty input yields all zeros.
    pub fn from_latencies(latencies: &[Duration]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = latencies.iter().map(|d| duration_ms(*d)).collect();
        sorted.sort_by(f64::total_cmp);

        // Summing in sorted order keeps the mean bit-identical across arrival orders.
        let sum: f64 = sorted.iter().sum();
        let min_ms = sorted[0];
        let max_ms = sorted[sorted.len() - 1];

        Self {
            // Rounding in the sum must not push the mean outside [min, max].
            mean_ms: (sum / sorted.len() as f64).clamp(min_ms, max_ms),
            min_ms,
            max_ms,
            p50_ms: nearest_rank(&sorted, 50.0),
            p90_ms: nearest_rank(&sorted, 90.0),
            p95_ms: nearest_rank(&sorted, 95.0),
            p99_ms: nearest_rank(&sorted, 99.0),
        }
    }
}

/// Percentile statistics from a [`PercentileTracker`], in microseconds.
#[derive(Debug, Clone)]
pub struct PercentileStats {
    /// Number of samples
    pub count: u64,

    /// Minimum value (microseconds)
    pub min: u64,

    /// Maximum value (microseconds)
    pub max: u64,

    /// Mean/average value (microseconds)
    pub mean: f64,

    /// 50th percentile - median (microseconds)
    pub p50: u64,

    /// 95th percentile (microseconds)
    pub p95: u64,

    /// 99th percentile (microseconds)
    pub p99: u64,
}

impl PercentileStats {
    /// Format statistics as a human-readable string.
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms",
            self.count,
            self.min as f64 / 1000.0,
            self.max as f64 / 1000.0,
            self.mean / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
        )
    }
}

/// Thread-safe running percentile tracker.
///
/// Uses HdrHistogram internally. All latencies are stored in microseconds.
#[derive(Clone)]
pub struct PercentileTracker {
    /// Tracks latencies from 1 microsecond to 10 minutes with 3 significant digits
    histogram: Arc<Mutex<Histogram<u64>>>,
}

const MAX_TRACKABLE_US: u64 = 600_000_000;

impl PercentileTracker {
    pub fn new() -> Self {
        let histogram =
            Histogram::new_with_bounds(1, MAX_TRACKABLE_US, 3).expect("Failed to create histogram");

        Self {
            histogram: Arc::new(Mutex::new(histogram)),
        }
    }

    /// Record a latency measurement.
    pub fn record(&self, latency: Duration) {
        let latency_us = latency.as_micros().min(u128::from(MAX_TRACKABLE_US)) as u64;
        let mut hist = self.histogram.lock().unwrap();

        if let Err(e) = hist.record(latency_us.clamp(1, MAX_TRACKABLE_US)) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    /// Get current percentile statistics.
    ///
    /// Returns None if no samples have been recorded.
    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.lock().unwrap();

        if hist.is_empty() {
            return None;
        }

        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
        })
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|v| Duration::from_millis(*v)).collect()
    }

    #[test]
    fn test_nearest_rank() {
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(nearest_rank(&sorted, 50.0), 5.0);
        assert_eq!(nearest_rank(&sorted, 90.0), 9.0);
        assert_eq!(nearest_rank(&sorted, 95.0), 10.0);
        assert_eq!(nearest_rank(&sorted, 99.0), 10.0);
        assert_eq!(nearest_rank(&sorted, 0.0), 1.0);
        assert_eq!(nearest_rank(&[], 50.0), 0.0);
    }

    #[test]
    fn test_nearest_rank_single_value() {
        assert_eq!(nearest_rank(&[42.0], 1.0), 42.0);
        assert_eq!(nearest_rank(&[42.0], 99.0), 42.0);
    }

    #[test]
    fn test_latency_stats() {
        let stats = LatencyStats::from_latencies(&ms(&[100, 300, 200, 400]));
        assert_eq!(stats.min_ms, 100.0);
        assert_eq!(stats.max_ms, 400.0);
        assert_eq!(stats.mean_ms, 250.0);
        assert_eq!(stats.p50_ms, 200.0);
        assert_eq!(stats.p90_ms, 400.0);
        assert_eq!(stats.p99_ms, 400.0);
    }

    #[test]
    fn test_latency_stats_equal_latencies() {
        for latencies in [
            vec![Duration::from_micros(100); 3],
            vec![Duration::from_micros(333); 7],
            vec![Duration::from_nanos(123_457); 11],
        ] {
            let stats = LatencyStats::from_latencies(&latencies);
            assert!(stats.min_ms <= stats.mean_ms, "{:?}", stats);
            assert!(stats.mean_ms <= stats.max_ms, "{:?}", stats);
            assert_eq!(stats.min_ms, stats.max_ms);
            assert_eq!(stats.mean_ms, stats.max_ms);
        }
    }

    #[test]
    fn test_latency_stats_empty() {
        assert_eq!(LatencyStats::from_latencies(&[]), LatencyStats::default());
    }

    #[test]
    fn test_latency_stats_order_independent() {
        let a = LatencyStats::from_latencies(&ms(&[7, 13, 101, 3, 55, 21]));
        let b = LatencyStats::from_latencies(&ms(&[55, 3, 21, 101, 13, 7]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_tracker_basic() {
        let tracker = PercentileTracker::new();
        assert!(tracker.stats().is_none());

        for v in 1..=100 {
            tracker.record(Duration::from_millis(v));
        }

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 100);
        assert!((49_000..=51_000).contains(&stats.p50), "p50 was {}", stats.p50);
        assert!((98_000..=100_100).contains(&stats.p99), "p99 was {}", stats.p99);
        assert!(stats.format().contains("count=100"));
    }
}
