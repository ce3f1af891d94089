//! Metrics aggregation.
//!
//! Pure functions from raw outcomes and probe samples to summaries. Every
//! reduction is order-independent: latencies are sorted before they are
//! summed or ranked, and error counts live in ordered maps, so the same set
//! of outcomes always yields a bit-identical [`LevelResult`] no matter in
//! which order the runner collected them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Duration;

use crate::config::AnalysisConfig;
use crate::errors::ErrorKind;
use crate::executor::RequestOutcome;
use crate::percentiles::{nearest_rank, LatencyStats};
use crate::prober::ProbeSample;
use crate::runner::LevelRun;
use crate::utils::duration_ms;

/// Added to the mean latency (in seconds) in the efficiency score so very
/// fast levels do not dominate.
const EFFICIENCY_LATENCY_OFFSET_SECS: f64 = 0.1;

/// A level whose RPS falls below this fraction of the previous level's marks
/// the throughput decline point.
const DECLINE_RATIO: f64 = 0.95;

/// Aggregated statistics for one concurrency level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelResult {
    pub level: u32,

    /// Requests the level was configured to issue
    pub requested: usize,

    /// Outcomes actually recorded (equals `requested` for a complete level)
    pub total_attempted: usize,

    /// Attempts beyond the first, summed over all outcomes
    pub total_retries: u64,

    pub success_count: usize,
    pub failure_count: usize,
    pub errors_by_kind: BTreeMap<ErrorKind, usize>,

    /// Latency of successful requests
    pub latency: LatencyStats,

    pub requests_per_second: f64,
    pub tokens_per_second: f64,
    pub total_tokens: u64,
    pub avg_tokens_per_request: f64,

    /// failure_count / total_attempted
    pub error_rate: f64,
    pub timeout_count: usize,

    /// Wall-clock duration of the level
    pub duration: Duration,

    pub efficiency_score: f64,

    /// False when the level was cut short by cancellation
    pub complete: bool,
}

/// Group failed outcomes by error kind.
pub fn classify_errors(outcomes: &[RequestOutcome]) -> BTreeMap<ErrorKind, usize> {
    let mut counts = BTreeMap::new();
    for kind in outcomes.iter().filter_map(|o| o.error_kind) {
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}

/// Summarize one level.
///
/// # Panics
/// If the run holds more outcomes than it requested, or a run marked
/// complete holds fewer. Both mean the runner broke its contract.
pub fn aggregate_level(run: &LevelRun) -> LevelResult {
    assert!(
        run.outcomes.len() <= run.requested,
        "level {} recorded {} outcomes for {} requests",
        run.level,
        run.outcomes.len(),
        run.requested
    );
    if run.completed {
        assert_eq!(
            run.outcomes.len(),
            run.requested,
            "complete level {} is missing outcomes",
            run.level
        );
    }

    let total_attempted = run.outcomes.len();
    let successes: Vec<&RequestOutcome> = run.outcomes.iter().filter(|o| o.success).collect();
    let success_count = successes.len();
    let failure_count = total_attempted - success_count;

    let errors_by_kind = classify_errors(&run.outcomes);
    let timeout_count = errors_by_kind
        .get(&ErrorKind::Timeout)
        .copied()
        .unwrap_or(0);

    let total_retries: u64 = run
        .outcomes
        .iter()
        .map(|o| u64::from(o.attempt.saturating_sub(1)))
        .sum();

    let latencies: Vec<Duration> = successes.iter().map(|o| o.latency).collect();
    let latency = LatencyStats::from_latencies(&latencies);

    let total_tokens: u64 = successes.iter().filter_map(|o| o.token_count).sum();

    let secs = run.wall_clock.as_secs_f64();
    let per_second = |count: f64| if secs > 0.0 { count / secs } else { 0.0 };
    let requests_per_second = per_second(success_count as f64);
    let tokens_per_second = per_second(total_tokens as f64);

    let avg_tokens_per_request = if success_count > 0 {
        total_tokens as f64 / success_count as f64
    } else {
        0.0
    };
    let error_rate = if total_attempted > 0 {
        failure_count as f64 / total_attempted as f64
    } else {
        0.0
    };
    let efficiency_score =
        requests_per_second / (latency.mean_ms / 1000.0 + EFFICIENCY_LATENCY_OFFSET_SECS);

    LevelResult {
        level: run.level,
        requested: run.requested,
        total_attempted,
        total_retries,
        success_count,
        failure_count,
        errors_by_kind,
        latency,
        requests_per_second,
        tokens_per_second,
        total_tokens,
        avg_tokens_per_request,
        error_rate,
        timeout_count,
        duration: run.wall_clock,
        efficiency_score,
        complete: run.completed,
    }
}

/// The level judged to give the best throughput without disproportionate
/// error growth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalConcurrency {
    pub level: u32,
    pub requests_per_second: f64,
    pub error_rate: f64,

    /// Set when no level met the error-rate threshold
    pub caveat: Option<String>,
}

/// Scan levels in execution order and pick the last one before throughput
/// stops improving by at least `rps_gain_tolerance`, considering only levels
/// whose error rate is below `max_error_rate`.
///
/// If no level meets the error threshold, the level with the lowest error
/// rate is returned with a caveat. Returns None only for an empty slice.
pub fn detect_optimal_concurrency(
    levels: &[LevelResult],
    analysis: &AnalysisConfig,
) -> Option<OptimalConcurrency> {
    let mut best: Option<&LevelResult> = None;

    for level in levels {
        let within_threshold = level.error_rate < analysis.max_error_rate;
        match best {
            None => {
                if within_threshold {
                    best = Some(level);
                }
            }
            Some(current) => {
                if !within_threshold {
                    break;
                }
                let gain = relative_gain(current.requests_per_second, level.requests_per_second);
                if gain < analysis.rps_gain_tolerance {
                    break;
                }
                best = Some(level);
            }
        }
    }

    if let Some(level) = best {
        return Some(OptimalConcurrency {
            level: level.level,
            requests_per_second: level.requests_per_second,
            error_rate: level.error_rate,
            caveat: None,
        });
    }

    let lowest = levels
        .iter()
        .min_by(|a, b| a.error_rate.total_cmp(&b.error_rate))?;
    Some(OptimalConcurrency {
        level: lowest.level,
        requests_per_second: lowest.requests_per_second,
        error_rate: lowest.error_rate,
        caveat: Some(format!(
            "no level kept the error rate below {:.1}%; level {} had the lowest ({:.1}%)",
            analysis.max_error_rate * 100.0,
            lowest.level,
            lowest.error_rate * 100.0
        )),
    })
}

fn relative_gain(from: f64, to: f64) -> f64 {
    if from > 0.0 {
        (to - from) / from
    } else if to > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Sweep-wide observations beyond the optimal level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SweepAnalysis {
    pub optimal: Option<OptimalConcurrency>,

    /// Level with the highest requests per second
    pub max_throughput_level: Option<u32>,

    /// Level with the lowest mean latency among levels with successes
    pub min_latency_level: Option<u32>,

    /// First level whose RPS fell more than 5% below the previous level's
    pub throughput_decline_level: Option<u32>,
}

pub fn analyze_sweep(levels: &[LevelResult], analysis: &AnalysisConfig) -> SweepAnalysis {
    // On ties the earlier level wins.
    let max_throughput_level = levels
        .iter()
        .rev()
        .max_by(|a, b| a.requests_per_second.total_cmp(&b.requests_per_second))
        .map(|l| l.level);

    let min_latency_level = levels
        .iter()
        .filter(|l| l.success_count > 0)
        .min_by(|a, b| a.latency.mean_ms.total_cmp(&b.latency.mean_ms))
        .map(|l| l.level);

    let throughput_decline_level = levels
        .windows(2)
        .find(|pair| pair[1].requests_per_second < pair[0].requests_per_second * DECLINE_RATIO)
        .map(|pair| pair[1].level);

    SweepAnalysis {
        optimal: detect_optimal_concurrency(levels, analysis),
        max_throughput_level,
        min_latency_level,
        throughput_decline_level,
    }
}

/// Totals across every level of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SweepTotals {
    pub total_requests: usize,
    pub total_successes: usize,
    pub total_failures: usize,
    pub total_retries: u64,
    pub total_tokens: u64,
    pub error_rate: f64,
}

pub fn sweep_totals(levels: &[LevelResult]) -> SweepTotals {
    let mut totals = SweepTotals::default();
    for level in levels {
        totals.total_requests += level.total_attempted;
        totals.total_successes += level.success_count;
        totals.total_failures += level.failure_count;
        totals.total_retries += level.total_retries;
        totals.total_tokens += level.total_tokens;
    }
    if totals.total_requests > 0 {
        totals.error_rate = totals.total_failures as f64 / totals.total_requests as f64;
    }
    totals
}

/// Merge per-level error counts into a sweep-wide taxonomy.
pub fn merge_error_taxonomy(levels: &[LevelResult]) -> BTreeMap<ErrorKind, usize> {
    let mut merged = BTreeMap::new();
    for level in levels {
        for (kind, count) in &level.errors_by_kind {
            *merged.entry(*kind).or_insert(0) += count;
        }
    }
    merged
}

/// Network quality over a sweep, from probe samples only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkSummary {
    pub total_probes: usize,
    pub reachable_probes: usize,
    pub availability_pct: f64,
    pub packet_loss_pct: f64,
    pub rtt_mean_ms: f64,
    pub rtt_min_ms: f64,
    pub rtt_max_ms: f64,
    pub rtt_std_dev_ms: f64,
    pub rtt_p50_ms: f64,
    pub rtt_p95_ms: f64,

    /// Mean absolute difference between consecutive successful RTTs
    pub jitter_ms: f64,
}

/// Summarize probe samples. RTT statistics use reachable samples only.
pub fn summarize_network(samples: &[ProbeSample]) -> NetworkSummary {
    let total_probes = samples.len();
    if total_probes == 0 {
        return NetworkSummary::default();
    }

    // Jitter follows probe order, so keep the samples in time order.
    let rtts: Vec<f64> = samples
        .iter()
        .filter(|s| s.reachable)
        .map(|s| duration_ms(s.rtt))
        .collect();
    let reachable_probes = rtts.len();
    let availability_pct = reachable_probes as f64 / total_probes as f64 * 100.0;

    let mut summary = NetworkSummary {
        total_probes,
        reachable_probes,
        availability_pct,
        packet_loss_pct: 100.0 - availability_pct,
        ..NetworkSummary::default()
    };
    if rtts.is_empty() {
        return summary;
    }

    let mut sorted = rtts.clone();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let rtt_min_ms = sorted[0];
    let rtt_max_ms = sorted[sorted.len() - 1];
    let mean = (sorted.iter().sum::<f64>() / n).clamp(rtt_min_ms, rtt_max_ms);

    summary.rtt_mean_ms = mean;
    summary.rtt_min_ms = rtt_min_ms;
    summary.rtt_max_ms = rtt_max_ms;
    summary.rtt_p50_ms = nearest_rank(&sorted, 50.0);
    summary.rtt_p95_ms = nearest_rank(&sorted, 95.0);

    if sorted.len() > 1 {
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        summary.rtt_std_dev_ms = variance.sqrt();

        let diffs: f64 = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        summary.jitter_ms = diffs / (rtts.len() - 1) as f64;
    }

    summary
}
