//! Plain-text rendering of stored results.

use crate::aggregator::{LevelResult, NetworkSummary, OptimalConcurrency};
use crate::errors::ErrorKind;
use crate::scheduler::SweepResult;
use crate::store::RunSummary;
use std::collections::BTreeMap;

impl LevelResult {
    /// Format as a single table row.
    pub fn format_table_row(&self) -> String {
        format!(
            "{:>6} {:>9} {:>8} {:>8} {:>9.2} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>8.1}% {:>9.1}{}",
            self.level,
            self.total_attempted,
            self.success_count,
            self.total_retries,
            self.requests_per_second,
            self.latency.mean_ms,
            self.latency.p50_ms,
            self.latency.p95_ms,
            self.latency.p99_ms,
            self.error_rate * 100.0,
            self.tokens_per_second,
            if self.complete { "" } else { "  (partial)" }
        )
    }
}

/// Format per-level results as a table.
pub fn format_level_table(levels: &[LevelResult]) -> String {
    if levels.is_empty() {
        return "No level data available.\n".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "\n{:>6} {:>9} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "Level", "Requests", "OK", "Retries", "RPS", "Mean", "p50", "p95", "p99", "Errors", "Tok/s"
    ));
    output.push_str(&format!(
        "{:>6} {:>9} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "", "", "", "", "", "(ms)", "(ms)", "(ms)", "(ms)", "", ""
    ));
    output.push_str(&"-".repeat(108));
    output.push('\n');

    for level in levels {
        output.push_str(&level.format_table_row());
        output.push('\n');
    }

    output
}

pub fn format_error_taxonomy(taxonomy: &BTreeMap<ErrorKind, usize>) -> String {
    if taxonomy.is_empty() {
        return "No errors recorded.\n".to_string();
    }

    let total: usize = taxonomy.values().sum();
    let mut output = String::new();
    output.push_str(&format!("\n{:<22} {:>8} {:>8}\n", "Error kind", "Count", "Share"));
    output.push_str(&"-".repeat(40));
    output.push('\n');
    for (kind, count) in taxonomy {
        output.push_str(&format!(
            "{:<22} {:>8} {:>7.1}%\n",
            kind.label(),
            count,
            *count as f64 / total as f64 * 100.0
        ));
    }
    output
}

pub fn format_network_summary(network: &NetworkSummary) -> String {
    if network.total_probes == 0 {
        return "No probe samples collected.\n".to_string();
    }
    format!(
        "Probes: {} ({} reachable), availability {:.1}%, loss {:.1}%\n\
         RTT ms: mean {:.1}, min {:.1}, max {:.1}, std dev {:.1}, p50 {:.1}, p95 {:.1}, jitter {:.1}\n",
        network.total_probes,
        network.reachable_probes,
        network.availability_pct,
        network.packet_loss_pct,
        network.rtt_mean_ms,
        network.rtt_min_ms,
        network.rtt_max_ms,
        network.rtt_std_dev_ms,
        network.rtt_p50_ms,
        network.rtt_p95_ms,
        network.jitter_ms
    )
}

fn format_optimal(optimal: &OptimalConcurrency) -> String {
    let mut line = format!(
        "Optimal concurrency: {} ({:.2} req/s, {:.1}% errors)\n",
        optimal.level,
        optimal.requests_per_second,
        optimal.error_rate * 100.0
    );
    if let Some(caveat) = &optimal.caveat {
        line.push_str(&format!("  caveat: {}\n", caveat));
    }
    line
}

/// Render a full sweep report.
pub fn render_sweep(result: &SweepResult) -> String {
    let mut output = String::new();

    output.push_str(&format!("Run {}\n", result.run_id));
    output.push_str(&format!(
        "API: {}  Test: {}  Endpoint: {}  Mode: {:?}  Status: {:?}\n",
        result.labels.api_name,
        result.labels.test_name,
        result.labels.endpoint,
        result.mode,
        result.status
    ));
    output.push_str(&format!(
        "Started: {}  Finished: {}  ({:.1}s)\n",
        result.started_at.to_rfc3339(),
        result.finished_at.to_rfc3339(),
        result.duration().num_milliseconds() as f64 / 1000.0
    ));

    output.push_str(&format_level_table(&result.levels));

    output.push_str(&format!(
        "\nTotals: {} requests, {} ok, {} failed, {} retries, {} tokens, {:.1}% errors\n",
        result.totals.total_requests,
        result.totals.total_successes,
        result.totals.total_failures,
        result.totals.total_retries,
        result.totals.total_tokens,
        result.totals.error_rate * 100.0
    ));

    output.push_str(&format_error_taxonomy(&result.error_taxonomy));

    if let Some(network) = &result.network {
        output.push_str("\nNetwork\n");
        output.push_str(&format_network_summary(network));
    }

    output.push('\n');
    match result.optimal() {
        Some(optimal) => output.push_str(&format_optimal(optimal)),
        None => output.push_str("Optimal concurrency: n/a\n"),
    }
    let analysis = &result.analysis;
    let level_or_dash = |level: Option<u32>| level.map_or("-".to_string(), |l| l.to_string());
    output.push_str(&format!(
        "Max throughput at level {}, min latency at level {}, throughput declines at level {}\n",
        level_or_dash(analysis.max_throughput_level),
        level_or_dash(analysis.min_latency_level),
        level_or_dash(analysis.throughput_decline_level)
    ));

    output
}

/// Render a run history listing.
pub fn format_history(runs: &[RunSummary]) -> String {
    if runs.is_empty() {
        return "No runs recorded.\n".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!(
        "{:<32} {:<20} {:<14} {:<14} {:<10} {:>7} {:>9} {:>8}\n",
        "Run id", "Started", "API", "Test", "Status", "Levels", "Requests", "Optimal"
    ));
    output.push_str(&"-".repeat(120));
    output.push('\n');
    for run in runs {
        output.push_str(&format!(
            "{:<32} {:<20} {:<14} {:<14} {:<10} {:>7} {:>9} {:>8}\n",
            run.run_id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.api_name,
            run.test_name,
            format!("{:?}", run.status),
            run.level_count,
            run.total_requests,
            run.optimal_level
                .map_or("-".to_string(), |l| l.to_string())
        ));
    }
    output
}
