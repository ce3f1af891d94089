//! Sweep scheduler.
//!
//! Runs the configured concurrency levels strictly one after another:
//!
//! ```text
//! Idle -> RampingUp -> Running(l1) -> CoolingDown -> Running(l2) -> ... -> Completed
//!                                                                     \-> Cancelled / Aborted
//! ```
//!
//! The ramp-up pause happens once before the first level; cool-down pauses
//! happen between levels. The network prober is started at `RampingUp` and
//! stopped when the sweep ends, whatever the reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::aggregator::{
    aggregate_level, analyze_sweep, merge_error_taxonomy, summarize_network, sweep_totals,
    LevelResult, NetworkSummary, OptimalConcurrency, SweepAnalysis, SweepTotals,
};
use crate::config::{AnalysisConfig, TestPlan};
use crate::errors::{ErrorKind, FatalError};
use crate::executor::RequestExecutor;
use crate::metrics::CURRENT_CONCURRENCY_LEVEL;
use crate::prober::NetworkProber;
use crate::prompts::PromptSource;
use crate::runner::{LevelRun, LevelRunner};
use crate::shutdown::ShutdownSignal;
use crate::utils::generate_run_id;

/// Where a sweep currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    RampingUp,
    Running { level: u32 },
    CoolingDown,
    Completed,
    Cancelled,
    Aborted,
}

impl SweepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SweepState::Completed | SweepState::Cancelled | SweepState::Aborted
        )
    }
}

/// What each level does.
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    /// Issue `requests_per_level` requests at every level, in order.
    Levels {
        levels: Vec<u32>,
        requests_per_level: usize,
    },
    /// Keep `level` requests in flight for `duration`.
    Stress { level: u32, duration: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub workload: Workload,
    pub ramp_up: Duration,
    pub cool_down: Duration,
}

impl SweepPlan {
    pub fn stress(level: u32, duration: Duration, ramp_up: Duration) -> Self {
        Self {
            workload: Workload::Stress { level, duration },
            ramp_up,
            cool_down: Duration::ZERO,
        }
    }

    /// Levels in execution order.
    pub fn levels(&self) -> Vec<u32> {
        match &self.workload {
            Workload::Levels { levels, .. } => levels.clone(),
            Workload::Stress { level, .. } => vec![*level],
        }
    }
}

impl From<&TestPlan> for SweepPlan {
    fn from(plan: &TestPlan) -> Self {
        Self {
            workload: Workload::Levels {
                levels: plan.levels.clone(),
                requests_per_level: plan.requests_per_level,
            },
            ramp_up: plan.ramp_up,
            cool_down: plan.cool_down,
        }
    }
}

/// Names recorded in the result so a stored run can be identified later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLabels {
    pub api_name: String,
    pub test_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    Sweep,
    Stress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Completed,
    Cancelled,
}

/// The full-run artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub run_id: String,
    pub labels: RunLabels,
    pub mode: SweepMode,
    pub status: SweepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// In execution order
    pub levels: Vec<LevelResult>,

    pub network: Option<NetworkSummary>,
    pub analysis: SweepAnalysis,
    pub error_taxonomy: BTreeMap<ErrorKind, usize>,
    pub totals: SweepTotals,
}

impl SweepResult {
    pub fn optimal(&self) -> Option<&OptimalConcurrency> {
        self.analysis.optimal.as_ref()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A sweep stopped by a fatal error. Levels finished before the error are
/// kept for partial reporting.
#[derive(Debug, Error)]
#[error("sweep {run_id} aborted after {} completed level(s): {error}", .completed_levels.len())]
pub struct SweepAborted {
    pub run_id: String,
    pub error: FatalError,
    pub completed_levels: Vec<LevelResult>,
}

/// Orchestrates one sweep.
pub struct SweepScheduler<E: RequestExecutor + ?Sized> {
    runner: LevelRunner<E>,
    plan: SweepPlan,
    labels: RunLabels,
    analysis: AnalysisConfig,
    prober: Option<NetworkProber>,
    shutdown: ShutdownSignal,
    state: watch::Sender<SweepState>,
}

impl<E: RequestExecutor + ?Sized + 'static> SweepScheduler<E> {
    pub fn new(executor: Arc<E>, prompts: PromptSource, plan: SweepPlan, labels: RunLabels) -> Self {
        let (state, _) = watch::channel(SweepState::Idle);
        Self {
            runner: LevelRunner::new(executor, prompts),
            plan,
            labels,
            analysis: AnalysisConfig::default(),
            prober: None,
            shutdown: ShutdownSignal::never(),
            state,
        }
    }

    pub fn with_analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.analysis = analysis;
        self
    }

    /// Run `prober` alongside the levels.
    pub fn with_prober(mut self, prober: NetworkProber) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.runner = self.runner.with_shutdown(shutdown.clone());
        self.shutdown = shutdown;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.runner = self.runner.with_grace_period(grace_period);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.runner = self.runner.with_progress_interval(interval);
        self
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SweepState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SweepState) {
        let previous = self.state.send_replace(next);
        info!(from = ?previous, to = ?next, "Sweep state changed");
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        if self.shutdown.is_stopped() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = time::sleep(duration) => true,
            _ = shutdown.stopped() => false,
        }
    }

    async fn run_level(&self, level: u32) -> Result<LevelRun, FatalError> {
        match &self.plan.workload {
            Workload::Levels {
                requests_per_level, ..
            } => self.runner.run(level, *requests_per_level).await,
            Workload::Stress { duration, .. } => {
                self.runner.run_for_duration(level, *duration).await
            }
        }
    }

    /// Run every level and assemble the result.
    ///
    /// Cancellation is not an error: it yields a result with
    /// [`SweepStatus::Cancelled`] holding the levels gathered so far. A fatal
    /// error yields [`SweepAborted`].
    pub async fn run(mut self) -> Result<SweepResult, SweepAborted> {
        let started_at = Utc::now();
        let run_id = generate_run_id(started_at);
        let levels = self.plan.levels();
        let mode = match self.plan.workload {
            Workload::Levels { .. } => SweepMode::Sweep,
            Workload::Stress { .. } => SweepMode::Stress,
        };

        info!(
            run_id = %run_id,
            api = %self.labels.api_name,
            test = %self.labels.test_name,
            levels = ?levels,
            "Starting sweep"
        );

        self.transition(SweepState::RampingUp);
        let prober = self.prober.take().map(NetworkProber::spawn);

        let mut results: Vec<LevelResult> = Vec::with_capacity(levels.len());
        let mut cancelled = !self.pause(self.plan.ramp_up).await;

        if !cancelled {
            for (position, &level) in levels.iter().enumerate() {
                if position > 0 {
                    self.transition(SweepState::CoolingDown);
                    if !self.pause(self.plan.cool_down).await {
                        cancelled = true;
                        break;
                    }
                }

                self.transition(SweepState::Running { level });
                let run = match self.run_level(level).await {
                    Ok(run) => run,
                    Err(error) => {
                        if let Some(prober) = prober {
                            prober.stop();
                        }
                        CURRENT_CONCURRENCY_LEVEL.set(0);
                        self.transition(SweepState::Aborted);
                        warn!(run_id = %run_id, level = level, error = %error, "Sweep aborted");
                        return Err(SweepAborted {
                            run_id,
                            error,
                            completed_levels: results,
                        });
                    }
                };

                let level_complete = run.completed;
                if level_complete || !run.outcomes.is_empty() {
                    let result = aggregate_level(&run);
                    info!(
                        level = level,
                        rps = result.requests_per_second,
                        p95_ms = result.latency.p95_ms,
                        error_rate = result.error_rate,
                        "Level summarized"
                    );
                    results.push(result);
                }

                if !level_complete || self.shutdown.is_stopped() {
                    cancelled = true;
                    break;
                }
            }
        }

        let samples = prober.map(|p| p.stop());
        CURRENT_CONCURRENCY_LEVEL.set(0);

        let status = if cancelled {
            self.transition(SweepState::Cancelled);
            SweepStatus::Cancelled
        } else {
            self.transition(SweepState::Completed);
            SweepStatus::Completed
        };

        let result = SweepResult {
            run_id,
            labels: self.labels.clone(),
            mode,
            status,
            started_at,
            finished_at: Utc::now(),
            network: samples.as_deref().map(summarize_network),
            analysis: analyze_sweep(&results, &self.analysis),
            error_taxonomy: merge_error_taxonomy(&results),
            totals: sweep_totals(&results),
            levels: results,
        };

        info!(
            run_id = %result.run_id,
            status = ?result.status,
            levels = result.levels.len(),
            optimal = ?result.optimal().map(|o| o.level),
            "Sweep finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RequestOutcome;
    use async_trait::async_trait;
    use tokio::time::Instant;

    struct Sleeper(Duration);

    #[async_trait]
    impl RequestExecutor for Sleeper {
        async fn execute(
            &self,
            request_index: usize,
            _prompt: &str,
        ) -> Result<RequestOutcome, FatalError> {
            time::sleep(self.0).await;
            Ok(RequestOutcome::succeeded("chat", request_index, self.0, None))
        }
    }

    fn plan(levels: Vec<u32>, n: usize, ramp_up_ms: u64, cool_down_ms: u64) -> SweepPlan {
        SweepPlan {
            workload: Workload::Levels {
                levels,
                requests_per_level: n,
            },
            ramp_up: Duration::from_millis(ramp_up_ms),
            cool_down: Duration::from_millis(cool_down_ms),
        }
    }

    fn prompts() -> PromptSource {
        PromptSource::new(vec!["hello".to_string()]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_once_and_cool_down_between_levels() {
        let scheduler = SweepScheduler::new(
            Arc::new(Sleeper(Duration::from_millis(100))),
            prompts(),
            plan(vec![1, 1, 1], 2, 1000, 500),
            RunLabels::default(),
        );
        let state = scheduler.subscribe();

        let start = Instant::now();
        let result = scheduler.run().await.unwrap();
        let elapsed = start.elapsed();

        // 1000 ramp-up + 3 x 200 running + 2 x 500 cool-down
        assert!(elapsed >= Duration::from_millis(2600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2700), "{:?}", elapsed);
        assert_eq!(result.status, SweepStatus::Completed);
        assert_eq!(*state.borrow(), SweepState::Completed);
        assert!(result.network.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_levels_keep_configured_order() {
        let result = SweepScheduler::new(
            Arc::new(Sleeper(Duration::from_millis(10))),
            prompts(),
            plan(vec![4, 1, 2], 4, 0, 0),
            RunLabels::default(),
        )
        .run()
        .await
        .unwrap();

        let levels: Vec<u32> = result.levels.iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![4, 1, 2]);
        assert_eq!(result.totals.total_requests, 12);
        assert!(result.run_id.starts_with("run_"));
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_ramp_up() {
        let (shutdown, signal) = crate::shutdown::channel();
        let scheduler = SweepScheduler::new(
            Arc::new(Sleeper(Duration::from_millis(10))),
            prompts(),
            plan(vec![1, 2], 4, 10_000, 0),
            RunLabels::default(),
        )
        .with_shutdown(signal);

        let handle = tokio::spawn(scheduler.run());
        time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, SweepStatus::Cancelled);
        assert!(result.levels.is_empty());
        assert!(result.optimal().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stress_plan_runs_single_level() {
        let result = SweepScheduler::new(
            Arc::new(Sleeper(Duration::from_millis(100))),
            prompts(),
            SweepPlan::stress(3, Duration::from_millis(250), Duration::ZERO),
            RunLabels::default(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(result.mode, SweepMode::Stress);
        assert_eq!(result.levels.len(), 1);
        // Three workers issue at 0, 100 and 200 ms.
        assert_eq!(result.levels[0].total_attempted, 9);
        assert!(result.levels[0].complete);
    }

    #[test]
    fn test_plan_from_test_plan() {
        let test_plan = TestPlan {
            name: "quick".to_string(),
            levels: vec![1, 5],
            requests_per_level: 20,
            timeout: Duration::from_secs(30),
            retry: crate::executor::RetryPolicy::none(),
            ramp_up: Duration::from_secs(2),
            cool_down: Duration::from_secs(3),
        };
        let plan = SweepPlan::from(&test_plan);
        assert_eq!(plan.levels(), vec![1, 5]);
        assert_eq!(plan.ramp_up, Duration::from_secs(2));
        assert_eq!(plan.cool_down, Duration::from_secs(3));
        assert!(SweepState::Aborted.is_terminal());
        assert!(!SweepState::Running { level: 1 }.is_terminal());
    }
}
