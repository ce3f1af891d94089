//! Sweep-level behavior driven by in-process executors.
//!
//! Most tests run on a paused tokio clock so level durations are exact up to
//! timer granularity.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration};

use rust_apisweep::errors::{ErrorKind, FatalError};
use rust_apisweep::executor::{RequestExecutor, RequestOutcome};
use rust_apisweep::prober::{NetworkProber, ProbeTarget};
use rust_apisweep::prompts::PromptSource;
use rust_apisweep::runner::LevelRunner;
use rust_apisweep::scheduler::{
    RunLabels, SweepPlan, SweepScheduler, SweepState, SweepStatus, Workload,
};
use rust_apisweep::shutdown;

/// Succeeds after a fixed latency and tracks how many calls overlap.
struct CountingExecutor {
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl CountingExecutor {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn reset_max(&self) {
        self.max_in_flight.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl RequestExecutor for CountingExecutor {
    async fn execute(
        &self,
        request_index: usize,
        _prompt: &str,
    ) -> Result<RequestOutcome, FatalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        time::sleep(self.latency).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(RequestOutcome::succeeded(
            "chat",
            request_index,
            self.latency,
            Some(25),
        ))
    }
}

/// Always fails with the given kind after `attempts` attempts.
struct FailingExecutor {
    kind: ErrorKind,
    attempts: u32,
}

#[async_trait]
impl RequestExecutor for FailingExecutor {
    async fn execute(
        &self,
        request_index: usize,
        _prompt: &str,
    ) -> Result<RequestOutcome, FatalError> {
        time::sleep(Duration::from_millis(10)).await;
        Ok(RequestOutcome::failed(
            "chat",
            request_index,
            Duration::from_millis(10),
            self.kind,
            self.attempts,
        ))
    }
}

/// Succeeds for the first `healthy_calls` calls, then reports a fatal error.
struct BreaksAfter {
    healthy_calls: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl RequestExecutor for BreaksAfter {
    async fn execute(
        &self,
        request_index: usize,
        _prompt: &str,
    ) -> Result<RequestOutcome, FatalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        time::sleep(Duration::from_millis(10)).await;
        if call >= self.healthy_calls {
            return Err(FatalError::Task("request template broke".to_string()));
        }
        Ok(RequestOutcome::succeeded(
            "chat",
            request_index,
            Duration::from_millis(10),
            None,
        ))
    }
}

fn prompts() -> PromptSource {
    PromptSource::new(vec!["What is Rust?".to_string()]).unwrap()
}

fn levels_plan(levels: Vec<u32>, requests_per_level: usize) -> SweepPlan {
    SweepPlan {
        workload: Workload::Levels {
            levels,
            requests_per_level,
        },
        ramp_up: Duration::ZERO,
        cool_down: Duration::ZERO,
    }
}

fn labels() -> RunLabels {
    RunLabels {
        api_name: "mock".to_string(),
        test_name: "integration".to_string(),
        endpoint: "chat".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn doubling_concurrency_halves_level_duration() {
    let executor = Arc::new(CountingExecutor::new(Duration::from_millis(100)));
    let result = SweepScheduler::new(executor, prompts(), levels_plan(vec![1, 2], 4), labels())
        .run()
        .await
        .unwrap();

    assert_eq!(result.status, SweepStatus::Completed);
    assert_eq!(result.levels.len(), 2);

    let one = &result.levels[0];
    let two = &result.levels[1];
    assert!(one.duration >= Duration::from_millis(400), "{:?}", one.duration);
    assert!(one.duration < Duration::from_millis(420), "{:?}", one.duration);
    assert!(two.duration >= Duration::from_millis(200), "{:?}", two.duration);
    assert!(two.duration < Duration::from_millis(220), "{:?}", two.duration);

    let ratio = two.requests_per_second / one.requests_per_second;
    assert!(ratio > 1.85 && ratio < 2.1, "ratio was {}", ratio);

    for level in &result.levels {
        assert_eq!(level.success_count + level.failure_count, 4);
        assert_eq!(level.total_attempted, 4);
        assert!(level.complete);
        let expected_rps = level.success_count as f64 / level.duration.as_secs_f64();
        assert!((level.requests_per_second - expected_rps).abs() < 1e-9);
        assert_eq!(level.total_tokens, 100);
    }
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_level() {
    let executor = Arc::new(CountingExecutor::new(Duration::from_millis(30)));
    let runner = LevelRunner::new(executor.clone(), prompts());

    for level in [1u32, 3, 8, 32] {
        executor.reset_max();
        let run = runner.run(level, 20).await.unwrap();
        let observed = executor.max_in_flight.load(Ordering::SeqCst);
        assert!(observed <= level as usize, "level {} saw {}", level, observed);
        assert_eq!(observed, (level as usize).min(20));
        assert_eq!(run.outcomes.len(), 20);
    }
    assert_eq!(executor.calls.load(Ordering::SeqCst), 80);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_are_recorded_once_per_request() {
    let executor = Arc::new(FailingExecutor {
        kind: ErrorKind::ServerError,
        attempts: 3,
    });
    let result = SweepScheduler::new(executor, prompts(), levels_plan(vec![2], 6), labels())
        .run()
        .await
        .unwrap();

    let level = &result.levels[0];
    assert_eq!(level.total_attempted, 6);
    assert_eq!(level.failure_count, 6);
    assert_eq!(level.success_count, 0);
    assert_eq!(level.total_retries, 12);
    assert_eq!(level.errors_by_kind.get(&ErrorKind::ServerError), Some(&6));
    assert_eq!(level.requests_per_second, 0.0);
    assert_eq!(result.error_taxonomy.get(&ErrorKind::ServerError), Some(&6));

    // A high error rate is data, not a failed sweep.
    assert_eq!(result.status, SweepStatus::Completed);
    let optimal = result.optimal().unwrap();
    assert_eq!(optimal.level, 2);
    assert!(optimal.caveat.is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_sweep_keeps_finished_levels() {
    let executor = Arc::new(CountingExecutor::new(Duration::from_millis(100)));
    let (trigger, signal) = shutdown::channel();
    let scheduler = SweepScheduler::new(executor, prompts(), levels_plan(vec![1, 2], 4), labels())
        .with_shutdown(signal)
        .with_grace_period(Duration::from_secs(1));
    let state = scheduler.subscribe();

    let sweep = tokio::spawn(scheduler.run());
    // Level 1 ends at 400ms; level 2 has two requests in flight at 450ms.
    time::sleep(Duration::from_millis(450)).await;
    trigger.trigger();

    let result = time::timeout(Duration::from_secs(10), sweep)
        .await
        .expect("sweep hung after cancellation")
        .unwrap()
        .unwrap();

    assert_eq!(result.status, SweepStatus::Cancelled);
    assert_eq!(*state.borrow(), SweepState::Cancelled);
    assert!(!result.levels.is_empty() && result.levels.len() <= 2);

    let first = &result.levels[0];
    assert_eq!(first.level, 1);
    assert!(first.complete);
    assert_eq!(first.total_attempted, 4);

    if let Some(second) = result.levels.get(1) {
        assert_eq!(second.level, 2);
        assert!(!second.complete);
        assert!(second.total_attempted < 4);
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_requests_are_abandoned_after_grace_period() {
    let executor = Arc::new(CountingExecutor::new(Duration::from_secs(600)));
    let (trigger, signal) = shutdown::channel();
    let runner = LevelRunner::new(executor, prompts())
        .with_shutdown(signal)
        .with_grace_period(Duration::from_millis(500));

    let start = time::Instant::now();
    let level = tokio::spawn(async move { runner.run(4, 8).await });
    time::sleep(Duration::from_millis(100)).await;
    trigger.trigger();

    let run = level.await.unwrap().unwrap();
    let elapsed = start.elapsed();
    assert!(run.outcomes.is_empty());
    assert!(!run.completed);
    assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_aborts_and_preserves_completed_levels() {
    let executor = Arc::new(BreaksAfter {
        healthy_calls: 4,
        calls: AtomicUsize::new(0),
    });
    let scheduler =
        SweepScheduler::new(executor, prompts(), levels_plan(vec![1, 2, 4], 4), labels());
    let state = scheduler.subscribe();

    let aborted = scheduler.run().await.unwrap_err();
    assert_eq!(*state.borrow(), SweepState::Aborted);
    assert!(matches!(aborted.error, FatalError::Task(_)));
    assert_eq!(aborted.completed_levels.len(), 1);
    assert_eq!(aborted.completed_levels[0].level, 1);
    assert_eq!(aborted.completed_levels[0].success_count, 4);
}

#[tokio::test]
async fn probe_samples_do_not_count_as_requests() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let prober = NetworkProber::new(
        ProbeTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        Duration::from_millis(5),
        Duration::from_millis(500),
    )
    .unwrap();

    let executor = Arc::new(CountingExecutor::new(Duration::from_millis(20)));
    let plan = SweepPlan {
        workload: Workload::Levels {
            levels: vec![2],
            requests_per_level: 6,
        },
        ramp_up: Duration::from_millis(50),
        cool_down: Duration::ZERO,
    };
    let result = SweepScheduler::new(executor.clone(), prompts(), plan, labels())
        .with_prober(prober)
        .run()
        .await
        .unwrap();

    let network = result.network.expect("prober was configured");
    assert!(network.total_probes > 0);
    assert_eq!(network.reachable_probes, network.total_probes);

    assert_eq!(result.levels[0].total_attempted, 6);
    assert_eq!(result.totals.total_requests, 6);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
}
