//! Concurrency level runner.
//!
//! Drives one level through a fixed pool of `level` worker tasks. Each worker
//! pulls the next request index from a shared counter, so exactly `level`
//! requests are in flight until the queue drains, and a worker that finishes
//! immediately starts the next request. Outcomes flow back over a channel in
//! completion order; the collecting loop is the single owner of the outcome
//! vector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::FatalError;
use crate::executor::{RequestExecutor, RequestOutcome};
use crate::metrics::CURRENT_CONCURRENCY_LEVEL;
use crate::percentiles::PercentileTracker;
use crate::prompts::PromptSource;
use crate::shutdown::ShutdownSignal;

/// Raw result of one level, before aggregation.
#[derive(Debug, Clone)]
pub struct LevelRun {
    pub level: u32,

    /// Requests the level was asked to issue (stress mode: requests issued)
    pub requested: usize,

    /// Outcomes in completion order
    pub outcomes: Vec<RequestOutcome>,

    /// Wall-clock time from the first issue to the last completion
    pub wall_clock: Duration,

    /// False when cancellation cut the level short
    pub completed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Budget {
    Requests(usize),
    Until(Instant),
}

enum WorkerMessage {
    Outcome(RequestOutcome),
    Fatal(FatalError),
}

/// Runs levels against one executor and prompt source.
pub struct LevelRunner<E: RequestExecutor + ?Sized> {
    executor: Arc<E>,
    prompts: PromptSource,
    shutdown: ShutdownSignal,
    grace_period: Duration,
    progress_interval: Duration,
}

impl<E: RequestExecutor + ?Sized + 'static> LevelRunner<E> {
    pub fn new(executor: Arc<E>, prompts: PromptSource) -> Self {
        Self {
            executor,
            prompts,
            shutdown: ShutdownSignal::never(),
            grace_period: Duration::from_secs(5),
            progress_interval: Duration::from_secs(10),
        }
    }

    /// Stop issuing when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// How long in-flight requests may finish after cancellation before they
    /// are abandoned.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Issue exactly `request_count` requests with at most `level` in flight.
    ///
    /// Returns `Err` only for fatal executor errors. Cancellation returns the
    /// outcomes gathered so far with `completed == false`.
    pub async fn run(&self, level: u32, request_count: usize) -> Result<LevelRun, FatalError> {
        self.drive(level, Budget::Requests(request_count)).await
    }

    /// Keep `level` requests in flight until `duration` has elapsed.
    ///
    /// No request is issued after the deadline; in-flight ones finish.
    pub async fn run_for_duration(
        &self,
        level: u32,
        duration: Duration,
    ) -> Result<LevelRun, FatalError> {
        self.drive(level, Budget::Until(Instant::now() + duration))
            .await
    }

    async fn drive(&self, level: u32, budget: Budget) -> Result<LevelRun, FatalError> {
        let worker_count = match budget {
            Budget::Requests(n) => (level as usize).min(n),
            Budget::Until(_) => level as usize,
        };

        info!(level = level, workers = worker_count, budget = ?budget, "Starting level");
        CURRENT_CONCURRENCY_LEVEL.set(i64::from(level));

        let next_index = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let started = Instant::now();

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&self.executor),
                self.prompts.clone(),
                Arc::clone(&next_index),
                budget,
                self.shutdown.clone(),
                tx.clone(),
            )));
        }
        drop(tx);

        let expected = match budget {
            Budget::Requests(n) => n,
            Budget::Until(_) => usize::MAX,
        };
        let mut outcomes = Vec::with_capacity(expected.min(1 << 16));
        let tracker = PercentileTracker::new();
        let mut progress =
            time::interval_at(started + self.progress_interval, self.progress_interval);
        let mut shutdown = self.shutdown.clone();
        let mut grace_deadline: Option<Instant> = None;
        let mut fatal: Option<FatalError> = None;

        loop {
            let grace_at = grace_deadline;
            let grace = async move {
                match grace_at {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                message = rx.recv() => match message {
                    Some(WorkerMessage::Outcome(outcome)) => {
                        if outcome.success {
                            tracker.record(outcome.latency);
                        }
                        outcomes.push(outcome);
                    }
                    Some(WorkerMessage::Fatal(error)) => {
                        fatal = Some(error);
                        break;
                    }
                    None => break,
                },
                _ = shutdown.stopped(), if grace_deadline.is_none() => {
                    info!(
                        level = level,
                        collected = outcomes.len(),
                        grace_ms = self.grace_period.as_millis() as u64,
                        "Cancellation requested, draining in-flight requests"
                    );
                    grace_deadline = Some(Instant::now() + self.grace_period);
                }
                _ = grace => {
                    warn!(level = level, "Grace period elapsed, abandoning in-flight requests");
                    break;
                }
                _ = progress.tick() => {
                    if let Some(stats) = tracker.stats() {
                        info!(
                            level = level,
                            completed = outcomes.len(),
                            elapsed_secs = started.elapsed().as_secs(),
                            latency = %stats.format(),
                            "Level progress"
                        );
                    }
                }
            }
        }

        let wall_clock = started.elapsed();

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    return Err(FatalError::Task(e.to_string()));
                }
            }
        }

        if let Some(error) = fatal {
            warn!(level = level, error = %error, "Level aborted by fatal error");
            return Err(error);
        }

        let issued = next_index.load(Ordering::SeqCst);
        let requested = match budget {
            Budget::Requests(n) => n,
            Budget::Until(_) => issued,
        };
        let completed = outcomes.len() == requested;

        let successes = outcomes.iter().filter(|o| o.success).count();
        info!(
            level = level,
            requested = requested,
            outcomes = outcomes.len(),
            successes = successes,
            failures = outcomes.len() - successes,
            wall_clock_ms = wall_clock.as_millis() as u64,
            completed = completed,
            "Level finished"
        );

        Ok(LevelRun {
            level,
            requested,
            outcomes,
            wall_clock,
            completed,
        })
    }
}

async fn worker_loop<E: RequestExecutor + ?Sized>(
    worker_id: usize,
    executor: Arc<E>,
    prompts: PromptSource,
    next_index: Arc<AtomicUsize>,
    budget: Budget,
    shutdown: ShutdownSignal,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    loop {
        if shutdown.is_stopped() {
            debug!(worker_id = worker_id, "Worker stopping on cancellation");
            break;
        }

        let index = match budget {
            Budget::Requests(n) => {
                let index = next_index.fetch_add(1, Ordering::SeqCst);
                if index >= n {
                    break;
                }
                index
            }
            Budget::Until(deadline) => {
                if Instant::now() >= deadline {
                    break;
                }
                next_index.fetch_add(1, Ordering::SeqCst)
            }
        };

        let message = match executor.execute(index, prompts.get(index)).await {
            Ok(outcome) => WorkerMessage::Outcome(outcome),
            Err(error) => WorkerMessage::Fatal(error),
        };
        let fatal = matches!(message, WorkerMessage::Fatal(_));
        if tx.send(message).is_err() || fatal {
            break;
        }
    }
}
