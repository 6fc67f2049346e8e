//! Adaptive batch scheduler shared by every fetch in the process.
//!
//! Tasks are queued FIFO and released in groups of `batch_size`. Each group
//! runs concurrently; after it settles the loop sleeps for a delay derived
//! from the current target rate. Streaks of successes widen the batch and
//! raise the rate, streaks of failures narrow and halve it.

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::FetchResult;
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Lets the scheduler tell a successful task from a failed one.
pub trait TaskOutcome {
    fn succeeded(&self) -> bool;
}

impl<T, E> TaskOutcome for std::result::Result<T, E> {
    fn succeeded(&self) -> bool {
        self.is_ok()
    }
}

impl TaskOutcome for FetchResult {
    fn succeeded(&self) -> bool {
        self.success
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveSnapshot {
    pub batch_size: usize,
    pub target_rate: f64,
}

#[derive(Debug, Clone)]
pub struct AdaptiveState {
    config: SchedulerConfig,
    batch_size: usize,
    target_rate: f64,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl AdaptiveState {
    pub fn new(config: SchedulerConfig) -> Self {
        let batch_size = config
            .initial_batch_size
            .clamp(config.min_batch_size, config.max_batch_size);
        let target_rate = config.initial_rate.clamp(config.min_rate, config.max_rate);
        Self {
            config,
            batch_size,
            target_rate,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn snapshot(&self) -> AdaptiveSnapshot {
        AdaptiveSnapshot {
            batch_size: self.batch_size,
            target_rate: self.target_rate,
        }
    }

    pub fn record(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.consecutive_successes >= self.config.success_streak {
                self.batch_size = (self.batch_size + 1).min(self.config.max_batch_size);
                self.target_rate = (self.target_rate * 1.2).min(self.config.max_rate);
                self.consecutive_successes = 0;
                log::info!(
                    "Scheduler speeding up: batch size {}, rate {:.3} req/s",
                    self.batch_size,
                    self.target_rate
                );
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.consecutive_failures >= self.config.failure_streak {
                self.batch_size = self
                    .batch_size
                    .saturating_sub(1)
                    .max(self.config.min_batch_size);
                self.target_rate = (self.target_rate * 0.5).max(self.config.min_rate);
                self.consecutive_failures = 0;
                log::info!(
                    "Scheduler backing off: batch size {}, rate {:.3} req/s",
                    self.batch_size,
                    self.target_rate
                );
            }
        }

        if elapsed > Duration::from_millis(self.config.slow_task_ms) {
            self.target_rate = (self.target_rate * 0.8).max(self.config.min_rate);
            log::debug!(
                "Slow task ({:?}), rate lowered to {:.3} req/s",
                elapsed,
                self.target_rate
            );
        }
    }

    /// Pause that follows a group of `ran` tasks.
    pub fn batch_delay(&self, ran: usize) -> Duration {
        let secs = (ran as f64 / self.target_rate).ceil();
        let millis = (secs * 1000.0) as u64;
        Duration::from_millis(millis.clamp(self.config.min_delay_ms, self.config.max_delay_ms))
    }
}

/// A queued task. `abandoned` fires when the caller stops waiting for it.
struct Job {
    abandoned: CancellationToken,
    run: BoxFuture<'static, ()>,
}

/// Cheap-to-clone handle to the shared queue. The driving loop lives as
/// long as any handle does.
#[derive(Clone)]
pub struct Scheduler {
    jobs: mpsc::UnboundedSender<Job>,
    state: Arc<Mutex<AdaptiveState>>,
}

impl Scheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(AdaptiveState::new(config)));
        tokio::spawn(Self::drive(jobs_rx, state.clone()));
        Self {
            jobs: jobs_tx,
            state,
        }
    }

    async fn drive(mut jobs: mpsc::UnboundedReceiver<Job>, state: Arc<Mutex<AdaptiveState>>) {
        while let Some(first) = jobs.recv().await {
            let batch_size = state.lock().await.batch_size();
            let mut batch = Vec::with_capacity(batch_size);
            let mut skipped = 0;
            let mut next = Some(first);
            while let Some(job) = next {
                if job.abandoned.is_cancelled() {
                    skipped += 1;
                } else {
                    batch.push(job.run);
                }
                next = if batch.len() < batch_size {
                    jobs.try_recv().ok()
                } else {
                    None
                };
            }
            if skipped > 0 {
                log::debug!("Dropped {} abandoned task(s) from the queue", skipped);
            }
            if batch.is_empty() {
                continue;
            }

            let ran = batch.len();
            join_all(batch).await;

            let delay = state.lock().await.batch_delay(ran);
            log::debug!("Ran {} task(s), next group in {:?}", ran, delay);
            sleep(delay).await;
        }
        log::debug!("Scheduler queue closed.");
    }

    /// Queues `task` and resolves with its output once it has run.
    ///
    /// Dropping the returned future before the task starts removes it from
    /// the queue: it never runs and does not count toward the group pause.
    /// A task that has already started runs to completion.
    pub async fn schedule<F, Fut, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: TaskOutcome + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let state = self.state.clone();
        let abandoned = CancellationToken::new();
        let guard = abandoned.clone().drop_guard();
        let run: BoxFuture<'static, ()> = Box::pin(async move {
            let started = Instant::now();
            let outcome = task().await;
            state
                .lock()
                .await
                .record(outcome.succeeded(), started.elapsed());
            let _ = done_tx.send(outcome);
        });

        self.jobs
            .send(Job { abandoned, run })
            .map_err(|_| Error::SchedulerClosed)?;
        let outcome = done_rx.await.map_err(|_| Error::SchedulerClosed);
        guard.disarm();
        outcome
    }

    pub async fn snapshot(&self) -> AdaptiveSnapshot {
        self.state.lock().await.snapshot()
    }
}
