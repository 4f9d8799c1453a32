//! Job Runner Background Task
//!
//! Polls the job store and drives queued query and backfill jobs through the
//! worker. Each tick drains up to `max_jobs_per_tick` claimable jobs; a job
//! that runs past its batch budget is checkpointed and requeued by the worker
//! itself, so one long backfill cannot starve the queue.
//!
//! Shutdown cancels the worker token first. In-flight jobs checkpoint their
//! cursor and go back to `queued` without consuming a retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use vitals_core::{env_or, JobStatus};
use vitals_pipeline::{JobWorker, WorkerOutcome};

use crate::telemetry::metrics;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_JOBS_PER_TICK: usize = 16;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// How often to look for claimable jobs (default: 1 second)
    pub poll_interval: Duration,

    /// Upper bound on worker invocations per tick (default: 16)
    pub max_jobs_per_tick: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_jobs_per_tick: DEFAULT_MAX_JOBS_PER_TICK,
        }
    }
}

impl JobRunnerConfig {
    /// # Environment Variables
    /// - `VITALS_JOB_POLL_INTERVAL_MS` (default: 1000)
    /// - `VITALS_JOB_MAX_PER_TICK` (default: 16)
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(
                env_or("VITALS_JOB_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).max(1),
            ),
            max_jobs_per_tick: env_or("VITALS_JOB_MAX_PER_TICK", DEFAULT_MAX_JOBS_PER_TICK).max(1),
        }
    }

    pub fn development() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_jobs_per_tick: 4,
        }
    }

    pub fn production() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_jobs_per_tick: 64,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct JobRunnerMetrics {
    pub jobs_completed: AtomicU64,
    pub jobs_completed_with_errors: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_yielded: AtomicU64,
    /// Jobs whose state was changed by another writer mid-run.
    pub jobs_lost: AtomicU64,
    pub ticks: AtomicU64,
    pub errors: AtomicU64,
}

impl JobRunnerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JobRunnerSnapshot {
        JobRunnerSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_completed_with_errors: self.jobs_completed_with_errors.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_yielded: self.jobs_yielded.load(Ordering::Relaxed),
            jobs_lost: self.jobs_lost.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &WorkerOutcome) {
        let (counter, status) = match outcome {
            WorkerOutcome::Idle => return,
            WorkerOutcome::Finished { status, .. } => {
                let counter = match status {
                    JobStatus::Completed => &self.jobs_completed,
                    JobStatus::CompletedWithErrors => &self.jobs_completed_with_errors,
                    _ => &self.jobs_failed,
                };
                (counter, *status)
            }
            WorkerOutcome::Retrying { .. } => (&self.jobs_retried, JobStatus::Queued),
            WorkerOutcome::Yielded { .. } => (&self.jobs_yielded, JobStatus::Queued),
            WorkerOutcome::Lost { .. } => {
                self.jobs_lost.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = metrics() {
            m.record_job_transition(status);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRunnerSnapshot {
    pub jobs_completed: u64,
    pub jobs_completed_with_errors: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_yielded: u64,
    pub jobs_lost: u64,
    pub ticks: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Runs until the shutdown signal is received, then returns its metrics.
///
/// `worker_token` is handed to the worker so in-flight jobs can checkpoint;
/// the caller cancels it alongside the watch signal.
pub async fn job_runner_task(
    worker: Arc<JobWorker>,
    config: JobRunnerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    worker_token: CancellationToken,
) -> Arc<JobRunnerMetrics> {
    let metrics = Arc::new(JobRunnerMetrics::new());

    let mut poll = interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_jobs_per_tick = config.max_jobs_per_tick,
        "Job runner task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Job runner task shutting down");
                    break;
                }
            }

            _ = poll.tick() => {
                run_tick(&worker, &config, &metrics, &worker_token).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        jobs_completed = snapshot.jobs_completed,
        jobs_completed_with_errors = snapshot.jobs_completed_with_errors,
        jobs_failed = snapshot.jobs_failed,
        jobs_retried = snapshot.jobs_retried,
        jobs_yielded = snapshot.jobs_yielded,
        jobs_lost = snapshot.jobs_lost,
        errors = snapshot.errors,
        "Job runner task completed"
    );

    metrics
}

/// One poll: drain claimable jobs and account for each outcome.
pub async fn run_tick(
    worker: &JobWorker,
    config: &JobRunnerConfig,
    metrics: &JobRunnerMetrics,
    worker_token: &CancellationToken,
) {
    metrics.ticks.fetch_add(1, Ordering::Relaxed);
    match worker.drain(worker_token, config.max_jobs_per_tick).await {
        Ok(outcomes) => {
            for outcome in &outcomes {
                metrics.record(outcome);
            }
            if !outcomes.is_empty() {
                tracing::debug!(processed = outcomes.len(), "Job runner tick completed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Job runner tick failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::JobId;

    #[test]
    fn test_config_profiles() {
        let config = JobRunnerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(config.max_jobs_per_tick, DEFAULT_MAX_JOBS_PER_TICK);
        assert!(JobRunnerConfig::development().poll_interval < config.poll_interval);
        assert!(JobRunnerConfig::production().max_jobs_per_tick > config.max_jobs_per_tick);
    }

    #[test]
    fn test_outcomes_counted_by_kind() {
        let metrics = JobRunnerMetrics::new();
        let id = JobId::nil();
        metrics.record(&WorkerOutcome::Finished { job_id: id, status: JobStatus::Completed });
        metrics.record(&WorkerOutcome::Finished { job_id: id, status: JobStatus::Failed });
        metrics.record(&WorkerOutcome::Finished {
            job_id: id,
            status: JobStatus::CompletedWithErrors,
        });
        metrics.record(&WorkerOutcome::Lost { job_id: id });
        metrics.record(&WorkerOutcome::Idle);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_completed_with_errors, 1);
        assert_eq!(snapshot.jobs_lost, 1);
        assert_eq!(snapshot.jobs_retried, 0);
    }
}
