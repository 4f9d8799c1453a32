//! Job Retention Background Task
//!
//! Terminal jobs stay queryable for `job_retention_days` after completion,
//! then are purged from the live table. Archived history and dead letters
//! are kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use vitals_core::{env_or, Clock};
use vitals_storage::JobStore;

const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 3_600;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How often to purge (default: 1 hour)
    pub check_interval: Duration,

    /// How long terminal jobs are kept after completion
    pub retention_ms: i64,
}

impl RetentionConfig {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_RETENTION_INTERVAL_SECS),
            retention_ms,
        }
    }

    /// Reads `VITALS_RETENTION_INTERVAL_SECS` (default: 3600); the window
    /// itself comes from the pipeline configuration.
    pub fn from_env(retention_ms: i64) -> Self {
        Self {
            check_interval: Duration::from_secs(
                env_or("VITALS_RETENTION_INTERVAL_SECS", DEFAULT_RETENTION_INTERVAL_SECS).max(1),
            ),
            retention_ms,
        }
    }

    pub fn development(retention_ms: i64) -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            retention_ms,
        }
    }

    pub fn production(retention_ms: i64) -> Self {
        Self::new(retention_ms)
    }
}

#[derive(Debug, Default)]
pub struct RetentionMetrics {
    pub jobs_purged: AtomicU64,
    pub purge_cycles: AtomicU64,
    pub purge_errors: AtomicU64,
}

impl RetentionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RetentionSnapshot {
        RetentionSnapshot {
            jobs_purged: self.jobs_purged.load(Ordering::Relaxed),
            purge_cycles: self.purge_cycles.load(Ordering::Relaxed),
            purge_errors: self.purge_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSnapshot {
    pub jobs_purged: u64,
    pub purge_cycles: u64,
    pub purge_errors: u64,
}

pub async fn retention_task(
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<RetentionMetrics> {
    let metrics = Arc::new(RetentionMetrics::new());

    let mut purge_interval = interval(config.check_interval);
    purge_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        retention_ms = config.retention_ms,
        "Job retention task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Job retention task shutting down");
                    break;
                }
            }

            _ = purge_interval.tick() => {
                purge_once(jobs.as_ref(), clock.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        jobs_purged = snapshot.jobs_purged,
        purge_cycles = snapshot.purge_cycles,
        purge_errors = snapshot.purge_errors,
        "Job retention task completed"
    );

    metrics
}

pub async fn purge_once(
    jobs: &dyn JobStore,
    clock: &dyn Clock,
    config: &RetentionConfig,
    metrics: &RetentionMetrics,
) {
    metrics.purge_cycles.fetch_add(1, Ordering::Relaxed);
    let cutoff = clock.now() - ChronoDuration::milliseconds(config.retention_ms);

    match jobs.purge_terminal_before(cutoff).await {
        Ok(0) => tracing::trace!("No expired jobs to purge"),
        Ok(purged) => {
            tracing::info!(purged, cutoff = %cutoff, "Purged expired jobs");
            metrics.jobs_purged.fetch_add(purged, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to purge expired jobs");
            metrics.purge_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
