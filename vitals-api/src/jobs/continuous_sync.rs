//! Continuous Sync Background Task
//!
//! Every cycle pulls the trailing `window_ms` of every known site into
//! sample storage. A site that fails is logged and retried next cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use vitals_core::env_or;
use vitals_pipeline::{ContinuousSync, SyncReport};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_SYNC_WINDOW_MS: i64 = 600_000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often to run a sync pass (default: 5 minutes)
    pub sync_interval: Duration,

    /// Trailing window ingested per site (default: 10 minutes, twice the
    /// interval so a late cycle still overlaps the previous one)
    pub window_ms: i64,

    pub enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            window_ms: DEFAULT_SYNC_WINDOW_MS,
            enabled: true,
        }
    }
}

impl SyncConfig {
    /// # Environment Variables
    /// - `VITALS_SYNC_INTERVAL_SECS` (default: 300)
    /// - `VITALS_SYNC_WINDOW_MS` (default: 600000)
    /// - `VITALS_SYNC_ENABLED` (default: true)
    pub fn from_env() -> Self {
        Self {
            sync_interval: Duration::from_secs(
                env_or("VITALS_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS).max(1),
            ),
            window_ms: env_or("VITALS_SYNC_WINDOW_MS", DEFAULT_SYNC_WINDOW_MS).max(1),
            enabled: std::env::var("VITALS_SYNC_ENABLED")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        }
    }

    pub fn development() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            window_ms: 120_000,
            enabled: true,
        }
    }

    pub fn production() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub sync_cycles: AtomicU64,
    pub sites_synced: AtomicU64,
    pub sites_failed: AtomicU64,
    pub samples_written: AtomicU64,
    pub samples_dropped: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
            sites_synced: self.sites_synced.load(Ordering::Relaxed),
            sites_failed: self.sites_failed.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &SyncReport) {
        self.sync_cycles.fetch_add(1, Ordering::Relaxed);
        self.sites_synced.fetch_add(report.synced as u64, Ordering::Relaxed);
        self.sites_failed.fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.samples_written.fetch_add(report.stats.written, Ordering::Relaxed);
        self.samples_dropped.fetch_add(report.stats.dropped, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub sync_cycles: u64,
    pub sites_synced: u64,
    pub sites_failed: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
}

pub async fn continuous_sync_task(
    sync: Arc<ContinuousSync>,
    config: SyncConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Arc<SyncMetrics> {
    let metrics = Arc::new(SyncMetrics::new());

    if !config.enabled {
        tracing::info!("Continuous sync disabled");
        return metrics;
    }

    let mut sync_interval = interval(config.sync_interval);
    sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sync_interval_secs = config.sync_interval.as_secs(),
        window_ms = config.window_ms,
        "Continuous sync task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Continuous sync task shutting down");
                    break;
                }
            }

            _ = sync_interval.tick() => {
                sync_once(&sync, &config, &metrics, &cancel).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sync_cycles = snapshot.sync_cycles,
        sites_synced = snapshot.sites_synced,
        sites_failed = snapshot.sites_failed,
        samples_written = snapshot.samples_written,
        "Continuous sync task completed"
    );

    metrics
}

pub async fn sync_once(
    sync: &ContinuousSync,
    config: &SyncConfig,
    metrics: &SyncMetrics,
    cancel: &CancellationToken,
) -> SyncReport {
    let report = sync.sync_all(config.window_ms, cancel).await;
    metrics.record(&report);
    if let Some(m) = crate::telemetry::metrics() {
        m.record_samples("sync", report.stats.written, report.stats.dropped);
    }

    if report.failed.is_empty() {
        tracing::debug!(
            sites = report.sites,
            written = report.stats.written,
            "Sync cycle completed"
        );
    } else {
        tracing::warn!(
            sites = report.sites,
            failed = report.failed.len(),
            written = report.stats.written,
            "Sync cycle completed with failures"
        );
    }
    report
}
