//! Cache Sweep Background Task
//!
//! Expired entries are already invisible to lookups; this task reclaims
//! their space in both levels and refreshes the cache gauges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use vitals_core::env_or;
use vitals_storage::TieredCache;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheSweepConfig {
    /// How often to purge expired entries (default: 60 seconds)
    pub sweep_interval: Duration,
}

impl Default for CacheSweepConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl CacheSweepConfig {
    /// Reads `VITALS_CACHE_SWEEP_INTERVAL_SECS` (default: 60).
    pub fn from_env() -> Self {
        Self {
            sweep_interval: Duration::from_secs(
                env_or("VITALS_CACHE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).max(1),
            ),
        }
    }

    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
        }
    }

    pub fn production() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
pub struct CacheSweepMetrics {
    pub entries_removed: AtomicU64,
    pub sweep_cycles: AtomicU64,
    pub sweep_errors: AtomicU64,
}

impl CacheSweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CacheSweepSnapshot {
        CacheSweepSnapshot {
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSweepSnapshot {
    pub entries_removed: u64,
    pub sweep_cycles: u64,
    pub sweep_errors: u64,
}

pub async fn cache_sweep_task(
    cache: Arc<TieredCache>,
    config: CacheSweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CacheSweepMetrics> {
    let metrics = Arc::new(CacheSweepMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "Cache sweep task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_once(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        entries_removed = snapshot.entries_removed,
        sweep_cycles = snapshot.sweep_cycles,
        sweep_errors = snapshot.sweep_errors,
        "Cache sweep task completed"
    );

    metrics
}

pub async fn sweep_once(cache: &TieredCache, metrics: &CacheSweepMetrics) {
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    match cache.sweep_expired().await {
        Ok(removed) => {
            if removed > 0 {
                tracing::info!(removed, "Swept expired cache entries");
                metrics.entries_removed.fetch_add(removed, Ordering::Relaxed);
            } else {
                tracing::trace!("Cache sweep found nothing expired");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Cache sweep failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    if let (Some(m), Ok(stats)) = (crate::telemetry::metrics(), cache.stats().await) {
        m.observe_cache(&stats);
    }
}
