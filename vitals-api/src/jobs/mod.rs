//! Background Jobs for the VITALS API
//!
//! - `job_runner`: claims and processes queued query and backfill jobs
//! - `cache_sweep`: purges expired cache entries
//! - `retention`: drops terminal jobs older than the retention window
//! - `continuous_sync`: ingests the recent window of every known site
//!
//! # Usage
//!
//! ```ignore
//! use vitals_api::jobs::{job_runner_task, JobRunnerConfig};
//! use tokio::sync::watch;
//! use tokio_util::sync::CancellationToken;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let worker_token = CancellationToken::new();
//! tokio::spawn(job_runner_task(worker, JobRunnerConfig::from_env(), shutdown_rx, worker_token.clone()));
//!
//! // On shutdown
//! worker_token.cancel();
//! let _ = shutdown_tx.send(true);
//! ```

pub mod cache_sweep;
pub mod continuous_sync;
pub mod job_runner;
pub mod retention;

pub use cache_sweep::{cache_sweep_task, CacheSweepConfig, CacheSweepMetrics};
pub use continuous_sync::{continuous_sync_task, SyncConfig, SyncMetrics};
pub use job_runner::{job_runner_task, JobRunnerConfig, JobRunnerMetrics};
pub use retention::{retention_task, RetentionConfig, RetentionMetrics};
