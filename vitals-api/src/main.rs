//! VITALS API Server Entry Point
//!
//! Wires configuration, storage, the upstream client, cache and pipeline
//! together, spawns the background tasks and serves the router until
//! Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vitals_api::jobs::{
    cache_sweep_task, continuous_sync_task, job_runner_task, retention_task, CacheSweepConfig,
    JobRunnerConfig, RetentionConfig, SyncConfig,
};
use vitals_api::telemetry::{init_tracer, shutdown_tracer, MeteredUpstream, TelemetryConfig};
use vitals_api::{
    create_api_router, ApiConfig, ApiError, ApiResult, AppState, DbClient, DbConfig, PgJobStore,
    PgPointStore, PgSampleStore, StorageBackend,
};
use vitals_core::{Clock, PipelineConfig, SystemClock};
use vitals_pipeline::{ContinuousSync, Ingestor, JobWorker, PointRegistry, QueryService};
use vitals_storage::{
    CacheConfig, InMemoryJobStore, InMemoryPointStore, InMemorySampleStore, JobStore, PointStore,
    SampleStore, TieredCache,
};
use vitals_upstream::{HttpUpstream, UpstreamConfig, UpstreamSource};

type Stores = (Arc<dyn SampleStore>, Arc<dyn JobStore>, Arc<dyn PointStore>);

async fn open_stores(backend: StorageBackend, pipeline: &PipelineConfig) -> ApiResult<Stores> {
    match backend {
        StorageBackend::Postgres => {
            let db = DbClient::from_config(&DbConfig::from_env())?;
            db.migrate().await?;
            tracing::info!("Database schema up to date");
            Ok((
                Arc::new(PgSampleStore::new(db.clone(), pipeline.upsert_batch_size)),
                Arc::new(PgJobStore::new(db.clone())),
                Arc::new(PgPointStore::new(db)),
            ))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; nothing survives a restart");
            Ok((
                Arc::new(InMemorySampleStore::new()),
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryPointStore::new()),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let api_config = ApiConfig::from_env()?;
    let pipeline_config = PipelineConfig::from_env();
    pipeline_config.validate()?;
    let upstream_config = UpstreamConfig::from_env();
    let max_pages = upstream_config.max_pages;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (samples, jobs, points) = open_stores(api_config.storage, &pipeline_config).await?;

    let http = HttpUpstream::new(upstream_config)?;
    let upstream: Arc<dyn UpstreamSource> = Arc::new(MeteredUpstream::new(Arc::new(http)));
    let cache = Arc::new(TieredCache::open(&CacheConfig::from_env(), clock.clone())?);

    let registry = Arc::new(PointRegistry::new(
        upstream.clone(),
        points.clone(),
        samples.clone(),
    ));
    let ingestor = Ingestor::new(
        upstream,
        samples.clone(),
        max_pages,
        pipeline_config.upsert_batch_size,
    )
    .with_points(points);
    let service = Arc::new(QueryService::new(
        ingestor.clone(),
        jobs.clone(),
        cache.clone(),
        clock.clone(),
        pipeline_config.clone(),
    ));
    let worker = Arc::new(JobWorker::new(
        jobs.clone(),
        ingestor.clone(),
        cache.clone(),
        clock.clone(),
        pipeline_config.clone(),
    ));
    let sync = Arc::new(ContinuousSync::new(ingestor, clock.clone(), &pipeline_config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let work_token = CancellationToken::new();
    let tasks = vec![
        tokio::spawn({
            let rx = shutdown_rx.clone();
            let token = work_token.clone();
            async move {
                job_runner_task(worker, JobRunnerConfig::from_env(), rx, token).await;
            }
        }),
        tokio::spawn({
            let rx = shutdown_rx.clone();
            let cache = cache.clone();
            async move {
                cache_sweep_task(cache, CacheSweepConfig::from_env(), rx).await;
            }
        }),
        tokio::spawn({
            let rx = shutdown_rx.clone();
            let config = RetentionConfig::from_env(pipeline_config.job_retention_ms());
            async move {
                retention_task(jobs, clock, config, rx).await;
            }
        }),
        tokio::spawn({
            let rx = shutdown_rx;
            let token = work_token.clone();
            async move {
                continuous_sync_task(sync, SyncConfig::from_env(), rx, token).await;
            }
        }),
    ];

    let app = create_api_router(AppState::new(service, samples, registry), &api_config);

    let addr = api_config.bind_addr()?;
    tracing::info!(%addr, storage = ?api_config.storage, "Starting VITALS API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    work_token.cancel();
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    shutdown_tracer();
    Ok(())
}
