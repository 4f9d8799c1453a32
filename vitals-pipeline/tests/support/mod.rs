//! Shared harness: mock upstream, in-memory stores, manual clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use vitals_core::{
    DeadLetterRecord, Job, JobId, JobKind, JobStatus, PipelineConfig, QueryParams, Resolution,
    StorageError, Timestamp, VitalsResult,
};
use vitals_pipeline::{Ingestor, JobWorker, QueryRequest, QueryService};
use vitals_storage::{CacheConfig, InMemoryJobStore, InMemorySampleStore, JobStore, TieredCache};
use vitals_test_utils::{fixtures, ManualClock, MockUpstream};

pub use vitals_test_utils::fixtures::{FIXED_NOW_MS as NOW, HOUR_MS, MINUTE_MS};

pub struct Harness {
    pub mock: MockUpstream,
    pub store: InMemorySampleStore,
    pub jobs: InMemoryJobStore,
    pub cache: Arc<TieredCache>,
    pub clock: ManualClock,
    pub service: QueryService,
    pub worker: JobWorker,
}

impl Harness {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_mock(MockUpstream::new(), config)
    }

    pub fn with_mock(mock: MockUpstream, config: PipelineConfig) -> Self {
        let jobs = InMemoryJobStore::new();
        Self::assemble(mock, jobs.clone(), Arc::new(jobs), config)
    }

    /// The worker goes through `flaky`; the service and `jobs` see the
    /// store underneath it.
    pub fn with_flaky_jobs(config: PipelineConfig) -> (Self, FlakyJobStore) {
        let jobs = InMemoryJobStore::new();
        let flaky = FlakyJobStore::new(jobs.clone());
        let harness = Self::assemble(MockUpstream::new(), jobs, Arc::new(flaky.clone()), config);
        (harness, flaky)
    }

    fn assemble(
        mock: MockUpstream,
        jobs: InMemoryJobStore,
        worker_jobs: Arc<dyn JobStore>,
        config: PipelineConfig,
    ) -> Self {
        let store = InMemorySampleStore::new();
        let clock = fixtures::clock();
        let cache = Arc::new(
            TieredCache::open(&CacheConfig::in_memory(256), Arc::new(clock.clone()))
                .expect("in-memory cache"),
        );
        let ingestor = Ingestor::new(
            Arc::new(mock.clone()),
            Arc::new(store.clone()),
            1_000,
            config.upsert_batch_size,
        );
        let service = QueryService::new(
            ingestor.clone(),
            Arc::new(jobs.clone()),
            cache.clone(),
            Arc::new(clock.clone()),
            config.clone(),
        );
        let worker = JobWorker::new(
            worker_jobs,
            ingestor,
            cache.clone(),
            Arc::new(clock.clone()),
            config,
        );
        Self {
            mock,
            store,
            jobs,
            cache,
            clock,
            service,
            worker,
        }
    }
}

pub fn request(points: &[&str], start_ms: i64, end_ms: i64) -> QueryRequest {
    QueryRequest {
        site: "S1".to_string(),
        points: points.iter().map(|p| p.to_string()).collect(),
        start_ms,
        end_ms,
        resolution: Resolution::Raw,
    }
}

pub fn params(points: &[&str], start_ms: i64, end_ms: i64) -> QueryParams {
    fixtures::params("S1", points, start_ms, end_ms)
}

/// Small thresholds so a few hours of data become a job.
pub fn job_config() -> PipelineConfig {
    fixtures::pipeline_config().with_thresholds(1, 2)
}

/// Job store that fails the next N reads or writes with `Unavailable`.
#[derive(Clone)]
pub struct FlakyJobStore {
    inner: InMemoryJobStore,
    failing_gets: Arc<AtomicU32>,
    failing_updates: Arc<AtomicU32>,
}

impl FlakyJobStore {
    pub fn new(inner: InMemoryJobStore) -> Self {
        Self {
            inner,
            failing_gets: Arc::new(AtomicU32::new(0)),
            failing_updates: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicU32) -> VitalsResult<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StorageError::Unavailable { reason: "connection reset".into() }.into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn insert(&self, job: &Job) -> VitalsResult<()> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: JobId) -> VitalsResult<Option<Job>> {
        Self::trip(&self.failing_gets)?;
        self.inner.get(id).await
    }

    async fn find_live(&self, params: &QueryParams, kind: JobKind) -> VitalsResult<Option<Job>> {
        self.inner.find_live(params, kind).await
    }

    async fn claim_next(&self, now: Timestamp, stale_before: Timestamp) -> VitalsResult<Option<Job>> {
        self.inner.claim_next(now, stale_before).await
    }

    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> VitalsResult<bool> {
        Self::trip(&self.failing_updates)?;
        self.inner.update_if_status(job, expected).await
    }

    async fn request_cancel(&self, id: JobId) -> VitalsResult<bool> {
        self.inner.request_cancel(id).await
    }

    async fn archive(&self, job: &Job, archived_at: Timestamp) -> VitalsResult<()> {
        self.inner.archive(job, archived_at).await
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> VitalsResult<bool> {
        self.inner.dead_letter(record).await
    }

    async fn list_dead_letters(&self, limit: usize) -> VitalsResult<Vec<DeadLetterRecord>> {
        self.inner.list_dead_letters(limit).await
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> VitalsResult<u64> {
        self.inner.purge_terminal_before(cutoff).await
    }
}
