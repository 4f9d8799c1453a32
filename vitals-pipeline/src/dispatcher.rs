//! Size-based dispatch.
//!
//! Requests are sized by estimated sample count before anything is fetched:
//! small ones run inline, medium ones fan out per point on a bounded pool,
//! and large ones become jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{
    Clock, FetchPlan, Fingerprint, Job, JobId, JobKind, PipelineConfig, QueryParams, Resolution,
    Sample, UpstreamError, VitalsResult,
};
use vitals_storage::JobStore;

use crate::ingest::{IngestStats, Ingestor};

/// Which path a request of a given size takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPath {
    Direct,
    Batched,
    Async,
}

/// Expected samples for `points` over `plans` at `resolution`.
///
/// Per point and plan this is `ceil(duration / interval)`, where the
/// interval is the resolution's bucket, or the native raw spacing for
/// `Resolution::Raw`.
pub fn estimate_samples(
    point_count: usize,
    plans: &[FetchPlan],
    resolution: Resolution,
    raw_interval_ms: i64,
) -> u64 {
    let interval = resolution.bucket_ms().unwrap_or(raw_interval_ms).max(1).unsigned_abs();
    let per_point = plans
        .iter()
        .map(|p| p.duration_ms().max(0).unsigned_abs().div_ceil(interval))
        .fold(0u64, u64::saturating_add);
    per_point.saturating_mul(point_count as u64)
}

/// Below `direct` is direct; `direct..=batch` is batched; above is async.
pub fn classify(estimate: u64, config: &PipelineConfig) -> DispatchPath {
    if estimate < config.direct_threshold {
        DispatchPath::Direct
    } else if estimate <= config.batch_threshold {
        DispatchPath::Batched
    } else {
        DispatchPath::Async
    }
}

/// Samples fetched synchronously, with failures tagged per point.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub samples: Vec<Sample>,
    /// Point name to error message. A point listed here may still have
    /// samples from plans that succeeded.
    pub errors: BTreeMap<String, String>,
    /// Plans that failed for at least one point, and so are incomplete.
    pub failed_plans: Vec<FetchPlan>,
    /// Most recent upstream error, surfaced when nothing succeeded.
    pub last_error: Option<UpstreamError>,
    pub stats: IngestStats,
}

impl FetchResult {
    fn record_failure(&mut self, point: &str, plan: &FetchPlan, error: UpstreamError) {
        self.errors.insert(point.to_string(), error.to_string());
        if !self.failed_plans.contains(plan) {
            self.failed_plans.push(*plan);
        }
        self.last_error = Some(error);
    }

    /// True when every requested point failed and nothing came back.
    pub fn is_total_failure(&self, point_count: usize) -> bool {
        self.samples.is_empty() && point_count > 0 && self.errors.len() >= point_count
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Direct(FetchResult),
    Batched(FetchResult),
    Queued(JobId),
}

/// Input to [`Dispatcher::dispatch`].
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub params: QueryParams,
    /// Plans still to fetch; sizing is computed over these only.
    pub plans: Vec<FetchPlan>,
    /// Every plan of the query, frozen into the job if one is created.
    pub all_plans: Vec<FetchPlan>,
    pub resolution: Resolution,
    /// Whole-query fingerprint the job will cache under.
    pub cache_key: Fingerprint,
}

pub struct Dispatcher {
    ingestor: Ingestor,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl Dispatcher {
    pub fn new(
        ingestor: Ingestor,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ingestor,
            jobs,
            clock,
            config,
        }
    }

    pub fn estimate(&self, request: &DispatchRequest) -> u64 {
        estimate_samples(
            request.params.canonical_points().len(),
            &request.plans,
            request.resolution,
            self.config.raw_sample_interval_ms,
        )
    }

    pub async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> VitalsResult<DispatchOutcome> {
        let estimate = self.estimate(request);
        let path = classify(estimate, &self.config);
        tracing::info!(
            site = %request.params.site,
            estimate,
            path = ?path,
            plans = request.plans.len(),
            "Dispatching request"
        );
        match path {
            DispatchPath::Direct => Ok(DispatchOutcome::Direct(self.fetch_direct(request, cancel).await)),
            DispatchPath::Batched => Ok(DispatchOutcome::Batched(self.fetch_batched(request, cancel).await)),
            DispatchPath::Async => self.enqueue(request).await.map(DispatchOutcome::Queued),
        }
    }

    /// One upstream sequence per plan, covering all points at once.
    async fn fetch_direct(&self, request: &DispatchRequest, cancel: &CancellationToken) -> FetchResult {
        let points = request.params.canonical_points();
        let mut result = FetchResult::default();
        for plan in &request.plans {
            match self
                .ingestor
                .fetch(&request.params.site, &points, plan, cancel)
                .await
            {
                Ok((samples, stats)) => {
                    result.samples.extend(samples);
                    result.stats.merge(&stats);
                }
                Err(e) => {
                    tracing::warn!(site = %request.params.site, tier = %plan.tier, error = %e, "Direct fetch failed");
                    for point in &points {
                        result.record_failure(point, plan, e.clone());
                    }
                }
            }
        }
        result
    }

    /// One task per point on a pool of `max_batch_concurrency`. Results are
    /// merged in point order and one point's failure never fails the rest.
    async fn fetch_batched(&self, request: &DispatchRequest, cancel: &CancellationToken) -> FetchResult {
        let site = request.params.site.as_str();
        let plans = &request.plans;
        let per_point: Vec<(String, Vec<(FetchPlan, Result<(Vec<Sample>, IngestStats), UpstreamError>)>)> =
            stream::iter(request.params.canonical_points())
                .map(|point| async move {
                    let single = [point.clone()];
                    let mut outcomes = Vec::with_capacity(plans.len());
                    for plan in plans {
                        let outcome = self.ingestor.fetch(site, &single, plan, cancel).await;
                        outcomes.push((*plan, outcome));
                    }
                    (point, outcomes)
                })
                .buffered(self.config.max_batch_concurrency.max(1))
                .collect()
                .await;

        let mut result = FetchResult::default();
        for (point, outcomes) in per_point {
            for (plan, outcome) in outcomes {
                match outcome {
                    Ok((samples, stats)) => {
                        result.samples.extend(samples);
                        result.stats.merge(&stats);
                    }
                    Err(e) => {
                        tracing::warn!(site, point = %point, tier = %plan.tier, error = %e, "Batched fetch failed for point");
                        result.record_failure(&point, &plan, e);
                    }
                }
            }
        }
        result
    }

    async fn enqueue(&self, request: &DispatchRequest) -> VitalsResult<JobId> {
        let mut job = Job::new(
            JobKind::Query,
            request.params.clone(),
            request.resolution,
            request.cache_key,
            self.clock.now(),
        );
        job.plans = Some(request.all_plans.clone());
        self.jobs.insert(&job).await?;
        tracing::info!(job_id = %job.id, site = %job.params.site, "Enqueued query job");
        Ok(job.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::Tier;

    const HOUR: i64 = 3_600_000;

    #[test]
    fn test_estimate_uses_ceiling() {
        let plans = [FetchPlan::new(0, 90_001, Tier::Raw)];
        assert_eq!(estimate_samples(1, &plans, Resolution::Raw, 60_000), 2);
        assert_eq!(estimate_samples(3, &plans, Resolution::Raw, 60_000), 6);
        assert_eq!(estimate_samples(1, &plans, Resolution::OneHour, 60_000), 1);
    }

    #[test]
    fn test_classify_boundaries() {
        let config = PipelineConfig::default();
        assert_eq!(classify(999, &config), DispatchPath::Direct);
        assert_eq!(classify(1_000, &config), DispatchPath::Batched);
        assert_eq!(classify(100_000, &config), DispatchPath::Batched);
        assert_eq!(classify(100_001, &config), DispatchPath::Async);
        assert_eq!(classify(150_000, &config), DispatchPath::Async);
    }

    #[test]
    fn test_estimate_saturates_on_extreme_plans() {
        let plans = [
            FetchPlan::new(i64::MIN, 0, Tier::Raw),
            FetchPlan::new(0, i64::MAX, Tier::Aggregated),
        ];
        let per_point = estimate_samples(1, &plans, Resolution::Raw, 1);
        assert_eq!(per_point, u64::MAX - 1);
        assert_eq!(estimate_samples(2, &plans, Resolution::Raw, 1), u64::MAX);
        assert_eq!(
            classify(per_point, &PipelineConfig::default()),
            DispatchPath::Async
        );
    }

    #[test]
    fn test_estimate_sums_plans() {
        let plans = [
            FetchPlan::new(0, 48 * HOUR, Tier::Raw),
            FetchPlan::new(48 * HOUR, 50 * HOUR, Tier::Aggregated),
        ];
        assert_eq!(estimate_samples(1, &plans, Resolution::OneMinute, 60_000), 3_000);
    }
}
