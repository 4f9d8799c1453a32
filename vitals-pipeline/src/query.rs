//! The query service: cache, live jobs, segment reuse, dispatch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use vitals_core::{
    CacheSource, Clock, DeadLetterRecord, FetchPlan, Fingerprint, Job, JobId, JobKind, JobStatus,
    PipelineConfig, Quality, QueryParams, Resolution, Sample, Timestamp, VitalsResult,
};
use vitals_storage::{CacheKey, JobStore, SampleQuery, TieredCache};

use crate::dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher};
use crate::ingest::Ingestor;
use crate::payload::{decode_samples, encode_samples};
use crate::router::{stitch, TierRouter};

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub site: String,
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Complete,
    Processing,
}

/// Where the samples in a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Cache,
    Storage,
    Direct,
    Batched,
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSample {
    pub timestamp_ms: i64,
    pub value: f64,
    pub quality: Quality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub point: String,
    pub samples: Vec<SeriesSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub series: Vec<Series>,
    pub errors: BTreeMap<String, String>,
    pub source: ResponseSource,
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl QueryResponse {
    fn processing(job_id: JobId, health: Health) -> Self {
        Self {
            status: QueryStatus::Processing,
            job_id: Some(job_id),
            series: Vec::new(),
            errors: BTreeMap::new(),
            source: ResponseSource::Queued,
            degraded: health.degraded,
            warnings: health.warnings,
        }
    }

    fn complete(
        order: &[String],
        samples: Vec<Sample>,
        errors: BTreeMap<String, String>,
        source: ResponseSource,
        health: Health,
    ) -> Self {
        let mut by_point: BTreeMap<String, Vec<SeriesSample>> = BTreeMap::new();
        for s in samples {
            by_point.entry(s.point).or_default().push(SeriesSample {
                timestamp_ms: s.timestamp_ms,
                value: s.value,
                quality: s.quality,
            });
        }
        let series = order
            .iter()
            .map(|point| Series {
                point: point.clone(),
                samples: by_point.remove(point).unwrap_or_default(),
            })
            .collect();
        Self {
            status: QueryStatus::Complete,
            job_id: None,
            series,
            errors,
            source,
            degraded: health.degraded,
            warnings: health.warnings,
        }
    }

    /// Total samples across all series.
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }
}

/// Public view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub sample_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            sample_count: job.sample_count,
            error: job.error.clone(),
            retry_count: job.retry_count,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Cache and storage trouble collected along the way.
#[derive(Debug, Default)]
struct Health {
    degraded: bool,
    warnings: Vec<String>,
}

impl Health {
    fn warn(&mut self, warning: String) {
        tracing::warn!(warning = %warning, "Serving degraded");
        self.degraded = true;
        self.warnings.push(warning);
    }
}

/// A cache invalidation that finished jobs completed earlier must honor.
#[derive(Debug, Clone)]
struct Invalidation {
    site: String,
    point_prefix: Option<String>,
    at_ms: i64,
}

impl Invalidation {
    fn covers(&self, params: &QueryParams) -> bool {
        self.site == params.site
            && match self.point_prefix.as_deref() {
                None | Some("") => true,
                Some(prefix) => params.points.iter().any(|p| p.starts_with(prefix)),
            }
    }
}

/// Trimmed, deduplicated points in request order.
fn request_order(points: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    points
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect()
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct QueryService {
    router: TierRouter,
    dispatcher: Dispatcher,
    ingestor: Ingestor,
    cache: Arc<TieredCache>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    /// Recent invalidations, pruned once older than the longest cache TTL.
    invalidations: RwLock<Vec<Invalidation>>,
}

impl QueryService {
    pub fn new(
        ingestor: Ingestor,
        jobs: Arc<dyn JobStore>,
        cache: Arc<TieredCache>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(ingestor.clone(), jobs.clone(), clock.clone(), config.clone());
        Self {
            router: TierRouter::from_config(&config),
            dispatcher,
            ingestor,
            cache,
            jobs,
            clock,
            config,
            invalidations: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    fn ttl_for(&self, plans: &[FetchPlan]) -> i64 {
        if !plans.is_empty() && plans.iter().all(|p| p.tier.is_raw()) {
            self.config.raw_cache_ttl_ms
        } else {
            self.config.cache_ttl_ms
        }
    }

    /// A finished query job stands in for the cache only while its result
    /// would still be cached: same tier split, completed within the TTL,
    /// and not invalidated since.
    async fn reusable(&self, job: &Job, fingerprint: Fingerprint) -> bool {
        let Some(completed_at) = job.completed_at else {
            return false;
        };
        if job.cache_key != fingerprint {
            return false;
        }
        let completed_ms = completed_at.timestamp_millis();
        let ttl = self.ttl_for(job.plans.as_deref().unwrap_or_default());
        if self.clock.now_ms().saturating_sub(completed_ms) >= ttl {
            return false;
        }
        !self
            .invalidations
            .read()
            .await
            .iter()
            .any(|inv| inv.at_ms >= completed_ms && inv.covers(&job.params))
    }

    async fn put_samples(
        &self,
        key: &CacheKey,
        points: Vec<String>,
        samples: &[Sample],
        ttl_ms: i64,
        source: CacheSource,
        health: &mut Health,
    ) {
        let result = match encode_samples(samples) {
            Ok(payload) => {
                self.cache
                    .put_payload(key.site(), key.fingerprint(), points, payload, ttl_ms, source)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            health.warn(format!("cache write failed: {}", e));
        }
    }

    /// Cached payload under `key`, if present and decodable.
    async fn cached_samples(&self, key: &CacheKey, health: &mut Health) -> Option<Vec<Sample>> {
        match self.cache.lookup(key).await {
            Ok(Some((entry, level))) => match decode_samples(&entry.payload) {
                Ok(samples) => {
                    tracing::debug!(fingerprint = %key.fingerprint(), level = level.as_str(), "Cache hit");
                    Some(samples)
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %key.fingerprint(), error = %e, "Discarding corrupt cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                health.warn(format!("cache unavailable: {}", e));
                None
            }
        }
    }

    /// Answer a query from cache, a matching job, or the upstream.
    pub async fn query(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> VitalsResult<QueryResponse> {
        let raw = QueryParams::new(
            request.site.clone(),
            request.points.clone(),
            request.start_ms,
            request.end_ms,
        );
        raw.validate()?;
        let order = request_order(&request.points);
        let params = raw.canonical();
        let resolution = request.resolution;
        let plans = self.router.route(&params, self.clock.now_ms())?;
        let fingerprint = Fingerprint::of_query(&params, &plans, resolution);
        let key = CacheKey::new(params.site.clone(), fingerprint);
        let mut health = Health::default();

        if let Some(samples) = self.cached_samples(&key, &mut health).await {
            return Ok(QueryResponse::complete(
                &order,
                samples,
                BTreeMap::new(),
                ResponseSource::Cache,
                health,
            ));
        }

        match self.jobs.find_live(&params, JobKind::Query).await {
            Ok(Some(job)) => match job.status {
                JobStatus::Queued | JobStatus::Processing => {
                    tracing::debug!(job_id = %job.id, "Query matches a running job");
                    return Ok(QueryResponse::processing(job.id, health));
                }
                JobStatus::Completed | JobStatus::CompletedWithErrors => {
                    if !self.reusable(&job, fingerprint).await {
                        tracing::debug!(job_id = %job.id, "Finished job is stale, fetching again");
                    } else {
                        match self.from_finished_job(&job, &params, &key).await {
                            Ok(samples) => {
                                if let Some(error) = &job.error {
                                    health.warnings.push(format!("job {}: {}", job.id, error));
                                }
                                return Ok(QueryResponse::complete(
                                    &order,
                                    samples,
                                    BTreeMap::new(),
                                    ResponseSource::Storage,
                                    health,
                                ));
                            }
                            Err(e) => health.warn(format!("storage read failed: {}", e)),
                        }
                    }
                }
                JobStatus::Failed => {}
            },
            Ok(None) => {}
            Err(e) => health.warn(format!("job lookup failed: {}", e)),
        }

        let mut cached = Vec::new();
        let mut missing = Vec::new();
        for plan in &plans {
            let segment = CacheKey::new(
                params.site.clone(),
                Fingerprint::of_segment(&params, plan, resolution),
            );
            match self.cached_samples(&segment, &mut health).await {
                Some(samples) => cached.extend(samples),
                None => missing.push(*plan),
            }
        }

        if missing.is_empty() {
            let stitched = stitch(&plans, cached);
            self.put_samples(
                &key,
                params.points.clone(),
                &stitched,
                self.ttl_for(&plans),
                CacheSource::Direct,
                &mut health,
            )
            .await;
            return Ok(QueryResponse::complete(
                &order,
                stitched,
                BTreeMap::new(),
                ResponseSource::Cache,
                health,
            ));
        }

        let dispatch = DispatchRequest {
            params: params.clone(),
            plans: missing.clone(),
            all_plans: plans.clone(),
            resolution,
            cache_key: fingerprint,
        };
        let (fetched, source, cache_source) = match self.dispatcher.dispatch(&dispatch, cancel).await? {
            DispatchOutcome::Queued(job_id) => return Ok(QueryResponse::processing(job_id, health)),
            DispatchOutcome::Direct(result) => (result, ResponseSource::Direct, CacheSource::Direct),
            DispatchOutcome::Batched(result) => (result, ResponseSource::Batched, CacheSource::Batched),
        };

        if fetched.is_total_failure(params.points.len()) && cached.is_empty() {
            if let Some(error) = fetched.last_error {
                return Err(error.into());
            }
        }

        if let Err(e) = self.ingestor.persist(&fetched.samples).await {
            health.warn(format!("storage write failed: {}", e));
        }

        for plan in missing.iter().filter(|p| !fetched.failed_plans.contains(p)) {
            let segment = CacheKey::new(
                params.site.clone(),
                Fingerprint::of_segment(&params, plan, resolution),
            );
            let samples: Vec<Sample> = fetched
                .samples
                .iter()
                .filter(|s| s.tier == plan.tier && plan.contains(s.timestamp_ms))
                .cloned()
                .collect();
            self.put_samples(
                &segment,
                params.points.clone(),
                &samples,
                self.ttl_for(std::slice::from_ref(plan)),
                cache_source,
                &mut health,
            )
            .await;
        }

        let stitched = stitch(&plans, cached.into_iter().chain(fetched.samples).collect());
        if fetched.errors.is_empty() {
            self.put_samples(
                &key,
                params.points.clone(),
                &stitched,
                self.ttl_for(&plans),
                cache_source,
                &mut health,
            )
            .await;
        }

        Ok(QueryResponse::complete(&order, stitched, fetched.errors, source, health))
    }

    /// Read a finished job's range from storage. Only fully completed jobs
    /// are cached under the query's key.
    async fn from_finished_job(
        &self,
        job: &Job,
        params: &QueryParams,
        key: &CacheKey,
    ) -> VitalsResult<Vec<Sample>> {
        let plans = match &job.plans {
            Some(plans) => plans.clone(),
            None => self.router.route(params, self.clock.now_ms())?,
        };
        let stored = self
            .ingestor
            .samples()
            .query_samples(&SampleQuery::new(
                params.site.clone(),
                params.points.clone(),
                params.start_ms,
                params.end_ms,
            ))
            .await?;
        let stitched = stitch(&plans, stored);
        if job.status == JobStatus::Completed {
            let mut health = Health::default();
            self.put_samples(
                key,
                params.points.clone(),
                &stitched,
                self.ttl_for(&plans),
                CacheSource::Queued,
                &mut health,
            )
            .await;
        }
        Ok(stitched)
    }

    // === Jobs ===

    /// Queue a historical backfill. A live backfill with identical
    /// parameters is reused instead of queueing a duplicate.
    pub async fn backfill(&self, params: QueryParams) -> VitalsResult<JobId> {
        params.validate_range()?;
        let params = params.canonical();
        if let Some(existing) = self.jobs.find_live(&params, JobKind::Backfill).await? {
            if !existing.status.is_terminal() {
                tracing::info!(job_id = %existing.id, "Reusing live backfill job");
                return Ok(existing.id);
            }
        }
        let plans = self.router.route(&params, self.clock.now_ms())?;
        let fingerprint = Fingerprint::of_query(&params, &plans, Resolution::Raw);
        let mut job = Job::new(
            JobKind::Backfill,
            params,
            Resolution::Raw,
            fingerprint,
            self.clock.now(),
        );
        job.plans = Some(plans);
        self.jobs.insert(&job).await?;
        tracing::info!(job_id = %job.id, site = %job.params.site, "Enqueued backfill job");
        Ok(job.id)
    }

    pub async fn job_status(&self, id: JobId) -> VitalsResult<Option<JobStatusView>> {
        Ok(self.jobs.get(id).await?.as_ref().map(JobStatusView::from))
    }

    pub async fn cancel_job(&self, id: JobId) -> VitalsResult<bool> {
        let flagged = self.jobs.request_cancel(id).await?;
        if flagged {
            tracing::info!(job_id = %id, "Cancellation requested");
        }
        Ok(flagged)
    }

    pub async fn dead_letters(&self, limit: usize) -> VitalsResult<Vec<DeadLetterRecord>> {
        self.jobs.list_dead_letters(limit).await
    }

    // === Cache ===

    pub async fn invalidate(&self, site: &str, point_prefix: Option<&str>) -> VitalsResult<u64> {
        let removed = self.cache.invalidate(site, point_prefix).await?;
        let now_ms = self.clock.now_ms();
        let horizon = self.config.cache_ttl_ms.max(self.config.raw_cache_ttl_ms);
        let mut invalidations = self.invalidations.write().await;
        invalidations.retain(|inv| now_ms.saturating_sub(inv.at_ms) < horizon);
        invalidations.push(Invalidation {
            site: site.trim().to_string(),
            point_prefix: point_prefix.map(str::to_string),
            at_ms: now_ms,
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_covers_site_and_prefix() {
        let params = QueryParams::new("S1", vec!["AHU-1.SAT".into(), "VAV-2.DAT".into()], 0, 10);
        let site_wide = Invalidation {
            site: "S1".into(),
            point_prefix: None,
            at_ms: 0,
        };
        assert!(site_wide.covers(&params));
        let prefix = Invalidation {
            point_prefix: Some("VAV".into()),
            ..site_wide.clone()
        };
        assert!(prefix.covers(&params));
        let other_prefix = Invalidation {
            point_prefix: Some("CH".into()),
            ..site_wide.clone()
        };
        assert!(!other_prefix.covers(&params));
        let other_site = Invalidation {
            site: "S2".into(),
            ..site_wide
        };
        assert!(!other_site.covers(&params));
    }

    #[test]
    fn test_request_order_dedupes_and_keeps_order() {
        let order = request_order(&["B".into(), " A ".into(), "B".into(), "".into()]);
        assert_eq!(order, vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_complete_groups_by_point_in_request_order() {
        let sample = |point: &str, ts: i64| Sample {
            site: "S1".into(),
            point: point.into(),
            timestamp_ms: ts,
            value: 1.0,
            quality: Quality::Good,
            tier: vitals_core::Tier::Raw,
        };
        let response = QueryResponse::complete(
            &["B".to_string(), "A".to_string(), "C".to_string()],
            vec![sample("A", 1), sample("B", 2), sample("B", 3)],
            BTreeMap::new(),
            ResponseSource::Direct,
            Health::default(),
        );
        let points: Vec<&str> = response.series.iter().map(|s| s.point.as_str()).collect();
        assert_eq!(points, vec!["B", "A", "C"]);
        assert_eq!(response.series[0].samples.len(), 2);
        assert!(response.series[2].samples.is_empty());
        assert_eq!(response.sample_count(), 3);
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let response = QueryResponse::processing(JobId::nil(), Health::default());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["source"], "queued");
        assert!(json.get("jobId").is_some());
    }
}
