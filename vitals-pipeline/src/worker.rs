//! Asynchronous job worker.
//!
//! A job moves `queued -> processing -> {completed | completed_with_errors |
//! failed}`. Each invocation claims one job, works through its pending
//! units in sub-batches and either finishes it, requeues it with backoff
//! after a retryable failure, or yields it back to the queue when the
//! wall-clock budget runs out or the process is shutting down.
//!
//! A job-store error mid-job releases the job back to the queue with
//! backoff when the store allows it. When it does not, the claim lease
//! expires and the next worker picks the job up where the last saved cursor
//! left it.
//!
//! A work unit is one `(point, plan)` pair; a backfill without points has
//! one site-wide unit per plan. Units are indexed against the plans frozen
//! on the job, so the persisted cursor stays meaningful after the lag
//! boundary has moved.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vitals_core::{
    CacheSource, Clock, DeadLetterRecord, FetchPlan, Job, JobCursor, JobId, JobKind, JobStatus, PipelineConfig,
    Timestamp, UpstreamError, VitalsError, VitalsResult,
};
use vitals_storage::{JobStore, SampleQuery, TieredCache};

use crate::ingest::{IngestStats, Ingestor};
use crate::payload::encode_samples;
use crate::router::{stitch, TierRouter};

/// Error recorded on jobs stopped by a cancel request.
pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum YieldReason {
    Budget,
    Shutdown,
}

/// What one worker invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Nothing was claimable.
    Idle,
    Finished { job_id: JobId, status: JobStatus },
    Retrying {
        job_id: JobId,
        retry_count: u32,
        next_attempt_at: Timestamp,
    },
    /// Requeued with progress saved and no retry consumed.
    Yielded { job_id: JobId, reason: YieldReason },
    /// Another writer changed the job underneath us.
    Lost { job_id: JobId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkUnit {
    point: Option<String>,
    plan: FetchPlan,
}

impl WorkUnit {
    fn describe(&self) -> String {
        format!(
            "{}/{}",
            self.point.as_deref().unwrap_or("*"),
            self.plan.tier
        )
    }
}

fn work_units(points: &[String], plans: &[FetchPlan]) -> Vec<WorkUnit> {
    if points.is_empty() {
        return plans
            .iter()
            .map(|plan| WorkUnit {
                point: None,
                plan: *plan,
            })
            .collect();
    }
    points
        .iter()
        .flat_map(|point| {
            plans.iter().map(move |plan| WorkUnit {
                point: Some(point.clone()),
                plan: *plan,
            })
        })
        .collect()
}

/// Backoff before the `retry_count`-th retry: `base * 2^(retry_count - 1)`.
pub fn retry_delay(base_ms: u64, retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp))
}

pub struct JobWorker {
    jobs: Arc<dyn JobStore>,
    ingestor: Ingestor,
    cache: Arc<TieredCache>,
    router: TierRouter,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ingestor: Ingestor,
        cache: Arc<TieredCache>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            jobs,
            ingestor,
            cache,
            router: TierRouter::from_config(&config),
            clock,
            config,
        }
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> VitalsResult<WorkerOutcome> {
        if shutdown.is_cancelled() {
            return Ok(WorkerOutcome::Idle);
        }
        let now = self.clock.now();
        let stale_before = now - chrono::Duration::milliseconds(self.config.job_lease_ms);
        match self.jobs.claim_next(now, stale_before).await? {
            Some(job) => {
                tracing::info!(job_id = %job.id, retry_count = job.retry_count, "Claimed job");
                self.process(job, shutdown).await
            }
            None => Ok(WorkerOutcome::Idle),
        }
    }

    /// Run until nothing is claimable or `max_invocations` is reached.
    pub async fn drain(
        &self,
        shutdown: &CancellationToken,
        max_invocations: usize,
    ) -> VitalsResult<Vec<WorkerOutcome>> {
        let mut outcomes = Vec::new();
        for _ in 0..max_invocations {
            match self.run_once(shutdown).await? {
                WorkerOutcome::Idle => break,
                outcome => outcomes.push(outcome),
            }
        }
        Ok(outcomes)
    }

    /// Process a job already claimed into `processing`.
    pub async fn process(&self, job: Job, shutdown: &CancellationToken) -> VitalsResult<WorkerOutcome> {
        let claimed = job.clone();
        match self.process_claimed(job, shutdown).await {
            Err(error @ VitalsError::Storage(_)) => self.release(claimed, error).await,
            outcome => outcome,
        }
    }

    /// Hand a job back to the queue after the job store failed underneath
    /// it. Progress since the claim is redone; sample upserts are
    /// idempotent. No retry is consumed. If the release cannot be written
    /// either, the original error is returned and the lease takes over.
    async fn release(&self, mut job: Job, error: VitalsError) -> VitalsResult<WorkerOutcome> {
        let delay = retry_delay(self.config.retry_base_ms, job.retry_count.saturating_add(1));
        let next_attempt_at = self.after(delay);
        job.error = Some(error.to_string());
        job.next_attempt_at = next_attempt_at;
        if job.transition(JobStatus::Queued).is_err() {
            return Err(error);
        }
        match self.save(&job).await {
            Ok(true) => {
                tracing::warn!(
                    job_id = %job.id,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job released after job store failure"
                );
                Ok(WorkerOutcome::Retrying {
                    job_id: job.id,
                    retry_count: job.retry_count,
                    next_attempt_at,
                })
            }
            Ok(false) => Ok(WorkerOutcome::Lost { job_id: job.id }),
            Err(release_error) => {
                tracing::error!(
                    job_id = %job.id,
                    error = %error,
                    release_error = %release_error,
                    lease_ms = self.config.job_lease_ms,
                    "Job store failed; job stays claimed until its lease expires"
                );
                Err(error)
            }
        }
    }

    /// `now + delay`, saturating at the latest representable instant.
    fn after(&self, delay: Duration) -> Timestamp {
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        chrono::Duration::try_milliseconds(millis)
            .and_then(|d| self.clock.now().checked_add_signed(d))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
    }

    async fn process_claimed(&self, mut job: Job, shutdown: &CancellationToken) -> VitalsResult<WorkerOutcome> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.job_batch_budget_ms);

        if job.cancel_requested {
            return self.finish_failed(job, CANCELLED_ERROR.to_string(), false).await;
        }

        if job.plans.is_none() {
            match self.router.route(&job.params, self.clock.now_ms()) {
                Ok(plans) => job.plans = Some(plans),
                Err(e) => return self.finish_failed(job, e.to_string(), false).await,
            }
        }
        let plans = job.plans.clone().unwrap_or_default();
        let units = work_units(&job.params.points, &plans);
        let cursor = match job.cursor.take() {
            Some(cursor) if cursor.total_units == units.len() => cursor,
            _ => JobCursor::new(units.len()),
        };
        job.cursor = Some(cursor);
        if !self.save(&job).await? {
            return Ok(WorkerOutcome::Lost { job_id: job.id });
        }

        let pending = job
            .cursor
            .as_ref()
            .map(JobCursor::pending_units)
            .unwrap_or_default();
        let sub_batch = self.config.job_sub_batch_concurrency.max(1);

        for (batch_index, batch) in pending.chunks(sub_batch).enumerate() {
            if shutdown.is_cancelled() {
                return self.yield_job(job, YieldReason::Shutdown).await;
            }
            if batch_index > 0 && started.elapsed() >= budget {
                return self.yield_job(job, YieldReason::Budget).await;
            }
            if self.cancel_requested(job.id).await? {
                return self.finish_failed(job, CANCELLED_ERROR.to_string(), false).await;
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|&i| self.run_unit(&job, &units[i], shutdown)),
            )
            .await;

            let mut failure: Option<VitalsError> = None;
            let mut interrupted = false;
            let cursor = job.cursor.get_or_insert_with(|| JobCursor::new(units.len()));
            for (&i, result) in batch.iter().zip(results) {
                match result {
                    Ok(stats) => {
                        cursor.completed_units.insert(i);
                        cursor.samples_written += stats.written;
                    }
                    Err(VitalsError::Upstream(UpstreamError::Rejected { status, message })) => {
                        tracing::warn!(
                            job_id = %job.id,
                            unit = %units[i].describe(),
                            status,
                            message = %message,
                            "Upstream rejected work unit"
                        );
                        cursor.rejected_units.insert(i);
                    }
                    Err(VitalsError::Upstream(UpstreamError::Cancelled)) => interrupted = true,
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, unit = %units[i].describe(), error = %e, "Work unit failed");
                        let keep_current = failure
                            .as_ref()
                            .map(VitalsError::is_storage_write_failure)
                            .unwrap_or(false);
                        if !keep_current {
                            failure = Some(e);
                        }
                    }
                }
            }

            if let Some(error) = failure {
                return self.handle_failure(job, &units, error).await;
            }
            if interrupted {
                return self.yield_job(job, YieldReason::Shutdown).await;
            }
            if !self.save(&job).await? {
                return Ok(WorkerOutcome::Lost { job_id: job.id });
            }
        }

        self.complete(job, &units).await
    }

    async fn run_unit(
        &self,
        job: &Job,
        unit: &WorkUnit,
        shutdown: &CancellationToken,
    ) -> VitalsResult<IngestStats> {
        let points: Vec<String> = unit.point.iter().cloned().collect();
        self.ingestor
            .ingest(&job.params.site, &points, &unit.plan, shutdown)
            .await
    }

    async fn cancel_requested(&self, id: JobId) -> VitalsResult<bool> {
        Ok(self
            .jobs
            .get(id)
            .await?
            .map(|stored| stored.cancel_requested)
            .unwrap_or(false))
    }

    /// CAS write that also renews the lease; false means another writer
    /// moved the job.
    async fn save(&self, job: &Job) -> VitalsResult<bool> {
        let mut job = job.clone();
        job.heartbeat_at = Some(self.clock.now());
        let saved = self.jobs.update_if_status(&job, JobStatus::Processing).await?;
        if !saved {
            tracing::warn!(job_id = %job.id, "Job changed underneath worker, abandoning");
        }
        Ok(saved)
    }

    async fn yield_job(&self, mut job: Job, reason: YieldReason) -> VitalsResult<WorkerOutcome> {
        job.transition(JobStatus::Queued)?;
        job.next_attempt_at = self.clock.now();
        if !self.save(&job).await? {
            return Ok(WorkerOutcome::Lost { job_id: job.id });
        }
        tracing::info!(
            job_id = %job.id,
            reason = ?reason,
            pending = job.cursor.as_ref().map(|c| c.pending_units().len()).unwrap_or(0),
            "Job yielded with progress saved"
        );
        Ok(WorkerOutcome::Yielded {
            job_id: job.id,
            reason,
        })
    }

    /// Retryable failure of a sub-batch.
    ///
    /// Once retries are exhausted the job fails and is dead-lettered if
    /// nothing succeeded or storage writes are failing; otherwise it
    /// completes with errors and keeps what was written.
    async fn handle_failure(
        &self,
        mut job: Job,
        units: &[WorkUnit],
        error: VitalsError,
    ) -> VitalsResult<WorkerOutcome> {
        job.retry_count += 1;
        let message = error.to_string();
        if job.retry_count <= self.config.max_retries {
            return self.requeue(job, message).await;
        }

        let cursor = job.cursor.clone().unwrap_or_default();
        if cursor.completed_units.is_empty() || error.is_storage_write_failure() {
            let summary = format!("failed after {} retries: {}", self.config.max_retries, message);
            return self.finish_failed(job, summary, true).await;
        }
        let mut summary = format!(
            "{} of {} units failed after {} retries: {}",
            cursor.pending_units().len(),
            cursor.total_units,
            self.config.max_retries,
            message
        );
        if let Some(rejected) = rejected_summary(&cursor, units) {
            summary.push_str("; ");
            summary.push_str(&rejected);
        }
        self.finish(job, JobStatus::CompletedWithErrors, Some(summary))
            .await
    }

    /// Failure while publishing a finished job's result.
    async fn retry_or_fail(&self, mut job: Job, error: VitalsError) -> VitalsResult<WorkerOutcome> {
        job.retry_count += 1;
        if job.retry_count > self.config.max_retries {
            let summary = format!("failed after {} retries: {}", self.config.max_retries, error);
            return self.finish_failed(job, summary, true).await;
        }
        self.requeue(job, error.to_string()).await
    }

    async fn requeue(&self, mut job: Job, message: String) -> VitalsResult<WorkerOutcome> {
        let delay = retry_delay(self.config.retry_base_ms, job.retry_count);
        let next_attempt_at = self.after(delay);
        job.error = Some(message);
        job.next_attempt_at = next_attempt_at;
        job.transition(JobStatus::Queued)?;
        if !self.save(&job).await? {
            return Ok(WorkerOutcome::Lost { job_id: job.id });
        }
        tracing::warn!(
            job_id = %job.id,
            retry_count = job.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = job.error.as_deref().unwrap_or_default(),
            "Job requeued after failure"
        );
        Ok(WorkerOutcome::Retrying {
            job_id: job.id,
            retry_count: job.retry_count,
            next_attempt_at,
        })
    }

    /// All units are completed or rejected.
    async fn complete(&self, job: Job, units: &[WorkUnit]) -> VitalsResult<WorkerOutcome> {
        let cursor = job.cursor.clone().unwrap_or_default();
        let rejected = rejected_summary(&cursor, units);

        if cursor.completed_units.is_empty() && !cursor.rejected_units.is_empty() {
            let summary = rejected.unwrap_or_else(|| "all units rejected by upstream".to_string());
            return self.finish_failed(job, summary, true).await;
        }
        match rejected {
            Some(summary) => self.finish(job, JobStatus::CompletedWithErrors, Some(summary)).await,
            None => self.finish(job, JobStatus::Completed, None).await,
        }
    }

    /// Record the result of a job that produced data and close it out.
    async fn finish(
        &self,
        mut job: Job,
        status: JobStatus,
        error: Option<String>,
    ) -> VitalsResult<WorkerOutcome> {
        job.sample_count = match job.kind {
            JobKind::Query => match self.publish(&job, status == JobStatus::Completed).await {
                Ok(count) => count,
                Err(e) if e.is_retryable() => return self.retry_or_fail(job, e).await,
                Err(e) => return Err(e),
            },
            JobKind::Backfill => job.cursor.as_ref().map(|c| c.samples_written).unwrap_or(0),
        };
        job.error = error;
        self.close(job, status).await
    }

    /// Read the job's range back from storage, stitch it, and cache it
    /// under the job's key when `cache` is set. Returns the sample count.
    async fn publish(&self, job: &Job, cache: bool) -> VitalsResult<u64> {
        let plans = job.plans.clone().unwrap_or_default();
        let query = SampleQuery::new(
            job.params.site.clone(),
            job.params.points.clone(),
            job.params.start_ms,
            job.params.end_ms,
        );
        let stored = self
            .ingestor
            .samples()
            .query_samples(&query)
            .await?;
        let stitched = stitch(&plans, stored);
        let count = stitched.len() as u64;

        if cache {
            let ttl = if plans.iter().all(|p| p.tier.is_raw()) {
                self.config.raw_cache_ttl_ms
            } else {
                self.config.cache_ttl_ms
            };
            let result = match encode_samples(&stitched) {
                Ok(payload) => {
                    self.cache
                        .put_payload(
                            &job.params.site,
                            job.cache_key,
                            job.params.canonical_points(),
                            payload,
                            ttl,
                            CacheSource::Queued,
                        )
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::warn!(
                    job_id = %job.id,
                    fingerprint = %job.cache_key,
                    error = %e,
                    "Failed to cache job result"
                );
            }
        }
        Ok(count)
    }

    async fn finish_failed(
        &self,
        mut job: Job,
        error: String,
        dead_letter: bool,
    ) -> VitalsResult<WorkerOutcome> {
        job.error = Some(error);
        let snapshot = job.clone();
        let outcome = self.close(job, JobStatus::Failed).await?;
        if dead_letter && matches!(outcome, WorkerOutcome::Finished { .. }) {
            let record = DeadLetterRecord::from_job(&snapshot, self.clock.now());
            if self.jobs.dead_letter(&record).await? {
                tracing::error!(
                    job_id = %record.job_id,
                    retry_count = record.retry_count,
                    error = %record.error,
                    "Job dead-lettered"
                );
            }
        }
        Ok(outcome)
    }

    async fn close(&self, mut job: Job, status: JobStatus) -> VitalsResult<WorkerOutcome> {
        let now = self.clock.now();
        job.transition(status)?;
        job.completed_at = Some(now);
        if !self.save(&job).await? {
            return Ok(WorkerOutcome::Lost { job_id: job.id });
        }
        self.jobs.archive(&job, now).await?;
        tracing::info!(
            job_id = %job.id,
            status = %status,
            sample_count = job.sample_count,
            retry_count = job.retry_count,
            error = job.error.as_deref().unwrap_or_default(),
            "Job finished"
        );
        Ok(WorkerOutcome::Finished {
            job_id: job.id,
            status,
        })
    }
}

fn rejected_summary(cursor: &JobCursor, units: &[WorkUnit]) -> Option<String> {
    if cursor.rejected_units.is_empty() {
        return None;
    }
    let names: Vec<String> = cursor
        .rejected_units
        .iter()
        .filter_map(|&i| units.get(i).map(WorkUnit::describe))
        .collect();
    Some(format!(
        "{} of {} units rejected by upstream: {}",
        cursor.rejected_units.len(),
        cursor.total_units,
        names.join(", ")
    ))
}
