//! Job queue persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use vitals_core::{
    DeadLetterRecord, Job, JobId, JobKind, JobStatus, QueryParams, Timestamp, VitalsResult,
};

/// Live job table, history archive and dead-letter records.
///
/// Ownership of a job is decided by compare-and-swap on its status:
/// `claim_next` moves exactly one `queued` job to `processing`, and every
/// later write goes through `update_if_status`, which only lands when the
/// stored status still matches what the writer last observed.
///
/// Holding a job is a lease renewed by every write through
/// `heartbeat_at`. A `processing` job whose heartbeat is older than the
/// lease belongs to a worker that died or lost its store connection, and is
/// handed out again by `claim_next`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> VitalsResult<()>;

    async fn get(&self, id: JobId) -> VitalsResult<Option<Job>>;

    /// Most recent live job of `kind` with identical canonical params that has
    /// not failed.
    async fn find_live(&self, params: &QueryParams, kind: JobKind) -> VitalsResult<Option<Job>>;

    /// Atomically claim the oldest job that is either queued with its backoff
    /// elapsed, or processing with a heartbeat before `stale_before`.
    async fn claim_next(&self, now: Timestamp, stale_before: Timestamp) -> VitalsResult<Option<Job>>;

    /// Replace the stored job if its current status equals `expected`.
    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> VitalsResult<bool>;

    /// Flag a non-terminal job for cooperative cancellation.
    async fn request_cancel(&self, id: JobId) -> VitalsResult<bool>;

    /// Copy a terminal job into the history archive.
    async fn archive(&self, job: &Job, archived_at: Timestamp) -> VitalsResult<()>;

    /// Record a dead letter. Returns false if one already exists for the job.
    async fn dead_letter(&self, record: &DeadLetterRecord) -> VitalsResult<bool>;

    async fn list_dead_letters(&self, limit: usize) -> VitalsResult<Vec<DeadLetterRecord>>;

    /// Remove terminal jobs completed before `cutoff` from the live table.
    async fn purge_terminal_before(&self, cutoff: Timestamp) -> VitalsResult<u64>;
}

#[derive(Debug, Default)]
struct JobTables {
    live: HashMap<JobId, Job>,
    history: Vec<(Job, Timestamp)>,
    dead_letters: Vec<DeadLetterRecord>,
}

/// In-memory job store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    tables: Arc<RwLock<JobTables>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history(&self) -> Vec<(Job, Timestamp)> {
        self.tables.read().await.history.clone()
    }

    pub async fn live_count(&self) -> usize {
        self.tables.read().await.live.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> VitalsResult<()> {
        self.tables.write().await.live.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> VitalsResult<Option<Job>> {
        Ok(self.tables.read().await.live.get(&id).cloned())
    }

    async fn find_live(&self, params: &QueryParams, kind: JobKind) -> VitalsResult<Option<Job>> {
        let wanted = params.canonical();
        let tables = self.tables.read().await;
        Ok(tables
            .live
            .values()
            .filter(|j| j.kind == kind && j.status != JobStatus::Failed && j.params == wanted)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn claim_next(&self, now: Timestamp, stale_before: Timestamp) -> VitalsResult<Option<Job>> {
        let mut tables = self.tables.write().await;
        let next_id = tables
            .live
            .values()
            .filter(|j| {
                (j.status == JobStatus::Queued && j.next_attempt_at <= now)
                    || j.lease_expired(stale_before)
            })
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next_id else {
            return Ok(None);
        };
        let Some(job) = tables.live.get_mut(&id) else {
            return Ok(None);
        };
        if job.status == JobStatus::Processing {
            tracing::warn!(job_id = %job.id, heartbeat_at = ?job.heartbeat_at, "Reclaiming job with expired lease");
        }
        job.status = JobStatus::Processing;
        job.started_at.get_or_insert(now);
        job.heartbeat_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> VitalsResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.live.get_mut(&job.id) {
            Some(current) if current.status == expected => {
                // A cancel request may land while the worker holds the job.
                let cancel_requested = current.cancel_requested || job.cancel_requested;
                *current = job.clone();
                current.cancel_requested = cancel_requested;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, id: JobId) -> VitalsResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.live.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archive(&self, job: &Job, archived_at: Timestamp) -> VitalsResult<()> {
        self.tables
            .write()
            .await
            .history
            .push((job.clone(), archived_at));
        Ok(())
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> VitalsResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.dead_letters.iter().any(|r| r.job_id == record.job_id) {
            return Ok(false);
        }
        tables.dead_letters.push(record.clone());
        Ok(true)
    }

    async fn list_dead_letters(&self, limit: usize) -> VitalsResult<Vec<DeadLetterRecord>> {
        let tables = self.tables.read().await;
        let mut records = tables.dead_letters.clone();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> VitalsResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.live.len();
        tables.live.retain(|_, j| {
            !(j.status.is_terminal() && j.completed_at.map_or(false, |t| t < cutoff))
        });
        Ok((before - tables.live.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vitals_core::{Fingerprint, Resolution};

    fn job(points: &[&str]) -> Job {
        Job::new(
            JobKind::Query,
            QueryParams::new("S1", points.iter().map(|p| p.to_string()).collect(), 0, 1_000),
            Resolution::Raw,
            Fingerprint::from_bytes([7u8; 32]),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryJobStore::new();
        store.insert(&job(&["P1"])).await.expect("insert should succeed");

        let now = Utc::now();
        let first = store.claim_next(now, now - Duration::minutes(5)).await.expect("claim should succeed");
        let second = store.claim_next(now, now - Duration::minutes(5)).await.expect("claim should succeed");
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(first.map(|j| j.status), Some(JobStatus::Processing));
    }

    #[tokio::test]
    async fn test_claim_respects_backoff() {
        let store = InMemoryJobStore::new();
        let mut j = job(&["P1"]);
        j.next_attempt_at = Utc::now() + Duration::seconds(60);
        store.insert(&j).await.expect("insert should succeed");
        assert!(store
            .claim_next(Utc::now(), Utc::now() - Duration::minutes(5))
            .await
            .expect("claim should succeed")
            .is_none());
        assert!(store
            .claim_next(Utc::now() + Duration::seconds(61), Utc::now() - Duration::minutes(5))
            .await
            .expect("claim should succeed")
            .is_some());
    }

    #[tokio::test]
    async fn test_processing_job_is_reclaimed_after_lease() {
        let store = InMemoryJobStore::new();
        let j = job(&["P1"]);
        store.insert(&j).await.expect("insert should succeed");
        let claimed_at = Utc::now();
        let lease = Duration::minutes(5);
        let first = store
            .claim_next(claimed_at, claimed_at - lease)
            .await
            .expect("claim should succeed");
        assert_eq!(first.and_then(|j| j.heartbeat_at), Some(claimed_at));

        // Heartbeat still inside the lease.
        let soon = claimed_at + Duration::minutes(1);
        assert!(store
            .claim_next(soon, soon - lease)
            .await
            .expect("claim should succeed")
            .is_none());

        let later = claimed_at + Duration::minutes(6);
        let reclaimed = store
            .claim_next(later, later - lease)
            .await
            .expect("claim should succeed")
            .expect("stale job should be claimable");
        assert_eq!(reclaimed.id, j.id);
        assert_eq!(reclaimed.status, JobStatus::Processing);
        assert_eq!(reclaimed.started_at, Some(claimed_at));
        assert_eq!(reclaimed.heartbeat_at, Some(later));
    }

    #[tokio::test]
    async fn test_update_if_status_is_compare_and_swap() {
        let store = InMemoryJobStore::new();
        let j = job(&["P1"]);
        store.insert(&j).await.expect("insert should succeed");
        let mut claimed = store
            .claim_next(Utc::now(), Utc::now() - Duration::minutes(5))
            .await
            .expect("claim should succeed")
            .expect("job should be claimable");

        claimed.status = JobStatus::Completed;
        assert!(!store
            .update_if_status(&claimed, JobStatus::Queued)
            .await
            .expect("update should succeed"));
        assert!(store
            .update_if_status(&claimed, JobStatus::Processing)
            .await
            .expect("update should succeed"));
        let stored = store.get(j.id).await.expect("get should succeed");
        assert_eq!(stored.map(|j| j.status), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_flag_survives_worker_write() {
        let store = InMemoryJobStore::new();
        let j = job(&["P1"]);
        store.insert(&j).await.expect("insert should succeed");
        let claimed = store
            .claim_next(Utc::now(), Utc::now() - Duration::minutes(5))
            .await
            .expect("claim should succeed")
            .expect("job should be claimable");

        assert!(store.request_cancel(j.id).await.expect("cancel should succeed"));
        store
            .update_if_status(&claimed, JobStatus::Processing)
            .await
            .expect("update should succeed");
        let stored = store.get(j.id).await.expect("get should succeed");
        assert!(stored.map_or(false, |j| j.cancel_requested));
    }

    #[tokio::test]
    async fn test_find_live_ignores_point_order_and_failed_jobs() {
        let store = InMemoryJobStore::new();
        let j = job(&["P2", "P1"]);
        store.insert(&j).await.expect("insert should succeed");

        let params = QueryParams::new("S1", vec!["P1".into(), "P2".into()], 0, 1_000);
        let found = store
            .find_live(&params, JobKind::Query)
            .await
            .expect("find should succeed");
        assert_eq!(found.map(|f| f.id), Some(j.id));

        let mut failed = j.clone();
        failed.status = JobStatus::Failed;
        store.insert(&failed).await.expect("insert should succeed");
        assert!(store
            .find_live(&params, JobKind::Query)
            .await
            .expect("find should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_is_once_per_job() {
        let store = InMemoryJobStore::new();
        let j = job(&["P1"]);
        let record = DeadLetterRecord::from_job(&j, Utc::now());
        assert!(store.dead_letter(&record).await.expect("dead letter should succeed"));
        assert!(!store.dead_letter(&record).await.expect("dead letter should succeed"));
        assert_eq!(
            store
                .list_dead_letters(10)
                .await
                .expect("list should succeed")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut old_done = job(&["P1"]);
        old_done.status = JobStatus::Completed;
        old_done.completed_at = Some(now - Duration::days(8));
        let mut recent_done = job(&["P2"]);
        recent_done.status = JobStatus::CompletedWithErrors;
        recent_done.completed_at = Some(now - Duration::days(1));
        let queued = job(&["P3"]);

        for j in [&old_done, &recent_done, &queued] {
            store.insert(j).await.expect("insert should succeed");
        }
        let purged = store
            .purge_terminal_before(now - Duration::days(7))
            .await
            .expect("purge should succeed");
        assert_eq!(purged, 1);
        assert_eq!(store.live_count().await, 2);
    }
}
