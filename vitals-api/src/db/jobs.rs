//! PostgreSQL job store.
//!
//! The job itself is stored as JSONB; `status`, `cancel_requested` and the
//! timestamps are mirrored into columns so claims and compare-and-swap
//! updates never need to parse the body. The columns win when the two
//! disagree.

use async_trait::async_trait;
use tokio_postgres::Row;
use vitals_core::{
    DeadLetterRecord, Job, JobId, JobKind, JobStatus, QueryParams, Timestamp, VitalsResult,
};
use vitals_storage::JobStore;

use super::{corrupt_row, read_error, write_error, DbClient};

const JOB_COLUMNS: &str = "body, status, cancel_requested, started_at, heartbeat_at";

const TERMINAL: &str = "('completed', 'completed_with_errors', 'failed')";

/// Lookup key for identical canonical parameters.
fn params_key(params: &QueryParams) -> VitalsResult<String> {
    serde_json::to_string(&params.canonical()).map_err(|e| corrupt_row("job params", e))
}

fn job_body(job: &Job) -> VitalsResult<serde_json::Value> {
    serde_json::to_value(job).map_err(|e| corrupt_row("job", e))
}

fn row_to_job(row: &Row) -> VitalsResult<Job> {
    let body: serde_json::Value = row.get(0);
    let status: String = row.get(1);
    let mut job: Job = serde_json::from_value(body).map_err(|e| corrupt_row("job", e))?;
    job.status = JobStatus::from_db_str(&status).map_err(|e| corrupt_row("job", e))?;
    job.cancel_requested = row.get(2);
    job.started_at = row.get(3);
    job.heartbeat_at = row.get(4);
    Ok(job)
}

#[derive(Clone)]
pub struct PgJobStore {
    db: DbClient,
}

impl PgJobStore {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> VitalsResult<()> {
        let conn = self.db.get_conn().await?;
        conn.execute(
            "INSERT INTO vitals_jobs \
             (id, kind, params_key, status, cancel_requested, body, created_at, started_at, completed_at, next_attempt_at, heartbeat_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &job.id,
                &job.kind.as_db_str(),
                &params_key(&job.params)?,
                &job.status.as_db_str(),
                &job.cancel_requested,
                &job_body(job)?,
                &job.created_at,
                &job.started_at,
                &job.completed_at,
                &job.next_attempt_at,
                &job.heartbeat_at,
            ],
        )
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> VitalsResult<Option<Job>> {
        let conn = self.db.get_conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM vitals_jobs WHERE id = $1", JOB_COLUMNS),
                &[&id],
            )
            .await
            .map_err(read_error)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_live(&self, params: &QueryParams, kind: JobKind) -> VitalsResult<Option<Job>> {
        let conn = self.db.get_conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM vitals_jobs \
                     WHERE kind = $1 AND params_key = $2 AND status <> 'failed' \
                     ORDER BY created_at DESC LIMIT 1",
                    JOB_COLUMNS
                ),
                &[&kind.as_db_str(), &params_key(params)?],
            )
            .await
            .map_err(read_error)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn claim_next(&self, now: Timestamp, stale_before: Timestamp) -> VitalsResult<Option<Job>> {
        let conn = self.db.get_conn().await?;
        let row = conn
            .query_opt(
                "WITH next AS ( \
                     SELECT id, status AS prior_status FROM vitals_jobs \
                     WHERE (status = 'queued' AND next_attempt_at <= $1) \
                        OR (status = 'processing' AND COALESCE(heartbeat_at, started_at, created_at) < $2) \
                     ORDER BY created_at, id \
                     LIMIT 1 \
                     FOR UPDATE SKIP LOCKED \
                 ) \
                 UPDATE vitals_jobs j \
                 SET status = 'processing', started_at = COALESCE(j.started_at, $1), heartbeat_at = $1 \
                 FROM next WHERE j.id = next.id \
                 RETURNING j.body, j.status, j.cancel_requested, j.started_at, j.heartbeat_at, next.prior_status",
                &[&now, &stale_before],
            )
            .await
            .map_err(write_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = row_to_job(&row)?;
        let prior_status: String = row.get(5);
        if prior_status == JobStatus::Processing.as_db_str() {
            tracing::warn!(job_id = %job.id, "Reclaiming job with expired lease");
        }
        Ok(Some(job))
    }

    async fn update_if_status(&self, job: &Job, expected: JobStatus) -> VitalsResult<bool> {
        let conn = self.db.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE vitals_jobs SET \
                     status = $2, \
                     cancel_requested = cancel_requested OR $3, \
                     body = $4, \
                     started_at = $5, \
                     completed_at = $6, \
                     next_attempt_at = $7, \
                     heartbeat_at = $9 \
                 WHERE id = $1 AND status = $8",
                &[
                    &job.id,
                    &job.status.as_db_str(),
                    &job.cancel_requested,
                    &job_body(job)?,
                    &job.started_at,
                    &job.completed_at,
                    &job.next_attempt_at,
                    &expected.as_db_str(),
                    &job.heartbeat_at,
                ],
            )
            .await
            .map_err(write_error)?;
        Ok(updated == 1)
    }

    async fn request_cancel(&self, id: JobId) -> VitalsResult<bool> {
        let conn = self.db.get_conn().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE vitals_jobs SET cancel_requested = TRUE \
                     WHERE id = $1 AND status NOT IN {}",
                    TERMINAL
                ),
                &[&id],
            )
            .await
            .map_err(write_error)?;
        Ok(updated == 1)
    }

    async fn archive(&self, job: &Job, archived_at: Timestamp) -> VitalsResult<()> {
        let conn = self.db.get_conn().await?;
        conn.execute(
            "INSERT INTO vitals_job_history (job_id, status, body, archived_at) \
             VALUES ($1, $2, $3, $4)",
            &[&job.id, &job.status.as_db_str(), &job_body(job)?, &archived_at],
        )
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> VitalsResult<bool> {
        let conn = self.db.get_conn().await?;
        let params =
            serde_json::to_value(&record.params).map_err(|e| corrupt_row("dead letter", e))?;
        let retry_count = i32::try_from(record.retry_count).unwrap_or(i32::MAX);
        let inserted = conn
            .execute(
                "INSERT INTO vitals_dead_letters (job_id, params, error, retry_count, failed_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id) DO NOTHING",
                &[&record.job_id, &params, &record.error, &retry_count, &record.failed_at],
            )
            .await
            .map_err(write_error)?;
        Ok(inserted == 1)
    }

    async fn list_dead_letters(&self, limit: usize) -> VitalsResult<Vec<DeadLetterRecord>> {
        let conn = self.db.get_conn().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(
                "SELECT job_id, params, error, retry_count, failed_at FROM vitals_dead_letters \
                 ORDER BY failed_at DESC LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(read_error)?;

        rows.iter()
            .map(|row| {
                let params: serde_json::Value = row.get(1);
                let retry_count: i32 = row.get(3);
                Ok(DeadLetterRecord {
                    job_id: row.get(0),
                    params: serde_json::from_value(params)
                        .map_err(|e| corrupt_row("dead letter", e))?,
                    error: row.get(2),
                    retry_count: u32::try_from(retry_count).unwrap_or(0),
                    failed_at: row.get(4),
                })
            })
            .collect()
    }

    async fn purge_terminal_before(&self, cutoff: Timestamp) -> VitalsResult<u64> {
        let conn = self.db.get_conn().await?;
        conn.execute(
            &format!(
                "DELETE FROM vitals_jobs WHERE status IN {} AND completed_at < $1",
                TERMINAL
            ),
            &[&cutoff],
        )
        .await
        .map_err(write_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_key_ignores_point_order() {
        let a = QueryParams::new("S1", vec!["B".into(), "A".into()], 0, 10);
        let b = QueryParams::new("S1", vec!["A".into(), "B".into(), "A".into()], 0, 10);
        assert_eq!(params_key(&a).unwrap(), params_key(&b).unwrap());

        let other_range = QueryParams::new("S1", vec!["A".into(), "B".into()], 0, 11);
        assert_ne!(params_key(&a).unwrap(), params_key(&other_range).unwrap());
    }
}
