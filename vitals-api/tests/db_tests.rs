//! PostgreSQL store tests. Require a reachable database configured through
//! the `VITALS_DB_*` variables.

#![cfg(feature = "db-tests")]

use chrono::Utc;
use uuid::Uuid;
use vitals_api::{ApiResult, DbClient, DbConfig, PgJobStore, PgSampleStore};
use vitals_core::{Fingerprint, Job, JobKind, JobStatus, QueryParams, Resolution, Tier};
use vitals_storage::{JobStore, SampleQuery, SampleStore};
use vitals_test_utils::fixtures::{self, HOUR_MS};

async fn test_db() -> ApiResult<DbClient> {
    let db = DbClient::from_config(&DbConfig::from_env())?;
    db.migrate().await?;
    Ok(db)
}

fn unique_site() -> String {
    format!("test-{}", Uuid::now_v7())
}

#[tokio::test]
async fn test_upsert_is_idempotent_and_last_write_wins() -> ApiResult<()> {
    let store = PgSampleStore::new(test_db().await?, 2);
    let site = unique_site();
    let mut first = fixtures::sample("P1", 1_000, 1.0, Tier::Raw);
    first.site = site.clone();
    let mut second = first.clone();
    second.value = 2.0;
    let mut other = fixtures::sample("P2", 2_000, 5.0, Tier::Aggregated);
    other.site = site.clone();

    store.upsert_samples(&[first.clone(), other.clone()]).await?;
    store.upsert_samples(&[second, other]).await?;

    let rows = store
        .query_samples(&SampleQuery::new(site.clone(), Vec::new(), 0, HOUR_MS))
        .await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].point, "P1");
    assert_eq!(rows[0].value, 2.0);

    let sites = store.list_sites().await?;
    assert!(sites.contains(&site));
    Ok(())
}

#[tokio::test]
async fn test_claim_cancel_and_compare_and_swap() -> ApiResult<()> {
    let jobs = PgJobStore::new(test_db().await?);
    let params = QueryParams::new(unique_site(), vec!["P1".into()], 0, HOUR_MS);
    let job = Job::new(
        JobKind::Backfill,
        params.clone(),
        Resolution::Raw,
        Fingerprint::from_bytes([9u8; 32]),
        Utc::now(),
    );
    jobs.insert(&job).await?;

    let live = jobs.find_live(&params, JobKind::Backfill).await?;
    assert_eq!(live.map(|j| j.id), Some(job.id));

    assert!(jobs.request_cancel(job.id).await?);
    let stored = jobs.get(job.id).await?.expect("job should exist");
    assert!(stored.cancel_requested);

    let mut stale = stored.clone();
    stale.status = JobStatus::Failed;
    stale.completed_at = Some(Utc::now());
    assert!(!jobs.update_if_status(&stale, JobStatus::Processing).await?);
    assert!(jobs.update_if_status(&stale, JobStatus::Queued).await?);
    assert!(!jobs.request_cancel(job.id).await?);
    Ok(())
}
