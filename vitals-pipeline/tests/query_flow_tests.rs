//! Query service scenarios: routing, caching, partial failure and degradation.

mod support;

use support::*;
use tokio_util::sync::CancellationToken;
use vitals_core::{Tier, UpstreamError, VitalsError};
use vitals_pipeline::{QueryStatus, ResponseSource};
use vitals_test_utils::fixtures;

fn values(response: &vitals_pipeline::QueryResponse, point: &str) -> Vec<(i64, f64)> {
    response
        .series
        .iter()
        .find(|s| s.point == point)
        .map(|s| s.samples.iter().map(|x| (x.timestamp_ms, x.value)).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_fifty_hour_query_stitches_both_tiers() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Raw, "P1", &[(NOW - 49 * HOUR_MS, 1.0)]);
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - HOUR_MS, 2.0)]);
    // Raw data the raw plan never covers.
    h.mock.insert_series("S1", Tier::Raw, "P1", &[(NOW - 2 * HOUR_MS, 9.0)]);

    let response = h
        .service
        .query(&request(&["P1"], NOW - 50 * HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.status, QueryStatus::Complete);
    assert_eq!(
        values(&response, "P1"),
        vec![(NOW - 49 * HOUR_MS, 1.0), (NOW - HOUR_MS, 2.0)]
    );
    assert_eq!(h.mock.requests_for_tier(Tier::Raw), 1);
    assert_eq!(h.mock.requests_for_tier(Tier::Aggregated), 1);
    assert!(response.errors.is_empty());
    assert!(!response.degraded);
}

#[tokio::test]
async fn test_repeat_query_is_served_from_cache() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - 30 * MINUTE_MS, 4.0)]);
    let req = request(&["P1"], NOW - HOUR_MS, NOW);

    let first = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.source, ResponseSource::Direct);
    let calls = h.mock.calls();

    let second = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.series, first.series);
    assert_eq!(h.mock.calls(), calls);
}

#[tokio::test]
async fn test_point_order_does_not_change_cache_key() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Aggregated, "A", &[(NOW - MINUTE_MS, 1.0)]);
    h.mock.insert_series("S1", Tier::Aggregated, "B", &[(NOW - MINUTE_MS, 2.0)]);

    h.service
        .query(&request(&["A", "B"], NOW - HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap();
    let calls = h.mock.calls();
    let reordered = h
        .service
        .query(&request(&["B", "A"], NOW - HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reordered.source, ResponseSource::Cache);
    assert_eq!(h.mock.calls(), calls);
    let order: Vec<&str> = reordered.series.iter().map(|s| s.point.as_str()).collect();
    assert_eq!(order, vec!["B", "A"]);
}

#[tokio::test]
async fn test_expired_entry_is_fetched_again() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - 30 * MINUTE_MS, 4.0)]);
    let req = request(&["P1"], NOW - HOUR_MS, NOW);

    h.service.query(&req, &CancellationToken::new()).await.unwrap();
    let calls = h.mock.calls();

    h.clock.advance_ms(4 * MINUTE_MS);
    let warm = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(warm.source, ResponseSource::Cache);
    assert_eq!(h.mock.calls(), calls);

    h.clock.advance_ms(2 * MINUTE_MS);
    let cold = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(cold.source, ResponseSource::Direct);
    assert!(h.mock.calls() > calls);
}

#[tokio::test]
async fn test_raw_only_results_live_longer() {
    let h = Harness::new(fixtures::pipeline_config());
    let start = NOW - 72 * HOUR_MS;
    h.mock.insert_series("S1", Tier::Raw, "P1", &[(start + MINUTE_MS, 1.0)]);
    let req = request(&["P1"], start, start + HOUR_MS);

    h.service.query(&req, &CancellationToken::new()).await.unwrap();
    let calls = h.mock.calls();
    h.clock.advance_ms(30 * MINUTE_MS);
    let response = h.service.query(&req, &CancellationToken::new()).await.unwrap();

    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(h.mock.calls(), calls);
}

#[tokio::test]
async fn test_failed_tier_is_reported_and_healthy_segment_reused() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Raw, "P1", &[(NOW - 49 * HOUR_MS, 1.0)]);
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - HOUR_MS, 2.0)]);
    h.mock.fail_tier(
        Tier::Raw,
        UpstreamError::Transient { reason: "timeout".into(), attempts: 3 },
    );
    let req = request(&["P1"], NOW - 50 * HOUR_MS, NOW);

    let partial = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(partial.status, QueryStatus::Complete);
    assert!(partial.errors.contains_key("P1"));
    assert_eq!(values(&partial, "P1"), vec![(NOW - HOUR_MS, 2.0)]);

    h.mock.heal();
    let aggregated_calls = h.mock.requests_for_tier(Tier::Aggregated);
    let healed = h.service.query(&req, &CancellationToken::new()).await.unwrap();

    assert!(healed.errors.is_empty());
    assert_eq!(
        values(&healed, "P1"),
        vec![(NOW - 49 * HOUR_MS, 1.0), (NOW - HOUR_MS, 2.0)]
    );
    assert_eq!(h.mock.requests_for_tier(Tier::Aggregated), aggregated_calls);
}

#[tokio::test]
async fn test_total_failure_surfaces_upstream_error() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.fail_tier(
        Tier::Aggregated,
        UpstreamError::Rejected { status: 403, message: "forbidden".into() },
    );

    let err = h
        .service
        .query(&request(&["P1"], NOW - HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VitalsError::Upstream(UpstreamError::Rejected { status: 403, .. })
    ));
}

#[tokio::test]
async fn test_storage_outage_degrades_but_still_answers() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - MINUTE_MS, 3.0)]);
    h.store.set_fail_writes(true);

    let response = h
        .service
        .query(&request(&["P1"], NOW - HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.degraded);
    assert!(response.warnings.iter().any(|w| w.contains("storage write failed")));
    assert_eq!(values(&response, "P1"), vec![(NOW - MINUTE_MS, 3.0)]);
}

#[tokio::test]
async fn test_batched_path_keeps_healthy_points() {
    let config = fixtures::pipeline_config().with_thresholds(10, 100_000);
    let h = Harness::new(config);
    h.mock.insert_series("S1", Tier::Aggregated, "GOOD", &[(NOW - MINUTE_MS, 1.0)]);
    h.mock.fail_point(
        "BAD",
        UpstreamError::Rejected { status: 404, message: "unknown point".into() },
    );

    let response = h
        .service
        .query(&request(&["GOOD", "BAD"], NOW - HOUR_MS, NOW), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.source, ResponseSource::Batched);
    assert_eq!(values(&response, "GOOD"), vec![(NOW - MINUTE_MS, 1.0)]);
    assert!(values(&response, "BAD").is_empty());
    assert!(response.errors.contains_key("BAD"));
    assert!(!response.errors.contains_key("GOOD"));
}

#[tokio::test]
async fn test_invalid_range_is_rejected() {
    let h = Harness::new(fixtures::pipeline_config());
    let err = h
        .service
        .query(&request(&["P1"], NOW, NOW - HOUR_MS), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VitalsError::Validation(_)));
    assert_eq!(h.mock.calls(), 0);
}

#[tokio::test]
async fn test_unrepresentable_range_is_rejected_before_sizing() {
    let h = Harness::new(fixtures::pipeline_config());
    let err = h
        .service
        .query(&request(&["P1"], i64::MIN, i64::MAX), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VitalsError::Validation(_)));

    let backfill = h.service.backfill(params(&[], i64::MIN, NOW)).await;
    assert!(matches!(backfill, Err(VitalsError::Validation(_))));
    assert_eq!(h.mock.calls(), 0);
    assert_eq!(h.jobs.live_count().await, 0);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let h = Harness::new(fixtures::pipeline_config());
    h.mock.insert_series("S1", Tier::Aggregated, "P1", &[(NOW - MINUTE_MS, 1.0)]);
    let req = request(&["P1"], NOW - HOUR_MS, NOW);
    h.service.query(&req, &CancellationToken::new()).await.unwrap();

    let removed = h.service.invalidate("S1", Some("P")).await.unwrap();
    assert!(removed >= 1);
    let response = h.service.query(&req, &CancellationToken::new()).await.unwrap();
    assert_eq!(response.source, ResponseSource::Direct);
}
