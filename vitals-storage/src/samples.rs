//! Time-series sample storage.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use vitals_core::{
    dedupe_last_write_wins, Quality, Sample, StorageError, Tier, VitalsResult,
};

/// Selection for a sample read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQuery {
    pub site: String,
    /// Empty selects every point of the site.
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub tier: Option<Tier>,
}

impl SampleQuery {
    pub fn new(site: impl Into<String>, points: Vec<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            site: site.into(),
            points,
            start_ms,
            end_ms,
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }
}

/// Durable, idempotent time-series store keyed by `(site, point, timestamp_ms, tier)`.
///
/// Writes are upserts: a repeated key replaces the stored value and quality
/// (last-write-wins). Implementations must deduplicate within a batch before
/// writing so that the last occurrence of a key is the one persisted.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Upsert samples, returning the number of distinct rows written.
    async fn upsert_samples(&self, samples: &[Sample]) -> VitalsResult<u64>;

    /// Samples in `[start_ms, end_ms)` ordered by `(point, timestamp_ms, tier)`.
    async fn query_samples(&self, query: &SampleQuery) -> VitalsResult<Vec<Sample>>;

    /// Sites with at least one stored sample.
    async fn list_sites(&self) -> VitalsResult<Vec<String>>;

    /// Distinct points of `site` with a sample in `[start_ms, end_ms)`, sorted.
    async fn points_with_data(&self, site: &str, start_ms: i64, end_ms: i64) -> VitalsResult<Vec<String>>;

    async fn health_check(&self) -> VitalsResult<()>;
}

type StoredKey = (String, String, i64, Tier);

/// In-memory sample store for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemorySampleStore {
    rows: Arc<RwLock<BTreeMap<StoredKey, (f64, Quality)>>>,
    fail_writes: Arc<std::sync::atomic::AtomicBool>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Make every subsequent write fail with `WriteFailed` (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn upsert_samples(&self, samples: &[Sample]) -> VitalsResult<u64> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::WriteFailed {
                reason: "injected write failure".to_string(),
            }
            .into());
        }
        let batch = dedupe_last_write_wins(samples.to_vec());
        let mut rows = self.rows.write().await;
        for sample in &batch {
            rows.insert(sample.key(), (sample.value, sample.quality));
        }
        Ok(batch.len() as u64)
    }

    async fn query_samples(&self, query: &SampleQuery) -> VitalsResult<Vec<Sample>> {
        let points: BTreeSet<&str> = query.points.iter().map(String::as_str).collect();
        let rows = self.rows.read().await;
        let out = rows
            .iter()
            .filter(|((site, point, ts, tier), _)| {
                site == &query.site
                    && (points.is_empty() || points.contains(point.as_str()))
                    && *ts >= query.start_ms
                    && *ts < query.end_ms
                    && query.tier.map_or(true, |t| t == *tier)
            })
            .map(|((site, point, ts, tier), (value, quality))| Sample {
                site: site.clone(),
                point: point.clone(),
                timestamp_ms: *ts,
                value: *value,
                quality: *quality,
                tier: *tier,
            })
            .collect();
        Ok(out)
    }

    async fn list_sites(&self) -> VitalsResult<Vec<String>> {
        let rows = self.rows.read().await;
        let sites: BTreeSet<String> = rows.keys().map(|(site, ..)| site.clone()).collect();
        Ok(sites.into_iter().collect())
    }

    async fn points_with_data(&self, site: &str, start_ms: i64, end_ms: i64) -> VitalsResult<Vec<String>> {
        let rows = self.rows.read().await;
        let points: BTreeSet<String> = rows
            .keys()
            .filter(|(s, _, ts, _)| s == site && *ts >= start_ms && *ts < end_ms)
            .map(|(_, point, ..)| point.clone())
            .collect();
        Ok(points.into_iter().collect())
    }

    async fn health_check(&self) -> VitalsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vitals_core::RawSample;

    fn sample(point: &str, ts: i64, value: f64, tier: Tier) -> Sample {
        Sample {
            site: "S1".to_string(),
            point: point.to_string(),
            timestamp_ms: ts,
            value,
            quality: Quality::Good,
            tier,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_last_write_wins() {
        let store = InMemorySampleStore::new();
        store
            .upsert_samples(&[sample("P1", 1_000, 1.0, Tier::Raw)])
            .await
            .expect("first upsert should succeed");
        store
            .upsert_samples(&[sample("P1", 1_000, 2.0, Tier::Raw)])
            .await
            .expect("second upsert should succeed");

        let rows = store
            .query_samples(&SampleQuery::new("S1", vec!["P1".into()], 0, 2_000))
            .await
            .expect("query should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_same_timestamp_different_tier_is_distinct() {
        let store = InMemorySampleStore::new();
        let written = store
            .upsert_samples(&[
                sample("P1", 1_000, 1.0, Tier::Raw),
                sample("P1", 1_000, 1.5, Tier::Aggregated),
            ])
            .await
            .expect("upsert should succeed");
        assert_eq!(written, 2);

        let raw_only = store
            .query_samples(&SampleQuery::new("S1", vec![], 0, 2_000).with_tier(Tier::Raw))
            .await
            .expect("query should succeed");
        assert_eq!(raw_only.len(), 1);
        assert_eq!(raw_only[0].tier, Tier::Raw);
    }

    #[tokio::test]
    async fn test_duplicate_keys_within_batch_keep_last() {
        let store = InMemorySampleStore::new();
        let written = store
            .upsert_samples(&[
                sample("P1", 5, 1.0, Tier::Raw),
                sample("P1", 5, 3.0, Tier::Raw),
            ])
            .await
            .expect("upsert should succeed");
        assert_eq!(written, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_range_is_half_open() {
        let store = InMemorySampleStore::new();
        store
            .upsert_samples(&[
                sample("P1", 10, 1.0, Tier::Raw),
                sample("P1", 20, 2.0, Tier::Raw),
            ])
            .await
            .expect("upsert should succeed");
        let rows = store
            .query_samples(&SampleQuery::new("S1", vec![], 10, 20))
            .await
            .expect("query should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp_ms, 10);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemorySampleStore::new();
        store.set_fail_writes(true);
        let err = store
            .upsert_samples(&[sample("P1", 1, 1.0, Tier::Raw)])
            .await
            .expect_err("write should fail");
        assert!(err.is_storage_write_failure());
    }

    #[tokio::test]
    async fn test_list_sites() {
        let store = InMemorySampleStore::new();
        let mut other = sample("P1", 1, 1.0, Tier::Raw);
        other.site = "S2".to_string();
        store
            .upsert_samples(&[sample("P1", 1, 1.0, Tier::Raw), other])
            .await
            .expect("upsert should succeed");
        assert_eq!(
            store.list_sites().await.expect("list should succeed"),
            vec!["S1".to_string(), "S2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_points_with_data_respects_window() {
        let store = InMemorySampleStore::new();
        store
            .upsert_samples(&[
                sample("B", 10, 1.0, Tier::Raw),
                sample("A", 15, 1.0, Tier::Aggregated),
                sample("A", 16, 1.0, Tier::Raw),
                sample("C", 30, 1.0, Tier::Raw),
            ])
            .await
            .expect("upsert should succeed");
        assert_eq!(
            store.points_with_data("S1", 10, 30).await.expect("scan should succeed"),
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(store
            .points_with_data("S2", 0, 100)
            .await
            .expect("scan should succeed")
            .is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Normalized timestamps survive a store round trip bit-for-bit.
        #[test]
        fn prop_timestamp_round_trip_through_store(
            secs in 0i64..4_000_000_000i64,
            nanos in 0u32..1_000_000_000u32,
        ) {
            let text = chrono::DateTime::from_timestamp(secs, nanos)
                .unwrap()
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
            let normalized = RawSample::new("P1", text.as_str(), 1.0)
                .normalize("S1", Tier::Raw)
                .unwrap();
            let expected = normalized.timestamp_ms;

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let stored = rt.block_on(async {
                let store = InMemorySampleStore::new();
                store.upsert_samples(&[normalized]).await.unwrap();
                store
                    .query_samples(&SampleQuery::new("S1", vec![], i64::MIN, i64::MAX))
                    .await
                    .unwrap()
            });
            prop_assert_eq!(stored.len(), 1);
            prop_assert_eq!(stored[0].timestamp_ms, expected);
        }
    }
}
