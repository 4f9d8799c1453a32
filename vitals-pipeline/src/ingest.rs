//! Fetch a plan from upstream, normalize it and write it to storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{dedupe_last_write_wins, FetchPlan, RawSample, Sample, Tier, UpstreamError, VitalsResult};
use vitals_storage::{PointStore, SampleStore};
use vitals_upstream::{pages, PageRequest, UpstreamSource};

/// Counters for one ingest pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub pages: u32,
    pub fetched: u64,
    pub normalized: u64,
    /// Samples dropped for malformed timestamps, values or missing fields.
    pub dropped: u64,
    pub written: u64,
    /// The page cap cut the sequence short.
    pub truncated: bool,
}

impl IngestStats {
    pub fn merge(&mut self, other: &IngestStats) {
        self.pages += other.pages;
        self.fetched += other.fetched;
        self.normalized += other.normalized;
        self.dropped += other.dropped;
        self.written += other.written;
        self.truncated |= other.truncated;
    }
}

/// Normalize a page of raw samples, dropping and counting the bad ones.
pub fn normalize_page(site: &str, tier: Tier, raw: &[RawSample], stats: &mut IngestStats) -> Vec<Sample> {
    stats.fetched += raw.len() as u64;
    let mut out = Vec::with_capacity(raw.len());
    for sample in raw {
        match sample.normalize(site, tier) {
            Ok(s) => out.push(s),
            Err(e) => {
                stats.dropped += 1;
                tracing::debug!(site, tier = %tier, error = %e, "Dropped upstream sample");
            }
        }
    }
    stats.normalized += out.len() as u64;
    out
}

/// Per site, each point with its newest sample timestamp.
fn newest_per_point(samples: &[Sample]) -> BTreeMap<String, Vec<(String, i64)>> {
    let mut newest: BTreeMap<(&str, &str), i64> = BTreeMap::new();
    for s in samples {
        newest
            .entry((s.site.as_str(), s.point.as_str()))
            .and_modify(|ts| *ts = (*ts).max(s.timestamp_ms))
            .or_insert(s.timestamp_ms);
    }
    let mut by_site: BTreeMap<String, Vec<(String, i64)>> = BTreeMap::new();
    for ((site, point), ts) in newest {
        by_site
            .entry(site.to_string())
            .or_default()
            .push((point.to_string(), ts));
    }
    by_site
}

/// Upstream-to-storage plumbing shared by the dispatcher, the job worker
/// and continuous sync.
#[derive(Clone)]
pub struct Ingestor {
    upstream: Arc<dyn UpstreamSource>,
    samples: Arc<dyn SampleStore>,
    points: Option<Arc<dyn PointStore>>,
    max_pages: u32,
    upsert_batch_size: usize,
}

impl Ingestor {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        samples: Arc<dyn SampleStore>,
        max_pages: u32,
        upsert_batch_size: usize,
    ) -> Self {
        Self {
            upstream,
            samples,
            points: None,
            max_pages: max_pages.max(1),
            upsert_batch_size: upsert_batch_size.max(1),
        }
    }

    /// Register every point that comes through [`Self::persist`].
    pub fn with_points(mut self, points: Arc<dyn PointStore>) -> Self {
        self.points = Some(points);
        self
    }

    pub fn samples(&self) -> &Arc<dyn SampleStore> {
        &self.samples
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamSource> {
        &self.upstream
    }

    /// Fetch every page of `plan` for `points` and normalize the result.
    ///
    /// Samples the upstream returns outside the plan window are discarded.
    pub async fn fetch(
        &self,
        site: &str,
        points: &[String],
        plan: &FetchPlan,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Sample>, IngestStats), UpstreamError> {
        let request = PageRequest::new(site, points.to_vec(), plan.start_ms, plan.end_ms, plan.tier);
        let mut stream = pages(
            self.upstream.clone(),
            request,
            None,
            self.max_pages,
            cancel.clone(),
        );
        let mut stats = IngestStats::default();
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            let item = item?;
            stats.pages += 1;
            stats.truncated |= item.truncated;
            let normalized = normalize_page(site, plan.tier, &item.page.samples, &mut stats);
            out.extend(normalized.into_iter().filter(|s| plan.contains(s.timestamp_ms)));
        }
        if stats.dropped > 0 {
            tracing::warn!(
                site,
                tier = %plan.tier,
                dropped = stats.dropped,
                "Dropped malformed upstream samples"
            );
        }
        Ok((out, stats))
    }

    /// Upsert in batches after collapsing duplicate keys.
    ///
    /// Written points are then registered with the point store, if any. A
    /// registry failure is logged and does not fail the write.
    pub async fn persist(&self, samples: &[Sample]) -> VitalsResult<u64> {
        let deduped = dedupe_last_write_wins(samples.to_vec());
        let mut written = 0;
        for chunk in deduped.chunks(self.upsert_batch_size) {
            written += self.samples.upsert_samples(chunk).await?;
        }
        if let Some(points) = &self.points {
            for (site, seen) in newest_per_point(&deduped) {
                if let Err(e) = points.record_seen(&site, &seen).await {
                    tracing::warn!(site = %site, points = seen.len(), error = %e, "Failed to register ingested points");
                }
            }
        }
        Ok(written)
    }

    /// Fetch a plan and write it through to storage.
    pub async fn ingest(
        &self,
        site: &str,
        points: &[String],
        plan: &FetchPlan,
        cancel: &CancellationToken,
    ) -> VitalsResult<IngestStats> {
        let (samples, mut stats) = self.fetch(site, points, plan, cancel).await?;
        stats.written = self.persist(&samples).await?;
        tracing::debug!(
            site,
            tier = %plan.tier,
            written = stats.written,
            pages = stats.pages,
            "Ingested plan"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::{RawTime, RawValue};
    use vitals_storage::{InMemoryPointStore, InMemorySampleStore, SampleQuery};
    use vitals_test_utils::MockUpstream;

    fn ingestor(mock: &MockUpstream, store: &InMemorySampleStore) -> Ingestor {
        Ingestor::new(Arc::new(mock.clone()), Arc::new(store.clone()), 100, 2)
    }

    #[tokio::test]
    async fn test_ingest_writes_every_page() {
        let mock = MockUpstream::new().with_page_size(3);
        mock.generate_series("S1", Tier::Raw, "P1", 0, 1_000, 100, |ts| ts as f64);
        let store = InMemorySampleStore::new();

        let stats = ingestor(&mock, &store)
            .ingest("S1", &["P1".into()], &FetchPlan::new(0, 1_000, Tier::Raw), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.pages, 4);
        assert_eq!(stats.written, 10);
        assert_eq!(store.len().await, 10);
    }

    #[tokio::test]
    async fn test_malformed_samples_are_dropped_and_counted() {
        let mock = MockUpstream::new();
        mock.insert_series("S1", Tier::Raw, "P1", &[(100, 1.0)]);
        mock.push_raw(
            "S1",
            RawSample {
                name: Some("P1".into()),
                time: Some(RawTime::Text("yesterday-ish".into())),
                value: Some(RawValue::Number(1.0)),
                quality: None,
            },
        );
        let store = InMemorySampleStore::new();
        let stats = ingestor(&mock, &store)
            .ingest("S1", &["P1".into()], &FetchPlan::new(0, 1_000, Tier::Raw), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn test_persist_collapses_duplicates() {
        let mock = MockUpstream::new();
        let store = InMemorySampleStore::new();
        let sample = |v: f64| Sample {
            site: "S1".into(),
            point: "P1".into(),
            timestamp_ms: 5,
            value: v,
            quality: Default::default(),
            tier: Tier::Raw,
        };
        let written = ingestor(&mock, &store)
            .persist(&[sample(1.0), sample(2.0)])
            .await
            .unwrap();
        assert_eq!(written, 1);
        let stored = store
            .query_samples(&SampleQuery::new("S1", vec![], 0, 10))
            .await
            .unwrap();
        assert_eq!(stored[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_ingest_registers_seen_points() {
        let mock = MockUpstream::new();
        mock.insert_series("S1", Tier::Raw, "P1", &[(100, 1.0), (300, 2.0)]);
        mock.insert_series("S1", Tier::Raw, "P2", &[(200, 1.0)]);
        let store = InMemorySampleStore::new();
        let registry = InMemoryPointStore::new();
        ingestor(&mock, &store)
            .with_points(Arc::new(registry.clone()))
            .ingest("S1", &[], &FetchPlan::new(0, 1_000, Tier::Raw), &CancellationToken::new())
            .await
            .unwrap();

        let points = registry.list_points("S1").await.unwrap();
        let seen: Vec<(&str, Option<i64>)> = points
            .iter()
            .map(|p| (p.name.as_str(), p.last_sample_ms))
            .collect();
        assert_eq!(seen, vec![("P1", Some(300)), ("P2", Some(200))]);
        assert!(points.iter().all(|p| !p.configured));
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let mock = MockUpstream::new();
        mock.fail_next(1, UpstreamError::Rejected { status: 404, message: "gone".into() });
        let store = InMemorySampleStore::new();
        let err = ingestor(&mock, &store)
            .ingest("S1", &["P1".into()], &FetchPlan::new(0, 1_000, Tier::Raw), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, vitals_core::VitalsError::Upstream(UpstreamError::Rejected { .. })));
    }
}
