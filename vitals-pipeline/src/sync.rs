//! Continuous sync: pull the recent window of every known site into storage.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{Clock, PipelineConfig, QueryParams, VitalsResult};

use crate::ingest::{IngestStats, Ingestor};
use crate::router::TierRouter;

/// Outcome of one pass over every site.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub sites: usize,
    pub synced: usize,
    pub failed: Vec<(String, String)>,
    pub stats: IngestStats,
}

pub struct ContinuousSync {
    ingestor: Ingestor,
    router: TierRouter,
    clock: Arc<dyn Clock>,
}

impl ContinuousSync {
    pub fn new(ingestor: Ingestor, clock: Arc<dyn Clock>, config: &PipelineConfig) -> Self {
        Self {
            ingestor,
            router: TierRouter::from_config(config),
            clock,
        }
    }

    /// Sites known upstream or already present in storage. Either side may
    /// be unavailable; the other still counts.
    pub async fn known_sites(&self, cancel: &CancellationToken) -> Vec<String> {
        let mut sites = BTreeSet::new();
        match self.ingestor.upstream().list_sites(cancel).await {
            Ok(list) => sites.extend(list),
            Err(e) => tracing::warn!(error = %e, "Upstream site listing failed"),
        }
        match self.ingestor.samples().list_sites().await {
            Ok(list) => sites.extend(list),
            Err(e) => tracing::warn!(error = %e, "Storage site listing failed"),
        }
        sites.into_iter().filter(|s| !s.trim().is_empty()).collect()
    }

    /// Ingest `[now - window_ms, now)` for every point of `site`.
    pub async fn sync_site(
        &self,
        site: &str,
        window_ms: i64,
        cancel: &CancellationToken,
    ) -> VitalsResult<IngestStats> {
        let now = self.clock.now_ms();
        let params = QueryParams::new(site, Vec::new(), now - window_ms.max(1), now);
        let plans = self.router.route(&params, now)?;
        let mut stats = IngestStats::default();
        for plan in &plans {
            let pass = self.ingestor.ingest(site, &[], plan, cancel).await?;
            stats.merge(&pass);
        }
        Ok(stats)
    }

    pub async fn sync_all(&self, window_ms: i64, cancel: &CancellationToken) -> SyncReport {
        let sites = self.known_sites(cancel).await;
        let mut report = SyncReport {
            sites: sites.len(),
            ..SyncReport::default()
        };
        for site in sites {
            if cancel.is_cancelled() {
                break;
            }
            match self.sync_site(&site, window_ms, cancel).await {
                Ok(stats) => {
                    report.synced += 1;
                    report.stats.merge(&stats);
                }
                Err(e) => {
                    tracing::warn!(site = %site, error = %e, "Site sync failed");
                    report.failed.push((site, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::{Tier, UpstreamError};
    use vitals_storage::InMemorySampleStore;
    use vitals_test_utils::{fixtures, MockUpstream};

    fn sync(mock: &MockUpstream, store: &InMemorySampleStore) -> ContinuousSync {
        let ingestor = Ingestor::new(Arc::new(mock.clone()), Arc::new(store.clone()), 100, 500);
        ContinuousSync::new(ingestor, Arc::new(fixtures::clock()), &fixtures::pipeline_config())
    }

    #[tokio::test]
    async fn test_sync_pulls_recent_window_for_every_site() {
        let now = fixtures::FIXED_NOW_MS;
        let mock = MockUpstream::new();
        mock.insert_series("S1", Tier::Raw, "P1", &[(now - 10 * fixtures::MINUTE_MS, 1.0)]);
        mock.insert_series("S2", Tier::Raw, "P9", &[(now - 5 * fixtures::MINUTE_MS, 2.0)]);
        // Outside the window.
        mock.insert_series("S2", Tier::Raw, "P9", &[(now - 3 * fixtures::HOUR_MS, 3.0)]);
        let store = InMemorySampleStore::new();

        let report = sync(&mock, &store).sync_all(fixtures::HOUR_MS, &CancellationToken::new()).await;
        assert_eq!(report.sites, 2);
        assert_eq!(report.synced, 2);
        assert!(report.failed.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_one_failing_site_does_not_stop_the_rest() {
        let now = fixtures::FIXED_NOW_MS;
        let mock = MockUpstream::new();
        mock.insert_series("S1", Tier::Raw, "P1", &[(now - fixtures::MINUTE_MS, 1.0)]);
        mock.insert_series("S2", Tier::Raw, "P2", &[(now - fixtures::MINUTE_MS, 1.0)]);
        // Sites sync in name order, so S1 takes the failure.
        mock.fail_next(1, UpstreamError::Rejected { status: 500, message: "boom".into() });
        let store = InMemorySampleStore::new();

        let report = sync(&mock, &store).sync_all(fixtures::HOUR_MS, &CancellationToken::new()).await;
        assert_eq!(report.sites, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "S1");
        assert_eq!(store.len().await, 1);
    }
}
