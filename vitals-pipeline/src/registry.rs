//! Point registry: seeding from the upstream configuration and coverage.
//!
//! Ingestion only learns about points that have data. Seeding registers the
//! full configured list up front, so coverage can report the configured
//! points a window has no samples for.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{CoverageReport, PointRecord, QueryParams, ValidationError, VitalsResult};
use vitals_storage::{PointStore, SampleStore};
use vitals_upstream::UpstreamSource;

/// Outcome of seeding one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub site: String,
    /// Points the upstream listed.
    pub listed: u64,
    /// Registry rows written.
    pub written: u64,
}

pub struct PointRegistry {
    upstream: Arc<dyn UpstreamSource>,
    points: Arc<dyn PointStore>,
    samples: Arc<dyn SampleStore>,
}

fn require_site(site: &str) -> Result<&str, ValidationError> {
    let site = site.trim();
    if site.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "site".to_string(),
        });
    }
    Ok(site)
}

impl PointRegistry {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        points: Arc<dyn PointStore>,
        samples: Arc<dyn SampleStore>,
    ) -> Self {
        Self {
            upstream,
            points,
            samples,
        }
    }

    /// Register every configured point of `site` from the upstream listing.
    ///
    /// Repeating a seed is harmless: it refreshes units and leaves ingest
    /// history alone.
    pub async fn seed(&self, site: &str, cancel: &CancellationToken) -> VitalsResult<SeedReport> {
        let site = require_site(site)?;
        let listed = self.upstream.configured_points(site, cancel).await?;
        if listed.is_empty() {
            tracing::warn!(site, "Upstream lists no configured points");
        }
        let written = self.points.upsert_configured(site, &listed).await?;
        tracing::info!(site, listed = listed.len(), written, "Seeded configured points");
        Ok(SeedReport {
            site: site.to_string(),
            listed: listed.len() as u64,
            written,
        })
    }

    pub async fn list(&self, site: &str) -> VitalsResult<Vec<PointRecord>> {
        let site = require_site(site)?;
        self.points.list_points(site).await
    }

    /// Configured points with and without samples in `[start_ms, end_ms)`.
    pub async fn coverage(&self, site: &str, start_ms: i64, end_ms: i64) -> VitalsResult<CoverageReport> {
        let params = QueryParams::new(site.trim(), Vec::new(), start_ms, end_ms);
        params.validate_range()?;

        let configured: BTreeSet<String> = self
            .points
            .list_points(&params.site)
            .await?
            .into_iter()
            .filter(|p| p.configured)
            .map(|p| p.name)
            .collect();
        let with_data: BTreeSet<String> = self
            .samples
            .points_with_data(&params.site, start_ms, end_ms)
            .await?
            .into_iter()
            .collect();
        let report = CoverageReport::compute(&params.site, start_ms, end_ms, &configured, &with_data);
        if configured.is_empty() {
            tracing::debug!(site = %params.site, "Coverage requested before seeding");
        }
        tracing::info!(
            site = %report.site,
            configured = report.configured,
            covered = report.covered,
            coverage_pct = report.coverage_pct,
            "Computed point coverage"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::{ConfiguredPoint, Quality, Sample, Tier, UpstreamError, VitalsError};
    use vitals_storage::{InMemoryPointStore, InMemorySampleStore};
    use vitals_test_utils::MockUpstream;

    fn registry(mock: &MockUpstream) -> (PointRegistry, InMemoryPointStore, InMemorySampleStore) {
        let points = InMemoryPointStore::new();
        let samples = InMemorySampleStore::new();
        let registry = PointRegistry::new(
            Arc::new(mock.clone()),
            Arc::new(points.clone()),
            Arc::new(samples.clone()),
        );
        (registry, points, samples)
    }

    fn sample(point: &str, ts: i64) -> Sample {
        Sample {
            site: "S1".into(),
            point: point.into(),
            timestamp_ms: ts,
            value: 1.0,
            quality: Quality::Good,
            tier: Tier::Raw,
        }
    }

    #[tokio::test]
    async fn test_seed_then_coverage_reports_missing_points() {
        let mock = MockUpstream::new();
        mock.set_configured_points(
            "S1",
            &[
                ConfiguredPoint::new("AHU-1").with_unit("degF"),
                ConfiguredPoint::new("AHU-2"),
                ConfiguredPoint::new("AHU-3"),
                ConfiguredPoint::new("AHU-4"),
            ],
        );
        let (registry, points, samples) = registry(&mock);

        let report = registry.seed("S1", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.listed, 4);
        assert_eq!(points.len().await, 4);

        samples
            .upsert_samples(&[sample("AHU-1", 100), sample("AHU-3", 900), sample("STRAY", 100)])
            .await
            .unwrap();
        let coverage = registry.coverage("S1", 0, 500).await.unwrap();
        assert_eq!(coverage.configured, 4);
        assert_eq!(coverage.covered, 1);
        assert_eq!(coverage.coverage_pct, 25.0);
        assert_eq!(coverage.missing, vec!["AHU-2", "AHU-3", "AHU-4"]);
        assert_eq!(coverage.unconfigured, vec!["STRAY"]);
    }

    #[tokio::test]
    async fn test_seed_failure_surfaces_upstream_error() {
        let mock = MockUpstream::new();
        mock.fail_next(1, UpstreamError::Rejected { status: 404, message: "no site".into() });
        let (registry, points, _) = registry(&mock);
        let err = registry.seed("S1", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VitalsError::Upstream(UpstreamError::Rejected { status: 404, .. })));
        assert!(points.is_empty().await);
    }

    #[tokio::test]
    async fn test_coverage_validates_site_and_range() {
        let (registry, _, _) = registry(&MockUpstream::new());
        assert!(matches!(
            registry.coverage(" ", 0, 10).await,
            Err(VitalsError::Validation(_))
        ));
        assert!(matches!(
            registry.coverage("S1", 10, 0).await,
            Err(VitalsError::Validation(_))
        ));
        assert!(matches!(
            registry.seed("", &CancellationToken::new()).await,
            Err(VitalsError::Validation(_))
        ));
    }
}
