//! Upstream source decorator that records request metrics.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vitals_core::{ConfiguredPoint, UpstreamError};
use vitals_upstream::{Page, PageRequest, UpstreamSource};

use super::metrics::metrics;

fn outcome<T>(result: &Result<T, UpstreamError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(UpstreamError::Rejected { .. }) => "rejected",
        Err(UpstreamError::Transient { .. }) => "transient",
        Err(UpstreamError::Decode { .. }) => "decode",
        Err(UpstreamError::Cancelled) => "cancelled",
    }
}

/// Wraps any [`UpstreamSource`] and counts every call by outcome.
pub struct MeteredUpstream {
    inner: Arc<dyn UpstreamSource>,
}

impl MeteredUpstream {
    pub fn new(inner: Arc<dyn UpstreamSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl UpstreamSource for MeteredUpstream {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Page, UpstreamError> {
        let start = Instant::now();
        let result = self.inner.fetch_page(request, cursor, cancel).await;
        if let Some(m) = metrics() {
            m.record_upstream_request(
                "page",
                request.tier.as_db_str(),
                outcome(&result),
                start.elapsed().as_secs_f64(),
            );
        }
        result
    }

    async fn list_sites(&self, cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError> {
        let start = Instant::now();
        let result = self.inner.list_sites(cancel).await;
        if let Some(m) = metrics() {
            m.record_upstream_request("sites", "none", outcome(&result), start.elapsed().as_secs_f64());
        }
        result
    }

    async fn configured_points(
        &self,
        site: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConfiguredPoint>, UpstreamError> {
        let start = Instant::now();
        let result = self.inner.configured_points(site, cancel).await;
        if let Some(m) = metrics() {
            m.record_upstream_request("points", "none", outcome(&result), start.elapsed().as_secs_f64());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::Tier;
    use vitals_test_utils::MockUpstream;

    fn count(tier: &str, outcome: &str) -> f64 {
        metrics()
            .unwrap()
            .upstream_requests_total
            .with_label_values(&["page", tier, outcome])
            .get()
    }

    #[tokio::test]
    async fn test_records_outcomes_and_passes_results_through() {
        let mock = MockUpstream::new();
        mock.insert_series("S1", Tier::Raw, "P1", &[(1_000, 1.0)]);
        let metered = MeteredUpstream::new(Arc::new(mock.clone()));
        let request = PageRequest::new("S1", vec!["P1".into()], 0, 2_000, Tier::Raw);
        let cancel = CancellationToken::new();

        let ok_before = count("raw", "ok");
        let page = metered.fetch_page(&request, None, &cancel).await.unwrap();
        assert_eq!(page.samples.len(), 1);
        assert_eq!(count("raw", "ok") - ok_before, 1.0);

        mock.fail_next(1, UpstreamError::Rejected { status: 404, message: "gone".into() });
        let rejected_before = count("raw", "rejected");
        assert!(metered.fetch_page(&request, None, &cancel).await.is_err());
        assert_eq!(count("raw", "rejected") - rejected_before, 1.0);
        assert_eq!(mock.calls(), 2);
    }
}
