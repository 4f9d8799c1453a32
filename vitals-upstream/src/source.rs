//! The upstream seam: page requests, pages and the source trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vitals_core::{ConfiguredPoint, RawSample, Tier, UpstreamError};

/// One tier-specific page query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub site: String,
    /// Empty fetches every point of the site.
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub tier: Tier,
    /// Overrides the configured page size.
    pub page_size: Option<u32>,
}

impl PageRequest {
    pub fn new(site: impl Into<String>, points: Vec<String>, start_ms: i64, end_ms: i64, tier: Tier) -> Self {
        Self {
            site: site.into(),
            points,
            start_ms,
            end_ms,
            tier,
            page_size: None,
        }
    }
}

/// A page of raw samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub samples: Vec<RawSample>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    /// Page size the server actually answered, after any downsizing.
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl Page {
    pub fn last(samples: Vec<RawSample>) -> Self {
        Self {
            samples,
            next_cursor: None,
            has_more: false,
            page_size: None,
        }
    }
}

/// Anything that can serve pages of upstream samples.
///
/// Implementations own their retry policy: an `Err` returned from
/// `fetch_page` is final for that page.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Page, UpstreamError>;

    /// Sites known to the upstream API.
    async fn list_sites(&self, cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError>;

    /// Every point the upstream has configured for `site`, in listing order.
    async fn configured_points(
        &self,
        site: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConfiguredPoint>, UpstreamError>;
}
