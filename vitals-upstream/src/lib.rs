//! Vitals Upstream
//!
//! Client for the upstream metering API: cursor-paginated, tier-specific
//! time-series pages over HTTP, with retries, adaptive page sizing and
//! cooperative cancellation.

pub mod client;
pub mod config;
pub mod pagination;
pub mod retry;
pub mod source;

pub use client::HttpUpstream;
pub use config::{UpstreamConfig, UPSTREAM_PAGE_CEILING};
pub use pagination::{collect_pages, pages, PageItem};
pub use retry::{downsize, jittered, RetryPolicy};
pub use source::{Page, PageRequest, UpstreamSource};

pub use tokio_util::sync::CancellationToken;
