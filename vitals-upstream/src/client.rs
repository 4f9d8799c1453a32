//! HTTP client for the upstream metering API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{format_rfc3339, ConfigError, ConfiguredPoint, RawSample, UpstreamError};

use crate::config::UpstreamConfig;
use crate::retry::{downsize, RetryPolicy};
use crate::source::{Page, PageRequest, UpstreamSource};

const MAX_ERROR_BODY: usize = 512;
/// Listing page size for configured points.
const POINTS_PER_PAGE: usize = 1_000;

#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default, alias = "samples", alias = "data")]
    point_samples: Vec<RawSample>,
    #[serde(default, alias = "cursor")]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SitesResponse {
    #[serde(default)]
    sites: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ConfiguredPointsResponse {
    #[serde(default)]
    items: Vec<ConfiguredPointEntry>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct ConfiguredPointEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kv_tags: serde_json::Map<String, serde_json::Value>,
}

impl ConfiguredPointEntry {
    fn into_point(self) -> Option<ConfiguredPoint> {
        let name = self.name.filter(|n| !n.trim().is_empty())?;
        let unit = self
            .kv_tags
            .get("unit")
            .and_then(|u| u.as_str())
            .map(str::to_string);
        Some(ConfiguredPoint { name, unit })
    }
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    total_pages: Option<u32>,
}

/// Outcome of a single HTTP attempt.
enum Attempt<T> {
    Done(T),
    /// Retryable. `shrink` asks for a smaller page on the next attempt.
    Retry {
        error: UpstreamError,
        retry_after: Option<Duration>,
        shrink: bool,
    },
    Fail(UpstreamError),
}

/// Upstream client over reqwest.
///
/// Transient failures (timeouts, connection errors, 5xx, 429, undecodable
/// bodies) are retried with exponential backoff and jitter; a 429 honours
/// the server's `Retry-After`, capped at `max_backoff`. Any other 4xx surfaces immediately as
/// [`UpstreamError::Rejected`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base: Url,
    config: UpstreamConfig,
    policy: RetryPolicy,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let base = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            ConfigError::InvalidValue {
                field: "VITALS_UPSTREAM_URL".to_string(),
                value: config.base_url.clone(),
                reason: e.to_string(),
            }
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "http_client".to_string(),
                value: String::new(),
                reason: e.to_string(),
            })?;
        let policy = RetryPolicy::new(config.max_attempts, config.backoff_base, config.max_backoff);
        Ok(Self {
            client,
            base,
            config,
            policy,
        })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Rejected {
                status: 0,
                message: format!("base URL {} cannot carry a path", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Run `make` until it succeeds, fails permanently or attempts run out.
    ///
    /// `make` receives the number of shrink-worthy failures so far; the
    /// result carries the same count for the successful attempt.
    async fn execute<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut make: F,
    ) -> Result<(T, u32), UpstreamError>
    where
        T: DeserializeOwned,
        F: FnMut(u32) -> RequestBuilder,
    {
        let mut shrinks = 0u32;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = self.authorize(make(shrinks));
            match self.attempt::<T>(request, cancel).await {
                Attempt::Done(value) => return Ok((value, shrinks)),
                Attempt::Fail(error) => return Err(error),
                Attempt::Retry {
                    error,
                    retry_after,
                    shrink,
                } => {
                    if !self.policy.should_retry(attempt) {
                        tracing::warn!(op, attempts = attempt, error = %error, "Upstream retries exhausted");
                        return Err(match error {
                            UpstreamError::Transient { reason, .. } => UpstreamError::Transient {
                                reason,
                                attempts: attempt,
                            },
                            other => other,
                        });
                    }
                    let delay = self.policy.wait(attempt, retry_after);
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Upstream attempt failed, retrying"
                    );
                    if shrink {
                        shrinks += 1;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Attempt<T> {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Fail(UpstreamError::Cancelled),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Attempt::Fail(UpstreamError::Rejected {
                    status: 0,
                    message: e.to_string(),
                })
            }
            Err(e) => {
                return Attempt::Retry {
                    shrink: e.is_timeout(),
                    error: transient(if e.is_timeout() {
                        format!("request timed out: {}", e)
                    } else {
                        format!("request failed: {}", e)
                    }),
                    retry_after: None,
                }
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retry {
                retry_after: parse_retry_after(response.headers()),
                error: transient("rate limited (429)".to_string()),
                shrink: false,
            };
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Attempt::Retry {
                error: transient(format!("server error ({})", status.as_u16())),
                retry_after: None,
                shrink: true,
            };
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Attempt::Fail(UpstreamError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Fail(UpstreamError::Cancelled),
            body = response.bytes() => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                return Attempt::Retry {
                    error: transient(format!("reading body failed: {}", e)),
                    retry_after: None,
                    shrink: true,
                }
            }
        };
        match serde_json::from_slice::<T>(&body) {
            Ok(value) => Attempt::Done(value),
            Err(e) => Attempt::Retry {
                error: UpstreamError::Decode {
                    reason: e.to_string(),
                },
                retry_after: None,
                shrink: true,
            },
        }
    }
}

fn transient(reason: String) -> UpstreamError {
    UpstreamError::Transient {
        reason,
        attempts: 1,
    }
}

/// `Retry-After` in delta-seconds; HTTP-date values fall back to backoff.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Page, UpstreamError> {
        let url = self.url(&["sites", &request.site, "timeseries", "paginated"])?;
        let range_error = |ms: i64| UpstreamError::Rejected {
            status: 0,
            message: format!("timestamp {} out of range", ms),
        };
        let start = format_rfc3339(request.start_ms).ok_or_else(|| range_error(request.start_ms))?;
        let end = format_rfc3339(request.end_ms).ok_or_else(|| range_error(request.end_ms))?;
        let initial = request
            .page_size
            .unwrap_or(self.config.page_size)
            .min(self.config.max_page_size);
        let floor = self.config.min_page_size;
        let size_after = |shrinks: u32| (0..shrinks).fold(initial, |size, _| downsize(size, floor));

        let (response, shrinks): (PageResponse, u32) = self
            .execute("fetch_page", cancel, |shrinks| {
                let mut query: Vec<(&str, String)> = vec![
                    ("start_time", start.clone()),
                    ("end_time", end.clone()),
                    ("page_size", size_after(shrinks).to_string()),
                    ("raw_data", request.tier.is_raw().to_string()),
                ];
                if let Some(cursor) = cursor {
                    query.push(("cursor", cursor.to_string()));
                }
                if !request.points.is_empty() {
                    query.push(("point_names", request.points.join(",")));
                }
                self.client.get(url.clone()).query(&query)
            })
            .await?;

        let mut has_more = response
            .has_more
            .unwrap_or(response.next_cursor.is_some());
        if has_more && response.next_cursor.is_none() {
            tracing::warn!(site = %request.site, "Upstream reported more pages without a cursor");
            has_more = false;
        }
        tracing::debug!(
            site = %request.site,
            tier = %request.tier,
            samples = response.point_samples.len(),
            has_more,
            "Fetched upstream page"
        );
        Ok(Page {
            samples: response.point_samples,
            next_cursor: response.next_cursor,
            has_more,
            page_size: Some(size_after(shrinks)),
        })
    }

    async fn list_sites(&self, cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError> {
        let url = self.url(&["sites"])?;
        let (response, _): (SitesResponse, u32) = self
            .execute("list_sites", cancel, |_| self.client.get(url.clone()))
            .await?;
        Ok(response.sites.into_iter().map(|s| s.name).collect())
    }

    /// Walks `page`/`per_page` listing pages until a short or empty page, the
    /// reported last page, or the `max_pages` cap.
    async fn configured_points(
        &self,
        site: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConfiguredPoint>, UpstreamError> {
        let url = self.url(&["sites", site, "configured_points"])?;
        let mut points = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("page", page.to_string()),
                ("per_page", POINTS_PER_PAGE.to_string()),
            ];
            let (response, _): (ConfiguredPointsResponse, u32) = self
                .execute("configured_points", cancel, |_| {
                    self.client.get(url.clone()).query(&query)
                })
                .await?;
            let listed = response.items.len();
            points.extend(
                response
                    .items
                    .into_iter()
                    .filter_map(ConfiguredPointEntry::into_point),
            );
            let last_page = response
                .pagination
                .and_then(|p| p.total_pages)
                .is_some_and(|total| page >= total);
            if listed < POINTS_PER_PAGE || last_page {
                break;
            }
            if page >= self.config.max_pages {
                tracing::warn!(site, pages = page, "Configured point listing hit the page cap");
                break;
            }
            page += 1;
        }
        tracing::debug!(site, points = points.len(), pages = page, "Listed configured points");
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_page_response_aliases() {
        let parsed: PageResponse = serde_json::from_str(
            r#"{"samples": [{"name": "P1", "time": 1, "value": 2}], "cursor": "abc"}"#,
        )
        .unwrap();
        assert_eq!(parsed.point_samples.len(), 1);
        assert_eq!(parsed.next_cursor.as_deref(), Some("abc"));
        assert_eq!(parsed.has_more, None);
    }

    #[test]
    fn test_configured_point_entry_reads_unit_tag() {
        let parsed: ConfiguredPointsResponse = serde_json::from_str(
            r#"{"items": [
                {"name": "VAV-1/ZN-T", "kv_tags": {"unit": "degF", "floor": 2}},
                {"name": "VAV-1/DPR"},
                {"name": "  "},
                {"kv_tags": {"unit": "kW"}}
            ], "pagination": {"total_pages": 1}}"#,
        )
        .unwrap();
        let points: Vec<ConfiguredPoint> = parsed
            .items
            .into_iter()
            .filter_map(ConfiguredPointEntry::into_point)
            .collect();
        assert_eq!(
            points,
            vec![
                ConfiguredPoint::new("VAV-1/ZN-T").with_unit("degF"),
                ConfiguredPoint::new("VAV-1/DPR"),
            ]
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = UpstreamConfig {
            page_size: 0,
            ..UpstreamConfig::default()
        };
        assert!(HttpUpstream::new(config).is_err());
    }

    #[test]
    fn test_url_segments_are_escaped() {
        let client = HttpUpstream::new(UpstreamConfig::default().with_base_url("http://host/api/"))
            .expect("client should build");
        let url = client
            .url(&["sites", "ses/falls city", "timeseries", "paginated"])
            .expect("url should build");
        assert_eq!(
            url.as_str(),
            "http://host/api/sites/ses%2Ffalls%20city/timeseries/paginated"
        );
    }
}
