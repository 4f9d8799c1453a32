//! Lazy, restartable page sequences.

use std::sync::Arc;

use futures_util::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use vitals_core::{RawSample, UpstreamError};

use crate::source::{Page, PageRequest, UpstreamSource};

/// A fetched page plus the cursor that resumes the sequence after it.
#[derive(Debug, Clone)]
pub struct PageItem {
    pub page: Page,
    /// Cursor for the page after this one; `None` on the last page.
    pub resume_cursor: Option<String>,
    /// 1-based position within this run of the sequence.
    pub index: u32,
    /// Set on the final item when the page cap cut the sequence short.
    pub truncated: bool,
}

/// Stream the pages of `request`, starting at `start_cursor`.
///
/// Pages are fetched one at a time as the consumer polls, so a dropped
/// stream stops issuing requests. The sequence ends when the upstream
/// reports no more pages, when `max_pages` have been produced (the last
/// item is then marked `truncated`) or on the first error. A cursor that
/// repeats the previous one is reported as a decode error rather than
/// looping forever. A page size the source had to shrink to is carried
/// into every later request of the run.
pub fn pages(
    source: Arc<dyn UpstreamSource>,
    mut request: PageRequest,
    start_cursor: Option<String>,
    max_pages: u32,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<PageItem, UpstreamError>> {
    async_stream::try_stream! {
        let mut cursor = start_cursor;
        let mut index = 0u32;
        loop {
            if cancel.is_cancelled() {
                Err(UpstreamError::Cancelled)?;
            }
            let page = source.fetch_page(&request, cursor.as_deref(), &cancel).await?;
            index += 1;
            if let Some(served) = page.page_size {
                let carried = request.page_size.map_or(served, |asked| asked.min(served));
                if request.page_size != Some(carried) {
                    tracing::debug!(site = %request.site, page_size = carried, "Keeping reduced page size");
                }
                request.page_size = Some(carried);
            }

            let next = if page.has_more { page.next_cursor.clone() } else { None };
            if let (Some(next), Some(current)) = (next.as_deref(), cursor.as_deref()) {
                if next == current {
                    Err(UpstreamError::Decode {
                        reason: format!("cursor {} did not advance", next),
                    })?;
                }
            }
            let truncated = next.is_some() && index >= max_pages;
            if truncated {
                tracing::warn!(
                    site = %request.site,
                    tier = %request.tier,
                    pages = index,
                    "Page cap reached, truncating sequence"
                );
            }
            let done = next.is_none() || truncated;
            yield PageItem {
                page,
                resume_cursor: next.clone(),
                index,
                truncated,
            };
            if done {
                break;
            }
            cursor = next;
        }
    }
    .boxed()
}

/// Drain a page sequence into one sample list.
///
/// Returns the samples and whether the page cap truncated the sequence.
pub async fn collect_pages(
    source: Arc<dyn UpstreamSource>,
    request: PageRequest,
    max_pages: u32,
    cancel: CancellationToken,
) -> Result<(Vec<RawSample>, bool), UpstreamError> {
    let mut stream = pages(source, request, None, max_pages, cancel);
    let mut samples = Vec::new();
    let mut truncated = false;
    while let Some(item) = stream.next().await {
        let item = item?;
        truncated |= item.truncated;
        samples.extend(item.page.samples);
    }
    Ok((samples, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use vitals_core::{ConfiguredPoint, Tier};

    /// Serves `total` pages of one sample each, cursor = next page number.
    struct Numbered {
        total: u32,
        stuck: bool,
        calls: AtomicU32,
        /// Page size reported for the page at this index, if any.
        shrink_at: Option<(u32, u32)>,
        asked: Mutex<Vec<Option<u32>>>,
    }

    #[async_trait]
    impl UpstreamSource for Numbered {
        async fn fetch_page(
            &self,
            request: &PageRequest,
            cursor: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<Page, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.asked.lock().unwrap().push(request.page_size);
            let n: u32 = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let has_more = n + 1 < self.total;
            let next = if self.stuck { n.max(1) } else { n + 1 };
            Ok(Page {
                samples: vec![RawSample::new("P1", i64::from(n), f64::from(n))],
                next_cursor: has_more.then(|| next.to_string()),
                has_more,
                page_size: self
                    .shrink_at
                    .filter(|(at, _)| *at == n)
                    .map(|(_, size)| size),
            })
        }

        async fn list_sites(&self, _cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError> {
            Ok(vec![])
        }

        async fn configured_points(
            &self,
            _site: &str,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ConfiguredPoint>, UpstreamError> {
            Ok(vec![])
        }
    }

    fn source(total: u32, stuck: bool) -> Arc<Numbered> {
        Arc::new(Numbered {
            total,
            stuck,
            calls: AtomicU32::new(0),
            shrink_at: None,
            asked: Mutex::new(Vec::new()),
        })
    }

    fn request() -> PageRequest {
        PageRequest::new("site", vec!["P1".into()], 0, 1_000, Tier::Raw)
    }

    #[tokio::test]
    async fn test_collects_every_page() {
        let src = source(4, false);
        let (samples, truncated) = collect_pages(src.clone(), request(), 100, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(samples.len(), 4);
        assert!(!truncated);
        assert_eq!(src.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_page_cap_truncates() {
        let src = source(10, false);
        let (samples, truncated) = collect_pages(src, request(), 3, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_restartable() {
        let src = source(5, false);
        let mut stream = pages(src.clone(), request(), None, 100, CancellationToken::new());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.resume_cursor.as_deref(), Some("1"));
        drop(stream);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);

        let resumed = pages(src.clone(), request(), first.resume_cursor, 100, CancellationToken::new());
        let rest: Vec<_> = resumed.collect().await;
        assert_eq!(rest.len(), 4);
        assert!(rest.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn test_reduced_page_size_sticks_for_the_rest_of_the_run() {
        let src = Arc::new(Numbered {
            total: 4,
            stuck: false,
            calls: AtomicU32::new(0),
            shrink_at: Some((1, 3_000)),
            asked: Mutex::new(Vec::new()),
        });
        let (samples, _) = collect_pages(src.clone(), request(), 100, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(
            src.asked.lock().unwrap().as_slice(),
            [None, None, Some(3_000), Some(3_000)]
        );
    }

    #[tokio::test]
    async fn test_non_advancing_cursor_is_decode_error() {
        let src = source(5, true);
        let result = collect_pages(src, request(), 100, CancellationToken::new()).await;
        assert!(matches!(result, Err(UpstreamError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let src = source(5, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = collect_pages(src.clone(), request(), 100, cancel).await;
        assert!(matches!(result, Err(UpstreamError::Cancelled)));
        assert_eq!(src.calls.load(Ordering::SeqCst), 0);
    }
}
