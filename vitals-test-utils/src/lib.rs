//! VITALS Test Utilities
//!
//! Shared test infrastructure for the VITALS workspace:
//! - A scripted in-memory upstream (`MockUpstream`)
//! - A manually driven clock
//! - Proptest generators for the pipeline types
//! - Fixtures and assertions for common scenarios

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use vitals_core::{
    Clock, ConfiguredPoint, FetchPlan, PipelineConfig, Quality, QueryParams, RawSample, Resolution, Sample, Tier,
    UpstreamError,
};
pub use vitals_upstream::{Page, PageRequest, UpstreamSource};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MANUAL CLOCK
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as i64);
    }

    pub fn advance_ms(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// ============================================================================
// MOCK UPSTREAM
// ============================================================================

/// A recorded `fetch_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub site: String,
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub tier: Tier,
    pub cursor: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    /// (site, tier, point) -> timestamp -> value
    series: BTreeMap<(String, Tier, String), BTreeMap<i64, f64>>,
    extra_sites: Vec<String>,
    /// Failures served before any data, in order.
    scripted: VecDeque<UpstreamError>,
    /// Points whose every request fails with the given error.
    failing_points: HashMap<String, UpstreamError>,
    /// Tiers whose every request fails with the given error.
    failing_tiers: HashMap<Tier, UpstreamError>,
    /// Raw samples appended verbatim to the first page of a site.
    raw_extras: HashMap<String, Vec<RawSample>>,
    /// Configuration listing per site.
    configured: HashMap<String, Vec<ConfiguredPoint>>,
    requests: Vec<RecordedRequest>,
}

/// In-memory upstream serving canned series with cursor pagination.
///
/// Cursors are plain offsets into the filtered, time-ordered result set, so
/// any cursor handed out stays valid across calls.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    state: Arc<Mutex<MockState>>,
    calls: Arc<AtomicU32>,
    page_size: u32,
    latency: Duration,
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            calls: Arc::new(AtomicU32::new(0)),
            page_size: 100,
            latency: Duration::ZERO,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay every response, so cancellation and budgets can be exercised.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add explicit `(timestamp_ms, value)` samples for one point and tier.
    pub fn insert_series(&self, site: &str, tier: Tier, point: &str, samples: &[(i64, f64)]) {
        let mut state = lock(&self.state);
        let series = state
            .series
            .entry((site.to_string(), tier, point.to_string()))
            .or_default();
        for &(ts, value) in samples {
            series.insert(ts, value);
        }
    }

    /// Fill `[start_ms, end_ms)` at `interval_ms` with `value_fn(ts)`.
    pub fn generate_series(
        &self,
        site: &str,
        tier: Tier,
        point: &str,
        start_ms: i64,
        end_ms: i64,
        interval_ms: i64,
        value_fn: impl Fn(i64) -> f64,
    ) {
        let samples: Vec<(i64, f64)> = (0..)
            .map(|i| start_ms + i * interval_ms)
            .take_while(|ts| *ts < end_ms)
            .map(|ts| (ts, value_fn(ts)))
            .collect();
        self.insert_series(site, tier, point, &samples);
    }

    /// Serve `raw` on the first page of every request for `site`, before
    /// any canned data. Used to feed malformed samples through ingest.
    pub fn push_raw(&self, site: &str, raw: RawSample) {
        lock(&self.state)
            .raw_extras
            .entry(site.to_string())
            .or_default()
            .push(raw);
    }

    /// Points the upstream lists as configured for `site`.
    pub fn set_configured_points(&self, site: &str, points: &[ConfiguredPoint]) {
        lock(&self.state)
            .configured
            .insert(site.to_string(), points.to_vec());
    }

    /// A site the upstream lists without having data.
    pub fn add_site(&self, site: &str) {
        lock(&self.state).extra_sites.push(site.to_string());
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_next(&self, times: usize, error: UpstreamError) {
        let mut state = lock(&self.state);
        for _ in 0..times {
            state.scripted.push_back(error.clone());
        }
    }

    /// Fail every request that includes `point`.
    pub fn fail_point(&self, point: &str, error: UpstreamError) {
        lock(&self.state)
            .failing_points
            .insert(point.to_string(), error);
    }

    pub fn fail_tier(&self, tier: Tier, error: UpstreamError) {
        lock(&self.state).failing_tiers.insert(tier, error);
    }

    /// Remove all scripted and standing failures.
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.scripted.clear();
        state.failing_points.clear();
        state.failing_tiers.clear();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn requests_for_tier(&self, tier: Tier) -> usize {
        lock(&self.state)
            .requests
            .iter()
            .filter(|r| r.tier == tier)
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
        lock(&self.state).requests.clear();
    }

    fn serve(&self, request: &PageRequest, cursor: Option<&str>) -> Result<Page, UpstreamError> {
        let mut state = lock(&self.state);
        state.requests.push(RecordedRequest {
            site: request.site.clone(),
            points: request.points.clone(),
            start_ms: request.start_ms,
            end_ms: request.end_ms,
            tier: request.tier,
            cursor: cursor.map(str::to_string),
        });

        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.failing_tiers.get(&request.tier) {
            return Err(error.clone());
        }
        if let Some(error) = request
            .points
            .iter()
            .find_map(|p| state.failing_points.get(p))
        {
            return Err(error.clone());
        }

        let offset: usize = match cursor {
            None => 0,
            Some(c) => c.parse().map_err(|_| UpstreamError::Rejected {
                status: 400,
                message: format!("bad cursor {}", c),
            })?,
        };

        let mut rows: Vec<RawSample> = if offset == 0 {
            state
                .raw_extras
                .get(&request.site)
                .cloned()
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut matched: Vec<(i64, &str, f64)> = state
            .series
            .iter()
            .filter(|((site, tier, point), _)| {
                site == &request.site
                    && *tier == request.tier
                    && (request.points.is_empty() || request.points.contains(point))
            })
            .flat_map(|((_, _, point), series)| {
                series
                    .range(request.start_ms..request.end_ms.max(request.start_ms))
                    .map(move |(ts, v)| (*ts, point.as_str(), *v))
            })
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let page_size = request.page_size.unwrap_or(self.page_size).max(1) as usize;
        let end = (offset + page_size).min(matched.len());
        let start = offset.min(end);
        rows.extend(
            matched[start..end]
                .iter()
                .map(|(ts, point, value)| RawSample::new(*point, *ts, *value)),
        );
        let has_more = end < matched.len();

        Ok(Page {
            samples: rows,
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
            page_size: Some(page_size as u32),
        })
    }
}

#[async_trait]
impl UpstreamSource for MockUpstream {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Page, UpstreamError> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }
        self.serve(request, cursor)
    }

    async fn list_sites(&self, _cancel: &CancellationToken) -> Result<Vec<String>, UpstreamError> {
        let state = lock(&self.state);
        let mut sites: Vec<String> = state
            .series
            .keys()
            .map(|(site, _, _)| site.clone())
            .chain(state.extra_sites.iter().cloned())
            .collect();
        sites.sort();
        sites.dedup();
        Ok(sites)
    }

    async fn configured_points(
        &self,
        site: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConfiguredPoint>, UpstreamError> {
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }
        let mut state = lock(&self.state);
        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        Ok(state.configured.get(site).cloned().unwrap_or_default())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pipeline types.

    use super::*;
    use proptest::prelude::*;

    /// Milliseconds between 2020-01-01 and 2030-01-01.
    pub fn arb_epoch_ms() -> impl Strategy<Value = i64> {
        1_577_836_800_000i64..1_893_456_000_000i64
    }

    pub fn arb_tier() -> impl Strategy<Value = Tier> {
        prop_oneof![Just(Tier::Raw), Just(Tier::Aggregated)]
    }

    pub fn arb_quality() -> impl Strategy<Value = Quality> {
        prop_oneof![
            Just(Quality::Good),
            Just(Quality::Uncertain),
            Just(Quality::Bad),
        ]
    }

    pub fn arb_resolution() -> impl Strategy<Value = Resolution> {
        prop_oneof![
            Just(Resolution::Raw),
            Just(Resolution::OneMinute),
            Just(Resolution::FiveMinutes),
            Just(Resolution::FifteenMinutes),
            Just(Resolution::OneHour),
            Just(Resolution::OneDay),
        ]
    }

    pub fn arb_point_name() -> impl Strategy<Value = String> {
        "[A-Z]{2,4}-[0-9]{1,3}"
    }

    pub fn arb_sample() -> impl Strategy<Value = Sample> {
        (
            arb_point_name(),
            arb_epoch_ms(),
            -1.0e6f64..1.0e6f64,
            arb_quality(),
            arb_tier(),
        )
            .prop_map(|(point, timestamp_ms, value, quality, tier)| Sample {
                site: "SITE-1".to_string(),
                point,
                timestamp_ms,
                value,
                quality,
                tier,
            })
    }

    /// Valid query parameters: non-empty points, `start_ms < end_ms`.
    pub fn arb_query_params() -> impl Strategy<Value = QueryParams> {
        (
            "[a-z]{3,8}",
            prop::collection::vec(arb_point_name(), 1..6),
            arb_epoch_ms(),
            1i64..(30 * 24 * 3_600_000),
        )
            .prop_map(|(site, points, start_ms, span)| {
                QueryParams::new(site, points, start_ms, start_ms + span)
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Canned values for scenario tests.

    use super::*;

    pub const HOUR_MS: i64 = 3_600_000;
    pub const MINUTE_MS: i64 = 60_000;

    /// 2024-06-01T00:00:00Z, aligned to every boundary granularity.
    pub const FIXED_NOW_MS: i64 = 1_717_200_000_000;

    pub fn clock() -> ManualClock {
        ManualClock::new(FIXED_NOW_MS)
    }

    /// Defaults with millisecond job backoff so retries can be driven by
    /// advancing a manual clock.
    pub fn pipeline_config() -> PipelineConfig {
        PipelineConfig::default().with_retry_base_ms(10)
    }

    pub fn params(site: &str, points: &[&str], start_ms: i64, end_ms: i64) -> QueryParams {
        QueryParams::new(
            site,
            points.iter().map(|p| p.to_string()).collect(),
            start_ms,
            end_ms,
        )
    }

    pub fn sample(point: &str, timestamp_ms: i64, value: f64, tier: Tier) -> Sample {
        Sample {
            site: "S1".to_string(),
            point: point.to_string(),
            timestamp_ms,
            value,
            quality: Quality::Good,
            tier,
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over stitched series.

    use super::*;

    /// Assert that timestamps are strictly ascending (no duplicates).
    #[track_caller]
    pub fn assert_strictly_ascending(samples: &[Sample]) {
        for pair in samples.windows(2) {
            assert!(
                pair[0].timestamp_ms < pair[1].timestamp_ms,
                "timestamps not strictly ascending: {} then {} ({})",
                pair[0].timestamp_ms,
                pair[1].timestamp_ms,
                pair[1].point
            );
        }
    }

    /// Assert every sample falls inside the plan's window and tier.
    #[track_caller]
    pub fn assert_within_plan(samples: &[Sample], plan: &FetchPlan) {
        for sample in samples.iter().filter(|s| s.tier == plan.tier) {
            assert!(
                plan.contains(sample.timestamp_ms),
                "{} sample at {} outside [{}, {})",
                plan.tier,
                sample.timestamp_ms,
                plan.start_ms,
                plan.end_ms
            );
        }
    }
}
