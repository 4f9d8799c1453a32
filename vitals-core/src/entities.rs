//! Pipeline entities: samples, fetch plans, jobs and cache entries.

use crate::enums::{CacheSource, JobKind, JobStatus, Quality, Resolution, Tier};
use crate::error::{IngestError, ValidationError};
use crate::fingerprint::Fingerprint;
use crate::timestamp::{normalize, RawTime, MAX_TIMESTAMP_MS, MIN_TIMESTAMP_MS};
use crate::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// SAMPLES
// ============================================================================

/// A normalized time-series sample.
///
/// `(site, point, timestamp_ms, tier)` is the natural key. A second write with
/// the same key supersedes the first (last-write-wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub site: String,
    pub point: String,
    pub timestamp_ms: i64,
    pub value: f64,
    pub quality: Quality,
    pub tier: Tier,
}

/// Natural key of a sample.
pub type SampleKey = (String, String, i64, Tier);

impl Sample {
    pub fn key(&self) -> SampleKey {
        (
            self.site.clone(),
            self.point.clone(),
            self.timestamp_ms,
            self.tier,
        )
    }
}

/// Sample value as it appears on the wire: numbers or numeric strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

/// A sample as returned by the upstream API, before normalization.
///
/// Field names vary between upstream deployments, hence the aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(alias = "point", alias = "point_name")]
    pub name: Option<String>,
    #[serde(alias = "timestamp", alias = "ts")]
    pub time: Option<RawTime>,
    pub value: Option<RawValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl RawSample {
    pub fn new(name: impl Into<String>, time: impl Into<RawTime>, value: f64) -> Self {
        Self {
            name: Some(name.into()),
            time: Some(time.into()),
            value: Some(RawValue::Number(value)),
            quality: None,
        }
    }

    /// Normalize into a `Sample` for `site` on `tier`.
    ///
    /// Non-finite values, including the strings `"nan"` and `"inf"`, are rejected.
    pub fn normalize(&self, site: &str, tier: Tier) -> Result<Sample, IngestError> {
        let point = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(IngestError::MissingField { field: "name" })?;
        let time = self
            .time
            .as_ref()
            .ok_or(IngestError::MissingField { field: "time" })?;
        let timestamp_ms = normalize(time)?;

        let value = match &self.value {
            None => return Err(IngestError::MissingField { field: "value" }),
            Some(RawValue::Number(v)) => *v,
            Some(RawValue::Text(s)) => s.trim().parse::<f64>().map_err(|_| {
                IngestError::InvalidValue {
                    point: point.to_string(),
                    reason: format!("not numeric: {:?}", s),
                }
            })?,
        };
        if !value.is_finite() {
            return Err(IngestError::InvalidValue {
                point: point.to_string(),
                reason: "non-finite value".to_string(),
            });
        }

        Ok(Sample {
            site: site.to_string(),
            point: point.to_string(),
            timestamp_ms,
            value,
            quality: Quality::from_upstream(self.quality.as_deref()),
            tier,
        })
    }
}

/// Collapse duplicate keys so only the last occurrence of each survives.
///
/// Order of first appearance is preserved. This is the explicit
/// last-write-wins policy applied before any storage write.
pub fn dedupe_last_write_wins(samples: Vec<Sample>) -> Vec<Sample> {
    use std::collections::HashMap;

    let mut index: HashMap<SampleKey, usize> = HashMap::with_capacity(samples.len());
    let mut out: Vec<Sample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match index.get(&sample.key()) {
            Some(&i) => out[i] = sample,
            None => {
                index.insert(sample.key(), out.len());
                out.push(sample);
            }
        }
    }
    out
}

// ============================================================================
// FETCH PLANS
// ============================================================================

/// One tier-specific sub-range of a query, half-open `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPlan {
    pub start_ms: i64,
    pub end_ms: i64,
    pub tier: Tier,
}

impl FetchPlan {
    pub fn new(start_ms: i64, end_ms: i64, tier: Tier) -> Self {
        Self {
            start_ms,
            end_ms,
            tier,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }
}

// ============================================================================
// QUERY PARAMETERS
// ============================================================================

/// Parameters shared by queries and jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub site: String,
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl QueryParams {
    pub fn new(site: impl Into<String>, points: Vec<String>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            site: site.into(),
            points,
            start_ms,
            end_ms,
        }
    }

    /// Sorted, deduplicated points. Two requests differing only in point
    /// order describe the same data.
    pub fn canonical_points(&self) -> Vec<String> {
        self.points
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Copy with canonical point ordering.
    pub fn canonical(&self) -> Self {
        Self {
            site: self.site.trim().to_string(),
            points: self.canonical_points(),
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }

    /// Validate a query: site, at least one point, non-empty range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_range()?;
        if self.canonical_points().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "points".to_string(),
            });
        }
        Ok(())
    }

    /// Validate site and range only. Backfills may omit points.
    pub fn validate_range(&self) -> Result<(), ValidationError> {
        if self.site.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "site".to_string(),
            });
        }
        for (field, value) in [("startMs", self.start_ms), ("endMs", self.end_ms)] {
            if !(MIN_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&value) {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: format!(
                        "{} is outside {}..={}",
                        value, MIN_TIMESTAMP_MS, MAX_TIMESTAMP_MS
                    ),
                });
            }
        }
        if self.start_ms >= self.end_ms {
            return Err(ValidationError::InvalidRange {
                start_ms: self.start_ms,
                end_ms: self.end_ms,
            });
        }
        Ok(())
    }
}

// ============================================================================
// JOBS
// ============================================================================

/// Persisted resumption cursor: indices of completed work units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCursor {
    pub completed_units: BTreeSet<usize>,
    /// Units that failed permanently (e.g. upstream rejected them).
    #[serde(default)]
    pub rejected_units: BTreeSet<usize>,
    pub total_units: usize,
    #[serde(default)]
    pub samples_written: u64,
}

impl JobCursor {
    pub fn new(total_units: usize) -> Self {
        Self {
            total_units,
            ..Self::default()
        }
    }

    /// Units neither completed nor permanently rejected, in order.
    pub fn pending_units(&self) -> Vec<usize> {
        (0..self.total_units)
            .filter(|i| !self.completed_units.contains(i) && !self.rejected_units.contains(i))
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.pending_units().is_empty()
    }
}

/// A large request processed asynchronously by the job worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub params: QueryParams,
    pub resolution: Resolution,
    pub status: JobStatus,
    pub cache_key: Fingerprint,
    pub sample_count: u64,
    pub error: Option<String>,
    pub retry_count: u32,
    pub cancel_requested: bool,
    /// Plans frozen at first claim so a resumed job sees the same units.
    pub plans: Option<Vec<FetchPlan>>,
    pub cursor: Option<JobCursor>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub next_attempt_at: Timestamp,
    /// Last write by the worker holding the job. A `processing` job whose
    /// heartbeat is older than the claim lease can be claimed again.
    #[serde(default)]
    pub heartbeat_at: Option<Timestamp>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        params: QueryParams,
        resolution: Resolution,
        cache_key: Fingerprint,
        now: Timestamp,
    ) -> Self {
        Self {
            id: crate::new_job_id(),
            kind,
            params: params.canonical(),
            resolution,
            status: JobStatus::Queued,
            cache_key,
            sample_count: 0,
            error: None,
            retry_count: 0,
            cancel_requested: false,
            plans: None,
            cursor: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            next_attempt_at: now,
            heartbeat_at: None,
        }
    }

    /// A `processing` job whose holder stopped writing before `stale_before`.
    pub fn lease_expired(&self, stale_before: Timestamp) -> bool {
        self.status == JobStatus::Processing
            && self
                .heartbeat_at
                .or(self.started_at)
                .map_or(true, |beat| beat < stale_before)
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), crate::JobError> {
        if !self.status.can_transition_to(next) {
            return Err(crate::JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// A job that exhausted its retries, kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub job_id: JobId,
    pub params: QueryParams,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: Timestamp,
}

impl DeadLetterRecord {
    pub fn from_job(job: &Job, failed_at: Timestamp) -> Self {
        Self {
            job_id: job.id,
            params: job.params.clone(),
            error: job.error.clone().unwrap_or_default(),
            retry_count: job.retry_count,
            failed_at,
        }
    }
}

// ============================================================================
// CACHE ENTRIES
// ============================================================================

/// A cached query payload. Always replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub site: String,
    /// Sorted points covered by the payload, for prefix invalidation.
    pub points: Vec<String>,
    pub payload: Vec<u8>,
    pub created_at_ms: i64,
    pub ttl_ms: i64,
    pub source: CacheSource,
}

impl CacheEntry {
    pub fn expires_at_ms(&self) -> i64 {
        self.created_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms()
    }

    /// Whether an invalidation scoped to `point_prefix` covers this entry.
    pub fn covers_point_prefix(&self, point_prefix: Option<&str>) -> bool {
        match point_prefix {
            None | Some("") => true,
            Some(prefix) => self.points.iter().any(|p| p.starts_with(prefix)),
        }
    }
}

// ============================================================================
// POINT REGISTRY
// ============================================================================

/// A point as the upstream lists it in a site's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredPoint {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
}

impl ConfiguredPoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// A registered point of a site.
///
/// A point enters the registry either by seeding from the upstream
/// configuration (`configured`) or by showing up in ingested data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointRecord {
    pub site: String,
    pub name: String,
    pub unit: Option<String>,
    pub configured: bool,
    /// Newest sample timestamp ingested for the point.
    pub last_sample_ms: Option<i64>,
}

/// How many configured points have data in a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub site: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub configured: u64,
    pub covered: u64,
    /// `covered / configured` as a percentage, 0 with nothing configured.
    pub coverage_pct: f64,
    /// Configured points without a sample in the window, sorted.
    pub missing: Vec<String>,
    /// Points with data that the configuration does not list, sorted.
    pub unconfigured: Vec<String>,
}

impl CoverageReport {
    pub fn compute(
        site: &str,
        start_ms: i64,
        end_ms: i64,
        configured: &BTreeSet<String>,
        with_data: &BTreeSet<String>,
    ) -> Self {
        let covered = configured.intersection(with_data).count() as u64;
        let coverage_pct = if configured.is_empty() {
            0.0
        } else {
            covered as f64 * 100.0 / configured.len() as f64
        };
        Self {
            site: site.to_string(),
            start_ms,
            end_ms,
            configured: configured.len() as u64,
            covered,
            coverage_pct,
            missing: configured.difference(with_data).cloned().collect(),
            unconfigured: with_data.difference(configured).cloned().collect(),
        }
    }
}
