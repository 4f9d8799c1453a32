//! Tagged enums shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its string representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

fn normalize_token(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

// ============================================================================
// TIER
// ============================================================================

/// Upstream data granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// High precision, available only after the processing lag.
    Raw,
    /// Coarse, available immediately.
    Aggregated,
}

impl Tier {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Aggregated => "aggregated",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match normalize_token(s).as_str() {
            "raw" => Ok(Tier::Raw),
            "aggregated" | "agg" => Ok(Tier::Aggregated),
            _ => Err(EnumParseError {
                kind: "tier",
                value: s.to_string(),
            }),
        }
    }

    /// Value of the upstream `raw_data` selector.
    pub fn is_raw(&self) -> bool {
        matches!(self, Tier::Raw)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for Tier {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// QUALITY
// ============================================================================

/// Sensor reading quality flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match normalize_token(s).as_str() {
            "good" | "ok" => Ok(Quality::Good),
            "uncertain" => Ok(Quality::Uncertain),
            "bad" => Ok(Quality::Bad),
            _ => Err(EnumParseError {
                kind: "quality",
                value: s.to_string(),
            }),
        }
    }

    /// Lenient mapping for upstream flags: absent is good, unknown is uncertain.
    pub fn from_upstream(flag: Option<&str>) -> Self {
        match flag {
            None => Quality::Good,
            Some(s) => Self::from_db_str(s).unwrap_or(Quality::Uncertain),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for Quality {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Requested sample resolution for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Raw => "raw",
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::FifteenMinutes => "15m",
            Resolution::OneHour => "1h",
            Resolution::OneDay => "1d",
        }
    }

    /// Bucket width in milliseconds, `None` for native upstream spacing.
    pub fn bucket_ms(&self) -> Option<i64> {
        match self {
            Resolution::Raw => None,
            Resolution::OneMinute => Some(60_000),
            Resolution::FiveMinutes => Some(300_000),
            Resolution::FifteenMinutes => Some(900_000),
            Resolution::OneHour => Some(3_600_000),
            Resolution::OneDay => Some(86_400_000),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "raw" | "" => Ok(Resolution::Raw),
            "1m" | "1min" => Ok(Resolution::OneMinute),
            "5m" | "5min" => Ok(Resolution::FiveMinutes),
            "15m" | "15min" => Ok(Resolution::FifteenMinutes),
            "1h" | "hour" => Ok(Resolution::OneHour),
            "1d" | "day" => Ok(Resolution::OneDay),
            _ => Err(EnumParseError {
                kind: "resolution",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// JOB STATUS
// ============================================================================

/// Job lifecycle state.
///
/// `queued -> processing -> {completed | completed_with_errors | failed}`, with
/// `processing -> queued` for retries and budget checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match normalize_token(s).as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(EnumParseError {
                kind: "job status",
                value: s.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    /// Terminal states whose samples are usable by readers.
    pub fn has_data(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::CompletedWithErrors)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Queued)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::CompletedWithErrors)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for JobStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// JOB KIND / CACHE SOURCE
// ============================================================================

/// Why a job exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Oversized query offloaded by the dispatcher.
    #[default]
    Query,
    /// Historical backfill requested by an operator.
    Backfill,
}

impl JobKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobKind::Query => "query",
            JobKind::Backfill => "backfill",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match normalize_token(s).as_str() {
            "query" => Ok(JobKind::Query),
            "backfill" => Ok(JobKind::Backfill),
            _ => Err(EnumParseError {
                kind: "job kind",
                value: s.to_string(),
            }),
        }
    }
}

/// How a cached payload was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Direct,
    Batched,
    Queued,
}

impl CacheSource {
    pub fn as_byte(&self) -> u8 {
        match self {
            CacheSource::Direct => 0,
            CacheSource::Batched => 1,
            CacheSource::Queued => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CacheSource::Direct),
            1 => Some(CacheSource::Batched),
            2 => Some(CacheSource::Queued),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Direct => "direct",
            CacheSource::Batched => "batched",
            CacheSource::Queued => "queued",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_db_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_db_str(status.as_db_str()), Ok(status));
        }
    }

    #[test]
    fn test_job_status_state_machine() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::CompletedWithErrors));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn test_job_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"completed_with_errors\"");
    }

    #[test]
    fn test_unknown_upstream_quality_is_uncertain() {
        assert_eq!(Quality::from_upstream(None), Quality::Good);
        assert_eq!(Quality::from_upstream(Some("BAD")), Quality::Bad);
        assert_eq!(Quality::from_upstream(Some("stale?")), Quality::Uncertain);
    }

    #[test]
    fn test_resolution_parse_and_bucket() {
        assert_eq!("15m".parse::<Resolution>(), Ok(Resolution::FifteenMinutes));
        assert_eq!(Resolution::OneHour.bucket_ms(), Some(3_600_000));
        assert_eq!(Resolution::Raw.bucket_ms(), None);
        assert!("fortnight".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_cache_source_byte_round_trip() {
        for source in [CacheSource::Direct, CacheSource::Batched, CacheSource::Queued] {
            assert_eq!(CacheSource::from_byte(source.as_byte()), Some(source));
        }
        assert_eq!(CacheSource::from_byte(9), None);
    }
}
