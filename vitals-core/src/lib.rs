//! VITALS Core - Pipeline Types
//!
//! Data types, the error taxonomy, configuration and the pure functions
//! (timestamp normalization, fingerprinting) that every other crate shares.

use chrono::{DateTime, Utc};
use uuid::Uuid;

mod config;
mod entities;
mod enums;
mod error;
mod fingerprint;
pub mod timestamp;

pub use config::{env_or, PipelineConfig};
pub use entities::{
    dedupe_last_write_wins, CacheEntry, ConfiguredPoint, CoverageReport, DeadLetterRecord,
    FetchPlan, Job, JobCursor, PointRecord, QueryParams, RawSample, RawValue, Sample, SampleKey,
};
pub use enums::{CacheSource, EnumParseError, JobKind, JobStatus, Quality, Resolution, Tier};
pub use error::{
    CacheError, ConfigError, IngestError, JobError, StorageError, UpstreamError,
    ValidationError, VitalsError, VitalsResult,
};
pub use fingerprint::Fingerprint;
pub use timestamp::{
    format_rfc3339, millis_to_datetime, normalize, RawTime, MAX_TIMESTAMP_MS, MIN_TIMESTAMP_MS,
};

// ============================================================================
// IDENTITY & TIME
// ============================================================================

/// Job identifier (UUIDv7, sortable by creation time).
pub type JobId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub fn new_job_id() -> JobId {
    Uuid::now_v7()
}

/// Source of "now" for TTLs, the tier boundary and job backoff.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now(&self) -> Timestamp {
        millis_to_datetime(self.now_ms()).unwrap_or_else(Utc::now)
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
