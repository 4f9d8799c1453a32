//! Error types for Vitals operations

use crate::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Sample-local ingestion errors.
///
/// These never abort a fetch: the offending sample is dropped and counted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("Malformed timestamp {input:?}: {reason}")]
    MalformedTimestamp { input: String, reason: String },

    #[error("Invalid value for point {point}: {reason}")]
    InvalidValue { point: String, reason: String },

    #[error("Sample is missing required field: {field}")]
    MissingField { field: &'static str },
}

/// Upstream metering API errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// 4xx other than 429. Never retried.
    #[error("Upstream rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Timeouts, connection failures, 5xx and 429 after the retry cap.
    #[error("Upstream transient failure after {attempts} attempt(s): {reason}")]
    Transient { reason: String, attempts: u32 },

    #[error("Upstream response could not be decoded: {reason}")]
    Decode { reason: String },

    #[error("Upstream fetch cancelled")]
    Cancelled,
}

impl UpstreamError {
    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Transient { .. } | UpstreamError::Decode { .. })
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("Storage read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Corrupt cache entry: {reason}")]
    Corrupt { reason: String },

    #[error("Cache payload serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Job queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: Uuid },

    #[error("Job {job_id} not found")]
    NotFound { job_id: Uuid },

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Job {job_id} is owned by another worker")]
    ClaimConflict { job_id: Uuid },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    Missing { field: String },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Request validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid time range: start {start_ms} must be before end {end_ms}")]
    InvalidRange { start_ms: i64, end_ms: i64 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all Vitals errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VitalsError {
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl VitalsError {
    /// Transient errors are retried at the batch level; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            VitalsError::Upstream(e) => e.is_retryable(),
            VitalsError::Storage(StorageError::WriteFailed { .. })
            | VitalsError::Storage(StorageError::Unavailable { .. }) => true,
            _ => false,
        }
    }

    /// Storage write failures fail a job outright once retries are exhausted.
    pub fn is_storage_write_failure(&self) -> bool {
        matches!(
            self,
            VitalsError::Storage(StorageError::WriteFailed { .. })
                | VitalsError::Storage(StorageError::Unavailable { .. })
        )
    }
}

/// Result type for all Vitals operations.
pub type VitalsResult<T> = Result<T, VitalsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_rejected_is_not_retryable() {
        let err = VitalsError::from(UpstreamError::Rejected {
            status: 404,
            message: "unknown site".to_string(),
        });
        assert!(!err.is_retryable());
        assert!(format!("{}", err).contains("404"));
    }

    #[test]
    fn test_transient_and_storage_write_are_retryable() {
        let transient = VitalsError::from(UpstreamError::Transient {
            reason: "503".to_string(),
            attempts: 3,
        });
        let write = VitalsError::from(StorageError::WriteFailed {
            reason: "connection reset".to_string(),
        });
        assert!(transient.is_retryable());
        assert!(write.is_retryable());
        assert!(write.is_storage_write_failure());
        assert!(!transient.is_storage_write_failure());
    }

    #[test]
    fn test_cancelled_job_is_not_retryable() {
        let err = VitalsError::from(JobError::Cancelled {
            job_id: Uuid::nil(),
        });
        assert!(!err.is_retryable());
        assert!(format!("{}", err).contains("cancelled"));
    }

    #[test]
    fn test_malformed_timestamp_message_includes_input() {
        let err = IngestError::MalformedTimestamp {
            input: "yesterday".to_string(),
            reason: "not a timestamp".to_string(),
        };
        assert!(format!("{}", err).contains("yesterday"));
    }
}
