//! Error Types for the VITALS API
//!
//! - [`ApiError`]: the JSON body returned by every failing endpoint
//! - [`ErrorCode`]: error categories, each mapped to one HTTP status
//! - conversions from the pipeline, database and JSON error types
//!
//! Bodies look like `{"code": "INVALID_RANGE", "message": "...", "details": {...}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use vitals_core::{
    CacheError, ConfigError, JobError, StorageError, UpstreamError, ValidationError, VitalsError,
};

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    ValidationFailed,
    InvalidInput,
    MissingField,
    /// Start of a time range is not before its end
    InvalidRange,
    InvalidFormat,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    EntityNotFound,
    JobNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Operation not allowed in the job's current state
    StateConflict,

    // ========================================================================
    // Upstream Errors (502, 503)
    // ========================================================================
    /// The metering API refused the request
    UpstreamRejected,
    /// The metering API kept failing after retries
    UpstreamUnavailable,
    /// The metering API answered with something unreadable
    UpstreamInvalidResponse,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    InternalError,
    DatabaseError,
    CacheError,
    ServiceUnavailable,
    ConnectionPoolExhausted,
    Timeout,
    RequestCancelled,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidRange
            | ErrorCode::InvalidFormat => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound | ErrorCode::JobNotFound => StatusCode::NOT_FOUND,

            ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::UpstreamRejected | ErrorCode::UpstreamInvalidResponse => {
                StatusCode::BAD_GATEWAY
            }

            ErrorCode::InternalError | ErrorCode::DatabaseError | ErrorCode::CacheError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            ErrorCode::UpstreamUnavailable
            | ErrorCode::ServiceUnavailable
            | ErrorCode::ConnectionPoolExhausted
            | ErrorCode::RequestCancelled => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidRange => "Invalid time range",
            ErrorCode::InvalidFormat => "Field format is incorrect",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::JobNotFound => "Job not found",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::UpstreamRejected => "Upstream API rejected the request",
            ErrorCode::UpstreamUnavailable => "Upstream API is unavailable",
            ErrorCode::UpstreamInvalidResponse => "Upstream API returned an invalid response",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::CacheError => "Cache operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Database connection pool exhausted",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::RequestCancelled => "Request was cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create an error with the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_range(start_ms: i64, end_ms: i64) -> Self {
        Self::new(
            ErrorCode::InvalidRange,
            format!("startMs ({}) must be before endMs ({})", start_ms, end_ms),
        )
        .with_details(serde_json::json!({ "startMs": start_ms, "endMs": end_ms }))
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected: {}", field, expected),
        )
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id '{}' not found", entity_type, id),
        )
    }

    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::JobNotFound,
            format!("Job with id '{}' not found", job_id),
        )
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn upstream_rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamRejected, message)
            .with_details(serde_json::json!({ "upstreamStatus": status }))
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn connection_pool_exhausted() -> Self {
        Self::from_code(ErrorCode::ConnectionPoolExhausted)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation '{}' timed out", operation),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM PIPELINE ERRORS
// ============================================================================

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::RequiredFieldMissing { field } => ApiError::missing_field(&field),
            ValidationError::InvalidRange { start_ms, end_ms } => {
                ApiError::invalid_range(start_ms, end_ms)
            }
            ValidationError::InvalidValue { field, reason } => {
                ApiError::validation_failed(format!("Invalid value for {}: {}", field, reason))
                    .with_details(serde_json::json!({ "field": field }))
            }
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Rejected { status, message } => ApiError::upstream_rejected(
                status,
                format!("Upstream rejected the request: {}", message),
            ),
            UpstreamError::Transient { reason, attempts } => {
                tracing::warn!(reason = %reason, attempts, "Upstream unavailable");
                ApiError::upstream_unavailable(format!(
                    "Upstream unavailable after {} attempt(s)",
                    attempts
                ))
            }
            UpstreamError::Decode { reason } => {
                tracing::warn!(reason = %reason, "Upstream decode failure");
                ApiError::from_code(ErrorCode::UpstreamInvalidResponse)
            }
            UpstreamError::Cancelled => ApiError::from_code(ErrorCode::RequestCancelled),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => ApiError::entity_not_found(entity, id),
            StorageError::Unavailable { reason } => {
                tracing::error!(reason = %reason, "Storage unavailable");
                ApiError::service_unavailable("Storage is unavailable")
            }
            other => {
                tracing::error!(error = %other, "Storage error");
                ApiError::database_error("Storage operation failed")
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound { job_id } => ApiError::job_not_found(job_id),
            JobError::Cancelled { job_id } => {
                ApiError::state_conflict(format!("Job {} was cancelled", job_id))
            }
            JobError::InvalidTransition { from, to } => ApiError::state_conflict(format!(
                "Job cannot move from {} to {}",
                from, to
            )),
            JobError::ClaimConflict { job_id } => {
                ApiError::state_conflict(format!("Job {} is owned by another worker", job_id))
            }
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        tracing::error!(error = %err, "Cache error");
        ApiError::from_code(ErrorCode::CacheError)
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        tracing::error!(error = %err, "Configuration error");
        ApiError::internal_error("Server is misconfigured")
    }
}

impl From<VitalsError> for ApiError {
    fn from(err: VitalsError) -> Self {
        match err {
            VitalsError::Validation(e) => e.into(),
            VitalsError::Upstream(e) => e.into(),
            VitalsError::Storage(e) => e.into(),
            VitalsError::Job(e) => e.into(),
            VitalsError::Cache(e) => e.into(),
            VitalsError::Config(e) => e.into(),
            VitalsError::Ingest(e) => ApiError::invalid_input(e.to_string()),
        }
    }
}

// ============================================================================
// CONVERSIONS FROM STANDARD ERRORS
// ============================================================================

impl From<tokio_postgres::Error> for ApiError {
    fn from(err: tokio_postgres::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::database_error("Database operation failed")
    }
}

impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        tracing::error!("Connection pool error: {:?}", err);
        match err {
            deadpool_postgres::PoolError::Timeout(_) => ApiError::connection_pool_exhausted(),
            deadpool_postgres::PoolError::Closed => {
                ApiError::service_unavailable("Database connection pool is closed")
            }
            _ => ApiError::database_error("Failed to acquire database connection"),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

impl From<uuid::Error> for ApiError {
    fn from(err: uuid::Error) -> Self {
        ApiError::invalid_format("id", &format!("valid UUID: {}", err))
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use vitals_core::JobStatus;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::InvalidRange.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::JobNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StateConflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::UpstreamRejected.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::DatabaseError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ErrorCode::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_validation_errors_map_to_bad_request() {
        let err = ApiError::from(VitalsError::from(ValidationError::InvalidRange {
            start_ms: 10,
            end_ms: 5,
        }));
        assert_eq!(err.code, ErrorCode::InvalidRange);
        assert_eq!(
            err.details,
            Some(serde_json::json!({ "startMs": 10, "endMs": 5 }))
        );

        let err = ApiError::from(VitalsError::from(ValidationError::RequiredFieldMissing {
            field: "points".to_string(),
        }));
        assert_eq!(err.code, ErrorCode::MissingField);
        assert!(err.message.contains("points"));
    }

    #[test]
    fn test_upstream_errors_keep_their_class() {
        let rejected = ApiError::from(VitalsError::from(UpstreamError::Rejected {
            status: 403,
            message: "forbidden".to_string(),
        }));
        assert_eq!(rejected.code, ErrorCode::UpstreamRejected);
        assert_eq!(rejected.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            rejected.details,
            Some(serde_json::json!({ "upstreamStatus": 403 }))
        );

        let transient = ApiError::from(VitalsError::from(UpstreamError::Transient {
            reason: "connection reset".to_string(),
            attempts: 3,
        }));
        assert_eq!(transient.code, ErrorCode::UpstreamUnavailable);
        assert!(!transient.message.contains("connection reset"));
    }

    #[test]
    fn test_job_errors() {
        let id = Uuid::nil();
        let err = ApiError::from(VitalsError::from(JobError::NotFound { job_id: id }));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = ApiError::from(JobError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Queued,
        });
        assert_eq!(err.code, ErrorCode::StateConflict);
    }

    #[test]
    fn test_storage_errors_do_not_leak_details() {
        let err = ApiError::from(StorageError::WriteFailed {
            reason: "password authentication failed for user vitals".to_string(),
        });
        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert!(!err.message.contains("password"));

        let err = ApiError::from(StorageError::Unavailable {
            reason: "pool closed".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::job_not_found("abc");
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("JOB_NOT_FOUND"));
        assert!(!json.contains("details"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::database_error("Connection failed");
        let display = format!("{}", err);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Connection failed"));
    }
}
