//! API Configuration Module
//!
//! Server-level settings: bind address, storage backend, CORS, request
//! limits and log format. Background task intervals are configured by each
//! task in [`crate::jobs`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use vitals_core::{env_or, ConfigError};

// ============================================================================
// STORAGE BACKEND / LOG FORMAT
// ============================================================================

/// Which sample and job stores the server runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// In-process stores; data is lost on restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StorageBackend::Postgres),
            "memory" | "in-memory" | "mem" => Ok(StorageBackend::Memory),
            other => Err(ConfigError::InvalidValue {
                field: "VITALS_STORAGE".to_string(),
                value: other.to_string(),
                reason: "expected postgres or memory".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("VITALS_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("pretty") || v.eq_ignore_ascii_case("text") => {
                LogFormat::Pretty
            }
            _ => LogFormat::Json,
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_host: String,
    pub port: u16,
    pub storage: StorageBackend,

    /// Allowed CORS origins. Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,
    pub cors_max_age_secs: u64,

    /// Upper bound on a single request, including inline upstream fetches.
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 3000,
            storage: StorageBackend::Postgres,
            cors_origins: Vec::new(),
            cors_max_age_secs: 86400,
            request_timeout: Duration::from_secs(120),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `VITALS_API_BIND`: bind host (default: 0.0.0.0)
    /// - `PORT` or `VITALS_API_PORT`: port (default: 3000)
    /// - `VITALS_STORAGE`: `postgres` or `memory` (default: postgres)
    /// - `VITALS_CORS_ORIGINS`: comma-separated allowed origins (empty = allow all)
    /// - `VITALS_CORS_MAX_AGE_SECS`: preflight cache duration (default: 86400)
    /// - `VITALS_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 120)
    /// - `VITALS_MAX_BODY_BYTES`: request body limit (default: 1 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("VITALS_API_PORT").ok())
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(d.port);

        let storage = match std::env::var("VITALS_STORAGE") {
            Ok(v) if !v.trim().is_empty() => v.parse()?,
            _ => d.storage,
        };

        let cors_origins = std::env::var("VITALS_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            bind_host: env_or("VITALS_API_BIND", d.bind_host),
            port,
            storage,
            cors_origins,
            cors_max_age_secs: env_or("VITALS_CORS_MAX_AGE_SECS", d.cors_max_age_secs),
            request_timeout: Duration::from_secs(env_or(
                "VITALS_REQUEST_TIMEOUT_SECS",
                d.request_timeout.as_secs(),
            )),
            max_body_bytes: env_or("VITALS_MAX_BODY_BYTES", d.max_body_bytes),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "VITALS_REQUEST_TIMEOUT_SECS".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "VITALS_MAX_BODY_BYTES".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        self.bind_addr().map(|_| ())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_host, self.port);
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            field: "VITALS_API_BIND".to_string(),
            value: raw.clone(),
            reason: "not a socket address".to_string(),
        })
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origins.is_empty() {
            return true;
        }
        self.cors_origins.iter().any(|allowed| {
            if allowed == origin {
                return true;
            }
            // *.example.com
            if let Some(pattern) = allowed.strip_prefix("*.") {
                if let Some(origin_domain) = origin.strip_prefix("https://") {
                    return origin_domain.ends_with(&format!(".{}", pattern))
                        || origin_domain == pattern;
                }
            }
            false
        })
    }
}
