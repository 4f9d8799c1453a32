//! Upstream client configuration.

use std::time::Duration;
use vitals_core::{env_or, ConfigError};

/// Largest page the upstream API will ever return.
pub const UPSTREAM_PAGE_CEILING: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub page_size: u32,
    pub max_page_size: u32,
    /// Floor for adaptive page downsizing.
    pub min_page_size: u32,
    /// Per-page request timeout.
    pub request_timeout: Duration,
    /// Attempts per page, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Longest wait between attempts, including server-requested waits.
    pub max_backoff: Duration,
    /// Safety cap on pages per sequence.
    pub max_pages: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            token: None,
            page_size: 5_000,
            max_page_size: 100_000,
            min_page_size: 1_000,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_pages: 1_000,
        }
    }
}

impl UpstreamConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_or("VITALS_UPSTREAM_URL", d.base_url),
            token: std::env::var("VITALS_UPSTREAM_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            page_size: env_or("VITALS_UPSTREAM_PAGE_SIZE", d.page_size),
            max_page_size: env_or("VITALS_UPSTREAM_MAX_PAGE_SIZE", d.max_page_size),
            min_page_size: env_or("VITALS_UPSTREAM_MIN_PAGE_SIZE", d.min_page_size),
            request_timeout: Duration::from_millis(env_or(
                "VITALS_UPSTREAM_TIMEOUT_MS",
                d.request_timeout.as_millis() as u64,
            )),
            max_attempts: env_or("VITALS_UPSTREAM_MAX_ATTEMPTS", d.max_attempts),
            backoff_base: Duration::from_millis(env_or(
                "VITALS_UPSTREAM_BACKOFF_BASE_MS",
                d.backoff_base.as_millis() as u64,
            )),
            max_backoff: Duration::from_millis(env_or(
                "VITALS_UPSTREAM_MAX_BACKOFF_MS",
                d.max_backoff.as_millis() as u64,
            )),
            max_pages: env_or("VITALS_UPSTREAM_MAX_PAGES", d.max_pages),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Page sizes above the configured maximum, or a maximum above the
    /// upstream ceiling, are configuration errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, value: String, reason: String| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            reason,
        };
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "VITALS_UPSTREAM_URL".to_string(),
            });
        }
        if self.max_page_size == 0 || self.max_page_size > UPSTREAM_PAGE_CEILING {
            return Err(invalid(
                "max_page_size",
                self.max_page_size.to_string(),
                format!("must be between 1 and {}", UPSTREAM_PAGE_CEILING),
            ));
        }
        if self.page_size == 0 || self.page_size > self.max_page_size {
            return Err(invalid(
                "page_size",
                self.page_size.to_string(),
                format!("must be between 1 and max_page_size ({})", self.max_page_size),
            ));
        }
        if self.min_page_size == 0 || self.min_page_size > self.page_size {
            return Err(invalid(
                "min_page_size",
                self.min_page_size.to_string(),
                "must be between 1 and page_size".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid(
                "max_attempts",
                "0".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.max_backoff < self.backoff_base {
            return Err(invalid(
                "max_backoff",
                format!("{}ms", self.max_backoff.as_millis()),
                "must not be shorter than backoff_base".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid(
                "request_timeout",
                "0".to_string(),
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
