//! Pipeline configuration.
//!
//! Every knob has a default and may be overridden from the environment.

use crate::error::ConfigError;
use std::str::FromStr;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Read `key` from the environment, falling back to `default` when unset or
/// unparseable.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Tunables for routing, dispatch, the job worker and caching.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Age after which the upstream raw tier is guaranteed populated.
    pub lag_threshold_ms: i64,
    /// The tier boundary is quantized down to this granularity.
    pub boundary_granularity_ms: i64,
    /// Estimates below this are fetched inline.
    pub direct_threshold: u64,
    /// Estimates above this become jobs.
    pub batch_threshold: u64,
    pub max_batch_concurrency: usize,
    pub job_sub_batch_concurrency: usize,
    /// Wall-clock budget per worker invocation.
    pub job_batch_budget_ms: u64,
    /// A `processing` job not written for this long is claimable again.
    /// Must exceed the batch budget.
    pub job_lease_ms: i64,
    pub max_retries: u32,
    /// Base for job retry backoff (doubles per retry).
    pub retry_base_ms: u64,
    /// TTL for payloads that include aggregated data.
    pub cache_ttl_ms: i64,
    /// TTL for raw-only segments, which do not change once published.
    pub raw_cache_ttl_ms: i64,
    pub job_retention_days: u32,
    /// Assumed spacing of native upstream samples, used for estimates.
    pub raw_sample_interval_ms: i64,
    pub upsert_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lag_threshold_ms: 48 * HOUR_MS,
            boundary_granularity_ms: 300_000,
            direct_threshold: 1_000,
            batch_threshold: 100_000,
            max_batch_concurrency: 50,
            job_sub_batch_concurrency: 10,
            job_batch_budget_ms: 30_000,
            job_lease_ms: 300_000,
            max_retries: 3,
            retry_base_ms: 1_000,
            cache_ttl_ms: 300_000,
            raw_cache_ttl_ms: HOUR_MS,
            job_retention_days: 7,
            raw_sample_interval_ms: 60_000,
            upsert_batch_size: 250,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `VITALS_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            lag_threshold_ms: env_or("VITALS_LAG_THRESHOLD_MS", d.lag_threshold_ms),
            boundary_granularity_ms: env_or(
                "VITALS_BOUNDARY_GRANULARITY_MS",
                d.boundary_granularity_ms,
            ),
            direct_threshold: env_or("VITALS_DIRECT_THRESHOLD", d.direct_threshold),
            batch_threshold: env_or("VITALS_BATCH_THRESHOLD", d.batch_threshold),
            max_batch_concurrency: env_or("VITALS_MAX_BATCH_CONCURRENCY", d.max_batch_concurrency),
            job_sub_batch_concurrency: env_or(
                "VITALS_JOB_SUB_BATCH_CONCURRENCY",
                d.job_sub_batch_concurrency,
            ),
            job_batch_budget_ms: env_or("VITALS_JOB_BATCH_BUDGET_MS", d.job_batch_budget_ms),
            job_lease_ms: env_or("VITALS_JOB_LEASE_MS", d.job_lease_ms),
            max_retries: env_or("VITALS_MAX_RETRIES", d.max_retries),
            retry_base_ms: env_or("VITALS_RETRY_BASE_MS", d.retry_base_ms),
            cache_ttl_ms: env_or("VITALS_CACHE_TTL_MS", d.cache_ttl_ms),
            raw_cache_ttl_ms: env_or("VITALS_RAW_CACHE_TTL_MS", d.raw_cache_ttl_ms),
            job_retention_days: env_or("VITALS_JOB_RETENTION_DAYS", d.job_retention_days),
            raw_sample_interval_ms: env_or(
                "VITALS_RAW_SAMPLE_INTERVAL_MS",
                d.raw_sample_interval_ms,
            ),
            upsert_batch_size: env_or("VITALS_UPSERT_BATCH_SIZE", d.upsert_batch_size),
        }
    }

    pub fn with_lag_threshold_ms(mut self, ms: i64) -> Self {
        self.lag_threshold_ms = ms;
        self
    }

    pub fn with_thresholds(mut self, direct: u64, batch: u64) -> Self {
        self.direct_threshold = direct;
        self.batch_threshold = batch;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_ms(mut self, ms: u64) -> Self {
        self.retry_base_ms = ms;
        self
    }

    pub fn with_job_lease_ms(mut self, ms: i64) -> Self {
        self.job_lease_ms = ms;
        self
    }

    pub fn job_retention_ms(&self) -> i64 {
        i64::from(self.job_retention_days) * DAY_MS
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("lag_threshold_ms", self.lag_threshold_ms)?;
        positive("boundary_granularity_ms", self.boundary_granularity_ms)?;
        positive("raw_sample_interval_ms", self.raw_sample_interval_ms)?;
        positive("cache_ttl_ms", self.cache_ttl_ms)?;
        positive("raw_cache_ttl_ms", self.raw_cache_ttl_ms)?;
        if self.direct_threshold == 0 || self.direct_threshold > self.batch_threshold {
            return Err(ConfigError::InvalidValue {
                field: "direct_threshold".to_string(),
                value: self.direct_threshold.to_string(),
                reason: format!(
                    "must be between 1 and batch_threshold ({})",
                    self.batch_threshold
                ),
            });
        }
        for (field, value) in [
            ("max_batch_concurrency", self.max_batch_concurrency),
            ("job_sub_batch_concurrency", self.job_sub_batch_concurrency),
            ("upsert_batch_size", self.upsert_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.job_batch_budget_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "job_batch_budget_ms".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if i64::try_from(self.job_batch_budget_ms).map_or(true, |budget| self.job_lease_ms <= budget) {
            return Err(ConfigError::InvalidValue {
                field: "job_lease_ms".to_string(),
                value: self.job_lease_ms.to_string(),
                reason: format!(
                    "must exceed job_batch_budget_ms ({})",
                    self.job_batch_budget_ms
                ),
            });
        }
        Ok(())
    }
}

fn positive(field: &str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.lag_threshold_ms, 172_800_000);
        assert_eq!(config.direct_threshold, 1_000);
        assert_eq!(config.batch_threshold, 100_000);
        assert_eq!(config.max_batch_concurrency, 50);
        assert_eq!(config.job_sub_batch_concurrency, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.job_retention_ms(), 7 * DAY_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = PipelineConfig::default().with_thresholds(500_000, 100_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = PipelineConfig {
            max_batch_concurrency: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_batch_concurrency"
        ));
    }

    #[test]
    fn test_validate_rejects_lease_shorter_than_budget() {
        let config = PipelineConfig::default().with_job_lease_ms(30_000);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "job_lease_ms"
        ));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        assert_eq!(env_or("VITALS_TEST_UNSET_VARIABLE_XYZ", 42u32), 42);
    }
}
