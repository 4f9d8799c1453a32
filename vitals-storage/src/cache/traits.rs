//! Cache backend trait and statistics.

use async_trait::async_trait;
use serde::Serialize;
use vitals_core::{CacheEntry, VitalsResult};

use super::key::CacheKey;

/// Statistics for one cache level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub bytes: u64,
    /// Entries removed by capacity pressure.
    pub evictions: u64,
    /// Entries found or swept past their TTL.
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One level of the cache.
///
/// Entries past their TTL are misses even before a sweep removes them. `put`
/// replaces any existing entry for the key wholesale; concurrent puts for
/// the same key are last-write-wins.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> VitalsResult<Option<CacheEntry>>;

    async fn put(&self, entry: CacheEntry) -> VitalsResult<()>;

    async fn remove(&self, key: &CacheKey) -> VitalsResult<bool>;

    /// Remove every entry of `site`, or only those covering a point that
    /// starts with `point_prefix`.
    async fn invalidate(&self, site: &str, point_prefix: Option<&str>) -> VitalsResult<u64>;

    /// Remove entries whose TTL elapsed before `now_ms`.
    async fn sweep_expired(&self, now_ms: i64) -> VitalsResult<u64>;

    async fn stats(&self) -> VitalsResult<CacheStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
