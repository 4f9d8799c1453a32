//! Two-level cache: in-process LRU in front of the durable level.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use vitals_core::{env_or, CacheEntry, CacheSource, Clock, Fingerprint, VitalsResult};

use super::key::CacheKey;
use super::lmdb_backend::LmdbCache;
use super::memory::MemoryCache;
use super::traits::{CacheBackend, CacheStats};

/// Configuration for the two-level cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum entries in the in-process level.
    pub l1_capacity: usize,
    /// Directory of the durable level; `None` runs in-process only.
    pub l2_path: Option<PathBuf>,
    /// Cap on stored bytes in the durable level.
    pub l2_max_bytes: u64,
    /// LMDB map size.
    pub l2_map_size_mb: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 10_000,
            l2_path: Some(PathBuf::from("./data/cache")),
            l2_max_bytes: 512 * 1024 * 1024,
            l2_map_size_mb: 1024,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let l2_path = match std::env::var("VITALS_CACHE_L2_PATH") {
            Ok(p) if p.trim().is_empty() || p == "none" => None,
            Ok(p) => Some(PathBuf::from(p)),
            Err(_) => d.l2_path,
        };
        Self {
            l1_capacity: env_or("VITALS_CACHE_L1_CAPACITY", d.l1_capacity),
            l2_path,
            l2_max_bytes: env_or("VITALS_CACHE_L2_MAX_BYTES", d.l2_max_bytes),
            l2_map_size_mb: env_or("VITALS_CACHE_L2_MAP_SIZE_MB", d.l2_map_size_mb),
        }
    }

    /// In-process only, for tests.
    pub fn in_memory(l1_capacity: usize) -> Self {
        Self {
            l1_capacity,
            l2_path: None,
            ..Self::default()
        }
    }

    pub fn with_l2_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.l2_path = Some(path.into());
        self
    }

    pub fn with_l2_max_bytes(mut self, bytes: u64) -> Self {
        self.l2_max_bytes = bytes;
        self
    }
}

/// Per-level statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TieredStats {
    pub l1: CacheStats,
    pub l2: Option<CacheStats>,
}

/// Which level answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::L1 => "l1",
            CacheLevel::L2 => "l2",
        }
    }
}

/// The query cache. Constructed once and shared by handle.
pub struct TieredCache {
    l1: MemoryCache,
    l2: Option<Arc<dyn CacheBackend>>,
    clock: Arc<dyn Clock>,
}

impl TieredCache {
    pub fn open(config: &CacheConfig, clock: Arc<dyn Clock>) -> VitalsResult<Self> {
        let l1 = MemoryCache::new(config.l1_capacity, clock.clone());
        let l2: Option<Arc<dyn CacheBackend>> = match &config.l2_path {
            Some(path) => Some(Arc::new(LmdbCache::open(
                path,
                config.l2_map_size_mb,
                config.l2_max_bytes,
                clock.clone(),
            )?)),
            None => None,
        };
        Ok(Self { l1, l2, clock })
    }

    pub fn from_parts(
        l1: MemoryCache,
        l2: Option<Arc<dyn CacheBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { l1, l2, clock }
    }

    /// Look up L1, then L2. L2 hits are promoted into L1.
    pub async fn lookup(&self, key: &CacheKey) -> VitalsResult<Option<(CacheEntry, CacheLevel)>> {
        if let Some(entry) = self.l1.get(key).await? {
            return Ok(Some((entry, CacheLevel::L1)));
        }
        let Some(l2) = &self.l2 else {
            return Ok(None);
        };
        match l2.get(key).await? {
            Some(entry) => {
                self.l1.put(entry.clone()).await?;
                Ok(Some((entry, CacheLevel::L2)))
            }
            None => Ok(None),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> VitalsResult<Option<CacheEntry>> {
        Ok(self.lookup(key).await?.map(|(entry, _)| entry))
    }

    /// Write to both levels. The entry always lands in L1 even when the
    /// durable write fails; the error is still returned so callers can
    /// report degraded service.
    pub async fn put(&self, entry: CacheEntry) -> VitalsResult<()> {
        self.l1.put(entry.clone()).await?;
        if let Some(l2) = &self.l2 {
            l2.put(entry).await?;
        }
        Ok(())
    }

    /// Build and store an entry stamped with the current time.
    pub async fn put_payload(
        &self,
        site: &str,
        fingerprint: Fingerprint,
        points: Vec<String>,
        payload: Vec<u8>,
        ttl_ms: i64,
        source: CacheSource,
    ) -> VitalsResult<()> {
        self.put(CacheEntry {
            fingerprint,
            site: site.to_string(),
            points,
            payload,
            created_at_ms: self.clock.now_ms(),
            ttl_ms,
            source,
        })
        .await
    }

    /// Invalidate in both levels; returns the larger of the two counts.
    pub async fn invalidate(&self, site: &str, point_prefix: Option<&str>) -> VitalsResult<u64> {
        let l1 = self.l1.invalidate(site, point_prefix).await?;
        let l2 = match &self.l2 {
            Some(l2) => l2.invalidate(site, point_prefix).await?,
            None => 0,
        };
        tracing::info!(site, point_prefix, l1, l2, "Invalidated cache entries");
        Ok(l1.max(l2))
    }

    /// Remove expired entries from both levels.
    pub async fn sweep_expired(&self) -> VitalsResult<u64> {
        let now = self.clock.now_ms();
        let mut removed = self.l1.sweep_expired(now).await?;
        if let Some(l2) = &self.l2 {
            removed += l2.sweep_expired(now).await?;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> VitalsResult<TieredStats> {
        let l1 = self.l1.stats().await?;
        let l2 = match &self.l2 {
            Some(l2) => Some(l2.stats().await?),
            None => None,
        };
        Ok(TieredStats { l1, l2 })
    }

    /// Readiness probe: both levels must answer.
    pub async fn health_check(&self) -> VitalsResult<()> {
        self.stats().await.map(|_| ())
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::TempDir;

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_get_after_put_then_miss_after_ttl() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(TestClock(AtomicI64::new(10_000)));
        let cache = TieredCache::open(
            &CacheConfig::in_memory(4).with_l2_path(dir.path()),
            clock.clone(),
        )
        .expect("cache should open");

        cache
            .put_payload("S1", fp(1), vec!["P1".into()], b"payload".to_vec(), 500, CacheSource::Direct)
            .await
            .expect("put should succeed");
        let hit = cache.get(&CacheKey::new("S1", fp(1))).await.expect("get should succeed");
        assert_eq!(hit.map(|e| e.payload), Some(b"payload".to_vec()));

        clock.0.store(10_500, Ordering::SeqCst);
        assert!(cache
            .get(&CacheKey::new("S1", fp(1)))
            .await
            .expect("get should succeed")
            .is_none());
    }

    #[tokio::test]
    async fn test_l2_hit_is_promoted() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = TieredCache::open(
            &CacheConfig::in_memory(1).with_l2_path(dir.path()),
            clock,
        )
        .expect("cache should open");

        cache
            .put_payload("S1", fp(1), vec![], vec![1], 60_000, CacheSource::Direct)
            .await
            .expect("put should succeed");
        // Pushes fp(1) out of the single-slot L1.
        cache
            .put_payload("S1", fp(2), vec![], vec![2], 60_000, CacheSource::Direct)
            .await
            .expect("put should succeed");

        let (_, level) = cache
            .lookup(&CacheKey::new("S1", fp(1)))
            .await
            .expect("lookup should succeed")
            .expect("entry should be found");
        assert_eq!(level, CacheLevel::L2);
        let (_, level) = cache
            .lookup(&CacheKey::new("S1", fp(1)))
            .await
            .expect("lookup should succeed")
            .expect("entry should be found");
        assert_eq!(level, CacheLevel::L1);
    }

    #[tokio::test]
    async fn test_invalidate_and_sweep_reach_both_levels() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = TieredCache::open(
            &CacheConfig::in_memory(8).with_l2_path(dir.path()),
            clock.clone(),
        )
        .expect("cache should open");

        cache
            .put_payload("S1", fp(1), vec!["AHU-1".into()], vec![1], 100, CacheSource::Direct)
            .await
            .expect("put should succeed");
        cache
            .put_payload("S1", fp(2), vec!["VAV-1".into()], vec![2], 100_000, CacheSource::Direct)
            .await
            .expect("put should succeed");

        assert_eq!(
            cache.invalidate("S1", Some("VAV")).await.expect("invalidate should succeed"),
            1
        );
        clock.0.store(1_000, Ordering::SeqCst);
        assert_eq!(cache.sweep_expired().await.expect("sweep should succeed"), 2);
        let stats = cache.stats().await.expect("stats should succeed");
        assert_eq!(stats.l1.entries, 0);
        assert_eq!(stats.l2.map(|s| s.entries), Some(0));
    }
}
