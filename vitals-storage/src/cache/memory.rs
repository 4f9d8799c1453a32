//! In-process LRU cache level.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use vitals_core::{CacheEntry, CacheError, Clock, VitalsResult};

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats};

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<CacheKey, (Arc<CacheEntry>, u64)>,
    /// Access tick -> key; the first entry is the least recently used.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last)) = self.entries.get_mut(key) {
            self.recency.remove(last);
            *last = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let (entry, tick) = self.entries.remove(key)?;
        self.recency.remove(&tick);
        Some(entry)
    }

    fn bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|(e, _)| e.payload.len() as u64)
            .sum()
    }
}

/// Entry-count bounded LRU map.
///
/// The lock is only held for map bookkeeping, never across an await.
pub struct MemoryCache {
    state: Mutex<LruState>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            capacity: capacity.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> VitalsResult<MutexGuard<'_, LruState>> {
        self.state.lock().map_err(|_| {
            CacheError::Unavailable {
                reason: "in-process cache lock poisoned".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> VitalsResult<Option<CacheEntry>> {
        let now = self.clock.now_ms();
        let mut state = self.lock()?;
        let entry = match state.entries.get(key) {
            Some((entry, _)) => Arc::clone(entry),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };
        if entry.is_expired(now) {
            state.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        state.touch(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.as_ref().clone()))
    }

    async fn put(&self, entry: CacheEntry) -> VitalsResult<()> {
        let key = CacheKey::for_entry(&entry);
        let mut state = self.lock()?;
        state.remove(&key);
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(key.clone(), (Arc::new(entry), tick));
        state.recency.insert(tick, key);

        while state.entries.len() > self.capacity {
            let Some((_, lru_key)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&lru_key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> VitalsResult<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    async fn invalidate(&self, site: &str, point_prefix: Option<&str>) -> VitalsResult<u64> {
        let mut state = self.lock()?;
        let doomed: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, (e, _))| k.site() == site && e.covers_point_prefix(point_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn sweep_expired(&self, now_ms: i64) -> VitalsResult<u64> {
        let mut state = self.lock()?;
        let doomed: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, (e, _))| e.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        self.expired
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        Ok(doomed.len() as u64)
    }

    async fn stats(&self) -> VitalsResult<CacheStats> {
        let state = self.lock()?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: state.entries.len() as u64,
            bytes: state.bytes(),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use vitals_core::{CacheSource, Fingerprint};

    struct TestClock(AtomicI64);

    impl Clock for TestClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn entry(site: &str, n: u8, points: &[&str], ttl_ms: i64) -> CacheEntry {
        CacheEntry {
            fingerprint: Fingerprint::from_bytes([n; 32]),
            site: site.to_string(),
            points: points.iter().map(|p| p.to_string()).collect(),
            payload: vec![n; 4],
            created_at_ms: 0,
            ttl_ms,
            source: CacheSource::Direct,
        }
    }

    fn key(site: &str, n: u8) -> CacheKey {
        CacheKey::new(site, Fingerprint::from_bytes([n; 32]))
    }

    #[tokio::test]
    async fn test_get_after_put_then_ttl_miss() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = MemoryCache::new(10, clock.clone());
        cache.put(entry("S1", 1, &["P1"], 1_000)).await.expect("put should succeed");

        let hit = cache.get(&key("S1", 1)).await.expect("get should succeed");
        assert_eq!(hit.map(|e| e.payload), Some(vec![1u8; 4]));

        clock.0.store(1_000, Ordering::SeqCst);
        assert!(cache.get(&key("S1", 1)).await.expect("get should succeed").is_none());
        let stats = cache.stats().await.expect("stats should succeed");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = MemoryCache::new(2, clock);
        cache.put(entry("S1", 1, &["P1"], 10_000)).await.expect("put should succeed");
        cache.put(entry("S1", 2, &["P1"], 10_000)).await.expect("put should succeed");
        // Touch 1 so 2 becomes the eviction candidate.
        cache.get(&key("S1", 1)).await.expect("get should succeed");
        cache.put(entry("S1", 3, &["P1"], 10_000)).await.expect("put should succeed");

        assert!(cache.get(&key("S1", 1)).await.expect("get should succeed").is_some());
        assert!(cache.get(&key("S1", 2)).await.expect("get should succeed").is_none());
        assert!(cache.get(&key("S1", 3)).await.expect("get should succeed").is_some());
        assert_eq!(cache.stats().await.expect("stats should succeed").evictions, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_wholesale() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = MemoryCache::new(2, clock);
        cache.put(entry("S1", 1, &["P1"], 10_000)).await.expect("put should succeed");
        let mut replacement = entry("S1", 1, &["P1"], 10_000);
        replacement.payload = vec![9];
        cache.put(replacement).await.expect("put should succeed");

        let got = cache.get(&key("S1", 1)).await.expect("get should succeed");
        assert_eq!(got.map(|e| e.payload), Some(vec![9]));
        assert_eq!(cache.stats().await.expect("stats should succeed").entries, 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_site_and_point_prefix() {
        let clock = Arc::new(TestClock(AtomicI64::new(0)));
        let cache = MemoryCache::new(10, clock);
        cache.put(entry("S1", 1, &["AHU-1.SAT"], 10_000)).await.expect("put should succeed");
        cache.put(entry("S1", 2, &["VAV-3.ZNT"], 10_000)).await.expect("put should succeed");
        cache.put(entry("S2", 3, &["AHU-1.SAT"], 10_000)).await.expect("put should succeed");

        let removed = cache
            .invalidate("S1", Some("AHU"))
            .await
            .expect("invalidate should succeed");
        assert_eq!(removed, 1);
        assert!(cache.get(&key("S1", 2)).await.expect("get should succeed").is_some());
        assert!(cache.get(&key("S2", 3)).await.expect("get should succeed").is_some());

        assert_eq!(
            cache.invalidate("S1", None).await.expect("invalidate should succeed"),
            1
        );
    }
}
