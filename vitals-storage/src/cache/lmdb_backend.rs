//! LMDB-backed durable cache level.
//!
//! Uses the heed crate (Rust bindings for LMDB). Entries survive process
//! restarts and are shared by every worker on the host.
//!
//! # Value Format
//!
//! - Bytes 0-7: created-at millis (i64 LE)
//! - Bytes 8-15: TTL millis (i64 LE)
//! - Byte 16: source
//! - Bytes 17-20: length of the points block (u32 LE)
//! - Points block: JSON array of covered point names
//! - Remainder: payload
//!
//! The total size of stored keys and values is capped. A put that pushes the
//! total over the cap evicts the oldest entries down to 90% of the cap.
//! Expired entries are removed by [`CacheBackend::sweep_expired`], which scans
//! under a read transaction and deletes in short write transactions, so
//! readers are never blocked (LMDB readers do not wait on writers). Each
//! delete re-reads the entry inside its write transaction and skips it if a
//! put has refreshed it since the scan.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use vitals_core::{CacheEntry, CacheError, CacheSource, Clock, VitalsError, VitalsResult};

use super::key::CacheKey;
use super::traits::{CacheBackend, CacheStats};

const HEADER_LEN: usize = 8 + 8 + 1 + 4;
const DELETE_CHUNK: usize = 256;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for VitalsError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Deserialization(reason) => CacheError::Corrupt { reason }.into(),
            LmdbCacheError::Serialization(reason) => CacheError::Serialization { reason }.into(),
            other => CacheError::Unavailable {
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

/// Durable, byte-bounded cache level.
pub struct LmdbCache {
    env: Env,
    db: Database<Bytes, Bytes>,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl LmdbCache {
    /// Open (or create) the cache at `path`.
    ///
    /// `map_size_mb` is the LMDB map size; `max_bytes` is the logical cap on
    /// stored entries and must be comfortably below it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("vitals_cache"))
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        let cache = Self {
            env,
            db,
            max_bytes,
            clock,
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        };
        let existing = cache.scan_total_bytes()?;
        cache.total_bytes.store(existing, Ordering::SeqCst);
        tracing::info!(
            path = %path.as_ref().display(),
            bytes = existing,
            max_bytes,
            "Opened durable cache"
        );
        Ok(cache)
    }

    fn scan_total_bytes(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut total = 0u64;
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let (k, v) = item.map_err(txn_err)?;
            total += (k.len() + v.len()) as u64;
        }
        Ok(total)
    }

    /// Collect keys starting with `prefix` together with their decoded entries.
    fn collect_with_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, CacheEntry)>, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let Ok((k, v)) = item else { continue };
            if !k.starts_with(prefix) {
                continue;
            }
            let Some(key) = CacheKey::decode(k) else { continue };
            if let Ok(entry) = decode_value(&key, v) {
                out.push((k.to_vec(), entry));
            }
        }
        Ok(out)
    }

    /// Delete keys in short write transactions, returning the count removed.
    fn delete_keys(&self, keys: &[Vec<u8>]) -> Result<u64, LmdbCacheError> {
        self.delete_keys_where(keys, |_| true)
    }

    /// Like [`Self::delete_keys`], but only deletes a key whose current
    /// value, read inside the write transaction, still satisfies `doomed`.
    fn delete_keys_where<F>(&self, keys: &[Vec<u8>], doomed: F) -> Result<u64, LmdbCacheError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut removed = 0u64;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let mut wtxn = self.env.write_txn().map_err(txn_err)?;
            let mut freed = 0u64;
            for key in chunk {
                let size = self
                    .db
                    .get(&wtxn, key)
                    .map_err(txn_err)?
                    .filter(|v| doomed(v))
                    .map(|v| (key.len() + v.len()) as u64);
                if let Some(size) = size {
                    if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                        freed += size;
                        removed += 1;
                    }
                }
            }
            wtxn.commit().map_err(txn_err)?;
            self.sub_bytes(freed);
        }
        Ok(removed)
    }

    fn sub_bytes(&self, n: u64) {
        let _ = self
            .total_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_sub(n))
            });
    }

    /// Keys that are expired at `now_ms` or undecodable.
    fn expired_keys(&self, now_ms: i64) -> Result<Vec<Vec<u8>>, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut doomed = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let Ok((k, v)) = item else { continue };
            if is_stale(v, now_ms) {
                doomed.push(k.to_vec());
            }
        }
        Ok(doomed)
    }

    /// Delete those of `keys` that are still stale at `now_ms`.
    fn delete_expired(&self, keys: &[Vec<u8>], now_ms: i64) -> Result<u64, LmdbCacheError> {
        self.delete_keys_where(keys, |v| is_stale(v, now_ms))
    }

    /// Evict oldest entries until the total is at or below `target` bytes.
    fn evict_to(&self, target: u64) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut candidates: Vec<(i64, Vec<u8>, u64)> = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let Ok((k, v)) = item else { continue };
            let created = decode_header(v).map_or(i64::MIN, |(created, _)| created);
            candidates.push((created, k.to_vec(), (k.len() + v.len()) as u64));
        }
        drop(rtxn);
        candidates.sort_by_key(|(created, _, _)| *created);

        let mut total = self.total_bytes.load(Ordering::SeqCst);
        let mut doomed = Vec::new();
        for (_, key, size) in candidates {
            if total <= target {
                break;
            }
            total = total.saturating_sub(size);
            doomed.push(key);
        }
        let removed = self.delete_keys(&doomed)?;
        self.evictions.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            tracing::debug!(removed, target, "Evicted durable cache entries over byte cap");
        }
        Ok(removed)
    }
}

fn encode_value(entry: &CacheEntry) -> Result<Vec<u8>, LmdbCacheError> {
    let points = serde_json::to_vec(&entry.points)
        .map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;
    let points_len = u32::try_from(points.len())
        .map_err(|_| LmdbCacheError::Serialization("points block too large".to_string()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + points.len() + entry.payload.len());
    bytes.extend_from_slice(&entry.created_at_ms.to_le_bytes());
    bytes.extend_from_slice(&entry.ttl_ms.to_le_bytes());
    bytes.push(entry.source.as_byte());
    bytes.extend_from_slice(&points_len.to_le_bytes());
    bytes.extend_from_slice(&points);
    bytes.extend_from_slice(&entry.payload);
    Ok(bytes)
}

/// Expired or undecodable.
fn is_stale(bytes: &[u8], now_ms: i64) -> bool {
    decode_header(bytes).map_or(true, |(created, ttl)| now_ms >= created.saturating_add(ttl))
}

/// `(created_at_ms, ttl_ms)` without decoding the body.
fn decode_header(bytes: &[u8]) -> Option<(i64, i64)> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let created = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let ttl = i64::from_le_bytes(bytes[8..16].try_into().ok()?);
    Some((created, ttl))
}

fn decode_value(key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry, LmdbCacheError> {
    let corrupt = |what: &str| LmdbCacheError::Deserialization(what.to_string());
    let (created_at_ms, ttl_ms) = decode_header(bytes).ok_or_else(|| corrupt("short header"))?;
    let source = CacheSource::from_byte(bytes[16]).ok_or_else(|| corrupt("unknown source"))?;
    let points_len = u32::from_le_bytes(
        bytes[17..21]
            .try_into()
            .map_err(|_| corrupt("bad points length"))?,
    ) as usize;
    let points_end = HEADER_LEN
        .checked_add(points_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| corrupt("points block overruns value"))?;
    let points: Vec<String> = serde_json::from_slice(&bytes[HEADER_LEN..points_end])
        .map_err(|e| LmdbCacheError::Deserialization(e.to_string()))?;

    Ok(CacheEntry {
        fingerprint: key.fingerprint(),
        site: key.site().to_string(),
        points,
        payload: bytes[points_end..].to_vec(),
        created_at_ms,
        ttl_ms,
        source,
    })
}

#[async_trait]
impl CacheBackend for LmdbCache {
    async fn get(&self, key: &CacheKey) -> VitalsResult<Option<CacheEntry>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let found = self.db.get(&rtxn, &key.encode()).map_err(txn_err)?;
        let Some(bytes) = found else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let entry = decode_value(key, bytes)?;
        if entry.is_expired(self.clock.now_ms()) {
            // Left for the sweeper so the read path never writes.
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry))
    }

    async fn put(&self, entry: CacheEntry) -> VitalsResult<()> {
        let key = CacheKey::for_entry(&entry).encode();
        let value = encode_value(&entry)?;
        let new_size = (key.len() + value.len()) as u64;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let old_size = self
            .db
            .get(&wtxn, &key)
            .map_err(txn_err)?
            .map(|v| (key.len() + v.len()) as u64);
        self.db.put(&mut wtxn, &key, &value).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        if let Some(old) = old_size {
            self.sub_bytes(old);
        }
        let total = self.total_bytes.fetch_add(new_size, Ordering::SeqCst) + new_size;
        if total > self.max_bytes {
            self.evict_to(self.max_bytes / 10 * 9)?;
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> VitalsResult<bool> {
        Ok(self.delete_keys(&[key.encode()])? > 0)
    }

    async fn invalidate(&self, site: &str, point_prefix: Option<&str>) -> VitalsResult<u64> {
        let doomed: Vec<Vec<u8>> = self
            .collect_with_prefix(&CacheKey::site_prefix(site))?
            .into_iter()
            .filter(|(_, entry)| entry.covers_point_prefix(point_prefix))
            .map(|(k, _)| k)
            .collect();
        Ok(self.delete_keys(&doomed)?)
    }

    async fn sweep_expired(&self, now_ms: i64) -> VitalsResult<u64> {
        let doomed = self.expired_keys(now_ms)?;
        let removed = self.delete_expired(&doomed, now_ms)?;
        self.expired.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> VitalsResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let entries = self.db.len(&rtxn).map_err(txn_err)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            bytes: self.total_bytes.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        })
    }
}
