//! Query result cache.
//!
//! Two levels, both keyed by [`CacheKey`] (site + request fingerprint):
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ L1: MemoryCache               │  entry-count bounded, LRU eviction
//! └──────────────┬───────────────┘
//!                │ miss
//! ┌──────────────▼───────────────┐
//! │ L2: LmdbCache                 │  byte bounded, durable, swept for TTL
//! └──────────────────────────────┘
//! ```
//!
//! TTL is checked on every read against the injected clock, so an expired
//! entry is a miss immediately; the periodic sweep only reclaims space.
//!
//! The cache is advisory. Payloads for a fingerprint are deterministic, so
//! racing writers are not serialized and the last put wins.

mod key;
mod lmdb_backend;
mod memory;
mod tiered;
mod traits;

pub use key::CacheKey;
pub use lmdb_backend::{LmdbCache, LmdbCacheError};
pub use memory::MemoryCache;
pub use tiered::{CacheConfig, CacheLevel, TieredCache, TieredStats};
pub use traits::{CacheBackend, CacheStats};
