//! VITALS Storage - Persistence Traits and Cache
//!
//! Defines the storage seams the pipeline writes through:
//! - [`SampleStore`]: idempotent time-series upserts keyed by
//!   `(site, point, timestamp_ms, tier)`
//! - [`JobStore`]: the job table, its history archive and dead letters
//! - [`PointStore`]: the registry of configured and observed points per site
//! - [`cache`]: the two-level query cache
//!
//! In-memory implementations live here; the PostgreSQL implementations live
//! in the API crate next to the connection pool.

pub mod cache;
mod jobs;
mod points;
mod samples;

pub use cache::{CacheConfig, CacheKey, TieredCache};
pub use jobs::{InMemoryJobStore, JobStore};
pub use points::{InMemoryPointStore, PointStore};
pub use samples::{InMemorySampleStore, SampleQuery, SampleStore};
