//! VITALS Pipeline - Query Orchestration
//!
//! - [`router`]: splits a range at the raw/aggregated tier boundary and
//!   stitches the tiers back together
//! - [`dispatcher`]: sizes a request and picks direct, batched or queued
//! - [`worker`]: resumable, cancellable, budgeted processing of queued jobs
//! - [`query`]: the entry point tying cache, jobs and dispatch together
//! - [`sync`]: periodic ingestion of recent data for every known site
//! - [`registry`]: configured-point seeding and coverage diagnostics

pub mod dispatcher;
pub mod ingest;
pub mod payload;
pub mod query;
pub mod registry;
pub mod router;
pub mod sync;
pub mod worker;

pub use dispatcher::{
    classify, estimate_samples, DispatchOutcome, DispatchPath, DispatchRequest, Dispatcher,
    FetchResult,
};
pub use ingest::{normalize_page, IngestStats, Ingestor};
pub use payload::{decode_samples, encode_samples};
pub use query::{
    JobStatusView, QueryRequest, QueryResponse, QueryService, QueryStatus, ResponseSource,
    Series, SeriesSample,
};
pub use registry::{PointRegistry, SeedReport};
pub use router::{stitch, TierRouter};
pub use sync::{ContinuousSync, SyncReport};
pub use worker::{retry_delay, JobWorker, WorkerOutcome, YieldReason, CANCELLED_ERROR};
