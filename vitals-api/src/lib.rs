//! VITALS API - HTTP Service Layer
//!
//! Exposes the query pipeline over REST (Axum), runs the background job
//! runner, cache sweeper, retention purge and continuous sync, and backs
//! sample and job storage with PostgreSQL through a deadpool connection pool.

#[macro_use]
mod macros;

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::{ApiConfig, LogFormat, StorageBackend};
pub use db::{DbClient, DbConfig, PgJobStore, PgPointStore, PgSampleStore};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use routes::create_api_router;
pub use state::AppState;
