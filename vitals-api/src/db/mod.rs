//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling via deadpool-postgres, the embedded schema
//! migration, and the PostgreSQL implementations of the storage traits:
//! - [`PgSampleStore`]: `UNNEST` batch upserts into `vitals_samples`
//! - [`PgJobStore`]: job table with `FOR UPDATE SKIP LOCKED` claims
//! - [`PgPointStore`]: the point registry in `vitals_points`

mod jobs;
mod points;
mod samples;

pub use jobs::PgJobStore;
pub use points::PgPointStore;
pub use samples::PgSampleStore;

use crate::error::{ApiError, ApiResult};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use std::time::Duration;
use tokio_postgres::NoTls;
use vitals_core::{env_or, StorageError, VitalsError, VitalsResult};

const SCHEMA: &str = include_str!("../../migrations/001_init.sql");

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait, create and recycle timeout for pooled connections
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "vitals".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Load from `VITALS_DB_HOST`, `VITALS_DB_PORT`, `VITALS_DB_NAME`,
    /// `VITALS_DB_USER`, `VITALS_DB_PASSWORD`, `VITALS_DB_POOL_SIZE` and
    /// `VITALS_DB_TIMEOUT` (seconds).
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            host: env_or("VITALS_DB_HOST", d.host),
            port: env_or("VITALS_DB_PORT", d.port),
            dbname: env_or("VITALS_DB_NAME", d.dbname),
            user: env_or("VITALS_DB_USER", d.user),
            password: std::env::var("VITALS_DB_PASSWORD").unwrap_or_default(),
            max_size: env_or("VITALS_DB_POOL_SIZE", d.max_size),
            timeout: Duration::from_secs(env_or("VITALS_DB_TIMEOUT", d.timeout.as_secs())),
        }
    }

    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: self.max_size.max(1),
            timeouts: Timeouts {
                wait: Some(self.timeout),
                create: Some(self.timeout),
                recycle: Some(self.timeout),
            },
            ..PoolConfig::default()
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// DATABASE CLIENT WRAPPER
// ============================================================================

/// Shared handle to the connection pool.
#[derive(Clone)]
pub struct DbClient {
    pool: Pool,
}

impl DbClient {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> ApiResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    pub(crate) async fn get_conn(&self) -> VitalsResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> VitalsResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(write_error)?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    pub async fn health_check(&self) -> VitalsResult<()> {
        let conn = self.get_conn().await?;
        conn.query_one("SELECT 1", &[]).await.map_err(read_error)?;
        Ok(())
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

pub(crate) fn pool_error(err: deadpool_postgres::PoolError) -> VitalsError {
    tracing::error!("Connection pool error: {:?}", err);
    StorageError::Unavailable {
        reason: err.to_string(),
    }
    .into()
}

pub(crate) fn read_error(err: tokio_postgres::Error) -> VitalsError {
    tracing::error!("Database read error: {:?}", err);
    StorageError::ReadFailed {
        reason: err.to_string(),
    }
    .into()
}

pub(crate) fn write_error(err: tokio_postgres::Error) -> VitalsError {
    tracing::error!("Database write error: {:?}", err);
    StorageError::WriteFailed {
        reason: err.to_string(),
    }
    .into()
}

/// A stored row that no longer parses.
pub(crate) fn corrupt_row(what: &str, detail: impl std::fmt::Display) -> VitalsError {
    StorageError::ReadFailed {
        reason: format!("corrupt {}: {}", what, detail),
    }
    .into()
}
