//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use vitals_pipeline::{PointRegistry, QueryService};
use vitals_storage::{SampleStore, TieredCache};

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    /// Sample store, for readiness checks.
    pub samples: Arc<dyn SampleStore>,
    /// The same cache handle the query service holds.
    pub cache: Arc<TieredCache>,
    pub registry: Arc<PointRegistry>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        service: Arc<QueryService>,
        samples: Arc<dyn SampleStore>,
        registry: Arc<PointRegistry>,
    ) -> Self {
        let cache = service.cache().clone();
        Self {
            service,
            samples,
            cache,
            registry,
            start_time: Instant::now(),
        }
    }
}

crate::impl_from_ref!(Arc<QueryService>, service);
crate::impl_from_ref!(Arc<dyn SampleStore>, samples);
crate::impl_from_ref!(Arc<TieredCache>, cache);
crate::impl_from_ref!(Arc<PointRegistry>, registry);
crate::impl_from_ref!(Instant, start_time);
