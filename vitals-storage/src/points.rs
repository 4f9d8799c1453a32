//! Point registry storage.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use vitals_core::{ConfiguredPoint, PointRecord, VitalsResult};

/// Registry of the points each site has, keyed by `(site, name)`.
///
/// Seeding from the upstream configuration and ingestion both write here.
/// Neither ever removes a point, and neither clears what the other set: a
/// seeded point keeps its `last_sample_ms`, and an observed point becomes
/// `configured` once a seed lists it.
#[async_trait]
pub trait PointStore: Send + Sync {
    /// Mark `points` as configured for `site`, updating units. Returns the
    /// number of points written.
    async fn upsert_configured(&self, site: &str, points: &[ConfiguredPoint]) -> VitalsResult<u64>;

    /// Register points seen in ingested data, raising `last_sample_ms` to the
    /// given timestamp where it is newer.
    async fn record_seen(&self, site: &str, seen: &[(String, i64)]) -> VitalsResult<u64>;

    /// Every point of `site`, ordered by name.
    async fn list_points(&self, site: &str) -> VitalsResult<Vec<PointRecord>>;
}

/// In-memory point registry.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPointStore {
    rows: Arc<RwLock<BTreeMap<(String, String), PointRecord>>>,
}

impl InMemoryPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

fn blank(site: &str, name: &str) -> PointRecord {
    PointRecord {
        site: site.to_string(),
        name: name.to_string(),
        unit: None,
        configured: false,
        last_sample_ms: None,
    }
}

#[async_trait]
impl PointStore for InMemoryPointStore {
    async fn upsert_configured(&self, site: &str, points: &[ConfiguredPoint]) -> VitalsResult<u64> {
        let mut rows = self.rows.write().await;
        for point in points {
            let record = rows
                .entry((site.to_string(), point.name.clone()))
                .or_insert_with(|| blank(site, &point.name));
            record.configured = true;
            if point.unit.is_some() {
                record.unit = point.unit.clone();
            }
        }
        Ok(points.len() as u64)
    }

    async fn record_seen(&self, site: &str, seen: &[(String, i64)]) -> VitalsResult<u64> {
        let mut rows = self.rows.write().await;
        for (name, ts) in seen {
            let record = rows
                .entry((site.to_string(), name.clone()))
                .or_insert_with(|| blank(site, name));
            record.last_sample_ms = Some(record.last_sample_ms.map_or(*ts, |prev| prev.max(*ts)));
        }
        Ok(seen.len() as u64)
    }

    async fn list_points(&self, site: &str) -> VitalsResult<Vec<PointRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((s, _), _)| s == site)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
