//! PostgreSQL point registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use vitals_core::{ConfiguredPoint, PointRecord, VitalsResult};
use vitals_storage::PointStore;

use super::{read_error, write_error, DbClient};

const CHUNK: usize = 500;

const UPSERT_CONFIGURED: &str = "\
    INSERT INTO vitals_points (site, name, unit, configured) \
    SELECT $1, t.name, t.unit, TRUE FROM UNNEST($2::text[], $3::text[]) AS t(name, unit) \
    ON CONFLICT (site, name) DO UPDATE SET \
        configured = TRUE, \
        unit = COALESCE(EXCLUDED.unit, vitals_points.unit), \
        updated_at = now()";

// GREATEST ignores NULL, so a seeded row picks up its first timestamp.
const RECORD_SEEN: &str = "\
    INSERT INTO vitals_points (site, name, last_sample_ms) \
    SELECT $1, t.name, t.ts FROM UNNEST($2::text[], $3::int8[]) AS t(name, ts) \
    ON CONFLICT (site, name) DO UPDATE SET \
        last_sample_ms = GREATEST(vitals_points.last_sample_ms, EXCLUDED.last_sample_ms), \
        updated_at = now()";

const SELECT: &str = "\
    SELECT site, name, unit, configured, last_sample_ms FROM vitals_points \
    WHERE site = $1 ORDER BY name";

#[derive(Clone)]
pub struct PgPointStore {
    db: DbClient,
}

impl PgPointStore {
    pub fn new(db: DbClient) -> Self {
        Self { db }
    }
}

/// One row per name; ON CONFLICT cannot touch the same row twice per statement.
fn configured_columns(points: &[ConfiguredPoint]) -> (Vec<String>, Vec<Option<String>>) {
    let mut by_name: BTreeMap<&str, Option<String>> = BTreeMap::new();
    for point in points {
        let unit = by_name.entry(point.name.as_str()).or_default();
        if point.unit.is_some() {
            *unit = point.unit.clone();
        }
    }
    by_name
        .into_iter()
        .map(|(name, unit)| (name.to_string(), unit))
        .unzip()
}

fn seen_columns(seen: &[(String, i64)]) -> (Vec<String>, Vec<i64>) {
    let mut newest: BTreeMap<&str, i64> = BTreeMap::new();
    for (name, ts) in seen {
        newest
            .entry(name.as_str())
            .and_modify(|prev| *prev = (*prev).max(*ts))
            .or_insert(*ts);
    }
    newest
        .into_iter()
        .map(|(name, ts)| (name.to_string(), ts))
        .unzip()
}

#[async_trait]
impl PointStore for PgPointStore {
    async fn upsert_configured(&self, site: &str, points: &[ConfiguredPoint]) -> VitalsResult<u64> {
        let (names, units) = configured_columns(points);
        if names.is_empty() {
            return Ok(0);
        }
        let mut conn = self.db.get_conn().await?;
        let tx = conn.transaction().await.map_err(write_error)?;
        let stmt = tx.prepare(UPSERT_CONFIGURED).await.map_err(write_error)?;
        let mut written = 0u64;
        for (names, units) in names.chunks(CHUNK).zip(units.chunks(CHUNK)) {
            written += tx
                .execute(&stmt, &[&site, &names, &units])
                .await
                .map_err(write_error)?;
        }
        tx.commit().await.map_err(write_error)?;
        tracing::debug!(site, rows = written, "Upserted configured points");
        Ok(written)
    }

    async fn record_seen(&self, site: &str, seen: &[(String, i64)]) -> VitalsResult<u64> {
        let (names, timestamps) = seen_columns(seen);
        if names.is_empty() {
            return Ok(0);
        }
        let conn = self.db.get_conn().await?;
        conn.execute(RECORD_SEEN, &[&site, &names, &timestamps])
            .await
            .map_err(write_error)
    }

    async fn list_points(&self, site: &str) -> VitalsResult<Vec<PointRecord>> {
        let conn = self.db.get_conn().await?;
        let rows = conn.query(SELECT, &[&site]).await.map_err(read_error)?;
        Ok(rows
            .iter()
            .map(|row| PointRecord {
                site: row.get(0),
                name: row.get(1),
                unit: row.get(2),
                configured: row.get(3),
                last_sample_ms: row.get(4),
            })
            .collect())
    }
}
