//! PostgreSQL sample store.

use async_trait::async_trait;
use vitals_core::{dedupe_last_write_wins, Quality, Sample, Tier, VitalsResult};
use vitals_storage::{SampleQuery, SampleStore};

use super::{corrupt_row, read_error, write_error, DbClient};

const UPSERT: &str = "\
    INSERT INTO vitals_samples (site, point, timestamp_ms, tier, value, quality) \
    SELECT * FROM UNNEST($1::text[], $2::text[], $3::int8[], $4::text[], $5::float8[], $6::text[]) \
    ON CONFLICT (site, point, timestamp_ms, tier) \
    DO UPDATE SET value = EXCLUDED.value, quality = EXCLUDED.quality, updated_at = now()";

// Raw sorts before aggregated, matching `Tier`'s ordering.
const SELECT: &str = "\
    SELECT site, point, timestamp_ms, value, quality, tier FROM vitals_samples \
    WHERE site = $1 AND timestamp_ms >= $2 AND timestamp_ms < $3 \
      AND (cardinality($4::text[]) = 0 OR point = ANY($4::text[])) \
      AND ($5::text IS NULL OR tier = $5::text) \
    ORDER BY point, timestamp_ms, (tier = 'aggregated')";

/// Columns of one UNNEST batch.
#[derive(Default)]
struct Columns {
    sites: Vec<String>,
    points: Vec<String>,
    timestamps: Vec<i64>,
    tiers: Vec<String>,
    values: Vec<f64>,
    qualities: Vec<String>,
}

impl Columns {
    fn from_samples(samples: &[Sample]) -> Self {
        let mut c = Columns::default();
        for s in samples {
            c.sites.push(s.site.clone());
            c.points.push(s.point.clone());
            c.timestamps.push(s.timestamp_ms);
            c.tiers.push(s.tier.as_db_str().to_string());
            c.values.push(s.value);
            c.qualities.push(s.quality.as_db_str().to_string());
        }
        c
    }
}

#[derive(Clone)]
pub struct PgSampleStore {
    db: DbClient,
    batch_size: usize,
}

impl PgSampleStore {
    pub fn new(db: DbClient, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl SampleStore for PgSampleStore {
    async fn upsert_samples(&self, samples: &[Sample]) -> VitalsResult<u64> {
        let samples = dedupe_last_write_wins(samples.to_vec());
        if samples.is_empty() {
            return Ok(0);
        }

        let mut conn = self.db.get_conn().await?;
        let tx = conn.transaction().await.map_err(write_error)?;
        let stmt = tx.prepare(UPSERT).await.map_err(write_error)?;
        let mut written = 0u64;
        for chunk in samples.chunks(self.batch_size) {
            let c = Columns::from_samples(chunk);
            written += tx
                .execute(
                    &stmt,
                    &[&c.sites, &c.points, &c.timestamps, &c.tiers, &c.values, &c.qualities],
                )
                .await
                .map_err(write_error)?;
        }
        tx.commit().await.map_err(write_error)?;

        tracing::debug!(rows = written, "Upserted samples");
        Ok(written)
    }

    async fn query_samples(&self, query: &SampleQuery) -> VitalsResult<Vec<Sample>> {
        let conn = self.db.get_conn().await?;
        let tier = query.tier.map(|t| t.as_db_str().to_string());
        let rows = conn
            .query(
                SELECT,
                &[&query.site, &query.start_ms, &query.end_ms, &query.points, &tier],
            )
            .await
            .map_err(read_error)?;

        rows.iter()
            .map(|row| {
                let quality: String = row.get(4);
                let tier: String = row.get(5);
                Ok(Sample {
                    site: row.get(0),
                    point: row.get(1),
                    timestamp_ms: row.get(2),
                    value: row.get(3),
                    quality: Quality::from_db_str(&quality).map_err(|e| corrupt_row("sample", e))?,
                    tier: Tier::from_db_str(&tier).map_err(|e| corrupt_row("sample", e))?,
                })
            })
            .collect()
    }

    async fn list_sites(&self) -> VitalsResult<Vec<String>> {
        let conn = self.db.get_conn().await?;
        let rows = conn
            .query("SELECT DISTINCT site FROM vitals_samples ORDER BY site", &[])
            .await
            .map_err(read_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn points_with_data(&self, site: &str, start_ms: i64, end_ms: i64) -> VitalsResult<Vec<String>> {
        let conn = self.db.get_conn().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT point FROM vitals_samples \
                 WHERE site = $1 AND timestamp_ms >= $2 AND timestamp_ms < $3 ORDER BY point",
                &[&site, &start_ms, &end_ms],
            )
            .await
            .map_err(read_error)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn health_check(&self) -> VitalsResult<()> {
        self.db.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_are_parallel() {
        let samples = vec![
            Sample {
                site: "S1".into(),
                point: "P1".into(),
                timestamp_ms: 1,
                value: 1.5,
                quality: Quality::Bad,
                tier: Tier::Aggregated,
            },
            Sample {
                site: "S1".into(),
                point: "P2".into(),
                timestamp_ms: 2,
                value: 2.5,
                quality: Quality::Good,
                tier: Tier::Raw,
            },
        ];
        let c = Columns::from_samples(&samples);
        assert_eq!(c.points, vec!["P1", "P2"]);
        assert_eq!(c.tiers, vec!["aggregated", "raw"]);
        assert_eq!(c.qualities, vec!["bad", "good"]);
        assert_eq!(c.timestamps, vec![1, 2]);
        assert_eq!(c.values.len(), c.sites.len());
    }
}
