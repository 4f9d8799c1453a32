//! Tier routing and stitching.
//!
//! The upstream publishes coarse aggregated samples immediately and raw
//! samples only after a processing lag. A query is split at the lag
//! boundary into a raw plan for the settled past and an aggregated plan for
//! the recent window, and the results are stitched back into one series.

use std::collections::BTreeMap;

use vitals_core::{
    dedupe_last_write_wins, FetchPlan, PipelineConfig, QueryParams, Sample, Tier, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierRouter {
    lag_threshold_ms: i64,
    granularity_ms: i64,
}

impl TierRouter {
    pub fn new(lag_threshold_ms: i64, granularity_ms: i64) -> Self {
        Self {
            lag_threshold_ms,
            granularity_ms: granularity_ms.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.lag_threshold_ms, config.boundary_granularity_ms)
    }

    /// `now - lag`, quantized down to the boundary granularity.
    pub fn boundary_ms(&self, now_ms: i64) -> i64 {
        let raw = now_ms.saturating_sub(self.lag_threshold_ms);
        raw.div_euclid(self.granularity_ms) * self.granularity_ms
    }

    /// Split `[start_ms, end_ms)` at the boundary.
    ///
    /// Timestamps strictly before the boundary are raw; the boundary itself
    /// and everything after it are aggregated. Plans come back oldest first.
    pub fn route(&self, params: &QueryParams, now_ms: i64) -> Result<Vec<FetchPlan>, ValidationError> {
        params.validate_range()?;
        let boundary = self.boundary_ms(now_ms);
        let (start, end) = (params.start_ms, params.end_ms);

        let plans = if end <= boundary {
            vec![FetchPlan::new(start, end, Tier::Raw)]
        } else if start >= boundary {
            vec![FetchPlan::new(start, end, Tier::Aggregated)]
        } else {
            vec![
                FetchPlan::new(start, boundary, Tier::Raw),
                FetchPlan::new(boundary, end, Tier::Aggregated),
            ]
        };
        tracing::debug!(
            site = %params.site,
            boundary,
            plans = plans.len(),
            "Routed query"
        );
        Ok(plans)
    }
}

/// Merge per-plan results into one series per point.
///
/// Each sample is kept only if a plan of its own tier covers its timestamp.
/// Duplicates within a tier collapse last-write-wins; where both tiers hold
/// the same `(point, timestamp_ms)` the aggregated sample wins. The result
/// is ordered by point, then strictly ascending timestamp.
pub fn stitch(plans: &[FetchPlan], samples: Vec<Sample>) -> Vec<Sample> {
    let clipped: Vec<Sample> = samples
        .into_iter()
        .filter(|s| {
            plans
                .iter()
                .any(|p| p.tier == s.tier && p.contains(s.timestamp_ms))
        })
        .collect();

    let mut merged: BTreeMap<(String, i64), Sample> = BTreeMap::new();
    for sample in dedupe_last_write_wins(clipped) {
        let key = (sample.point.clone(), sample.timestamp_ms);
        match merged.get(&key) {
            Some(existing) if existing.tier == Tier::Aggregated && sample.tier == Tier::Raw => {}
            _ => {
                merged.insert(key, sample);
            }
        }
    }
    merged.into_values().collect()
}
