//! Stable request fingerprints used as cache keys.

use crate::entities::{FetchPlan, QueryParams};
use crate::enums::Resolution;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 over the canonical request description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Fingerprint of a whole query: site, sorted points, range, tier plan
    /// and resolution. Point order never affects the result.
    pub fn of_query(params: &QueryParams, plans: &[FetchPlan], resolution: Resolution) -> Self {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, b"query");
        write_field(&mut hasher, params.site.trim().as_bytes());
        let points = params.canonical_points();
        hasher.update((points.len() as u64).to_le_bytes());
        for point in &points {
            write_field(&mut hasher, point.as_bytes());
        }
        hasher.update(params.start_ms.to_le_bytes());
        hasher.update(params.end_ms.to_le_bytes());
        hasher.update((plans.len() as u64).to_le_bytes());
        for plan in plans {
            hasher.update(plan.start_ms.to_le_bytes());
            hasher.update(plan.end_ms.to_le_bytes());
            write_field(&mut hasher, plan.tier.as_db_str().as_bytes());
        }
        write_field(&mut hasher, resolution.as_str().as_bytes());
        Self(hasher.finalize().into())
    }

    /// Fingerprint of a single plan segment of a query.
    pub fn of_segment(params: &QueryParams, plan: &FetchPlan, resolution: Resolution) -> Self {
        let segment = QueryParams {
            site: params.site.clone(),
            points: params.points.clone(),
            start_ms: plan.start_ms,
            end_ms: plan.end_ms,
        };
        Self::of_query(&segment, std::slice::from_ref(plan), resolution)
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("Invalid fingerprint: {}", e))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "Invalid fingerprint: expected 32 bytes".to_string())?;
        Ok(Self(array))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
