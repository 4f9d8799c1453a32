//! Cache payload encoding.

use serde::{Deserialize, Serialize};
use vitals_core::{CacheError, Sample};

const PAYLOAD_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct SeriesPayload {
    v: u8,
    samples: Vec<Sample>,
}

pub fn encode_samples(samples: &[Sample]) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(&SeriesPayload {
        v: PAYLOAD_VERSION,
        samples: samples.to_vec(),
    })
    .map_err(|e| CacheError::Serialization {
        reason: e.to_string(),
    })
}

pub fn decode_samples(bytes: &[u8]) -> Result<Vec<Sample>, CacheError> {
    let payload: SeriesPayload = serde_json::from_slice(bytes).map_err(|e| CacheError::Corrupt {
        reason: e.to_string(),
    })?;
    if payload.v != PAYLOAD_VERSION {
        return Err(CacheError::Corrupt {
            reason: format!("unsupported payload version {}", payload.v),
        });
    }
    Ok(payload.samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_version() {
        let bytes = br#"{"v": 9, "samples": []}"#;
        assert!(matches!(decode_samples(bytes), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(decode_samples(b"\x00\x01").is_err());
    }
}
