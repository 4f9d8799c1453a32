//! Site-scoped cache keys.
//!
//! Keys sort by site first so that invalidating a site is a prefix scan in
//! the durable level.

use vitals_core::{CacheEntry, Fingerprint};

/// Separator byte between the site and the fingerprint.
const SEPARATOR: u8 = 0x1F;

const FINGERPRINT_LEN: usize = 32;

/// A cache key: the site a payload belongs to plus the request fingerprint.
///
/// # Binary Format
///
/// - Bytes `0..n`: site name (UTF-8)
/// - Byte `n`: separator (`0x1F`)
/// - Bytes `n+1..n+33`: fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    site: String,
    fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn new(site: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            site: site.into(),
            fingerprint,
        }
    }

    pub fn for_entry(entry: &CacheEntry) -> Self {
        Self::new(entry.site.clone(), entry.fingerprint)
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.site.len() + 1 + FINGERPRINT_LEN);
        bytes.extend_from_slice(self.site.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.fingerprint.as_bytes());
        bytes
    }

    /// Returns `None` unless `bytes` is `site || 0x1F || 32-byte fingerprint`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FINGERPRINT_LEN + 1 {
            return None;
        }
        let split = bytes.len() - FINGERPRINT_LEN;
        if bytes[split - 1] != SEPARATOR {
            return None;
        }
        let site = std::str::from_utf8(&bytes[..split - 1]).ok()?.to_string();
        let fingerprint: [u8; FINGERPRINT_LEN] = bytes[split..].try_into().ok()?;
        Some(Self {
            site,
            fingerprint: Fingerprint::from_bytes(fingerprint),
        })
    }

    /// Prefix shared by every key of `site`.
    pub fn site_prefix(site: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(site.len() + 1);
        prefix.extend_from_slice(site.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let key = CacheKey::new("building-7", Fingerprint::from_bytes([3u8; 32]));
        let encoded = key.encode();
        assert_eq!(encoded.len(), "building-7".len() + 33);
        assert_eq!(CacheKey::decode(&encoded), Some(key));
    }

    #[test]
    fn test_site_prefix_does_not_match_longer_site() {
        let key = CacheKey::new("S10", Fingerprint::from_bytes([1u8; 32]));
        assert!(!key.encode().starts_with(&CacheKey::site_prefix("S1")));
        assert!(key.encode().starts_with(&CacheKey::site_prefix("S10")));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(CacheKey::decode(b"short"), None);
        let mut bytes = CacheKey::new("S1", Fingerprint::from_bytes([0u8; 32])).encode();
        bytes[2] = b'x';
        assert_eq!(CacheKey::decode(&bytes), None);
    }
}
