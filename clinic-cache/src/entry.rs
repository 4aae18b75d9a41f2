//! Cache entry model shared by both tiers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached value with its absolute expiry and LRU stamp.
///
/// The persisted document is this struct serialized as JSON with camelCase
/// field names. `last_accessed` is a monotonic counter, not a timestamp, so
/// ties between entries touched in the same millisecond cannot occur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Absolute expiry in milliseconds since the Unix epoch.
    pub expires_at: i64,
    pub last_accessed: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, expires_at: i64, last_accessed: u64) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at,
            last_accessed,
        }
    }

    /// An entry is expired once the clock has moved strictly past its expiry.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_is_strict() {
        let entry = CacheEntry::new("k", json!(1), 1_000, 0);
        assert!(!entry.is_expired(999));
        assert!(!entry.is_expired(1_000));
        assert!(entry.is_expired(1_001));
    }

    #[test]
    fn test_persisted_document_uses_camel_case() {
        let entry = CacheEntry::new("patients:findAll:{}", json!([{"id": "p-1"}]), 42, 7);
        let doc = serde_json::to_value(&entry).expect("entry should serialize");
        assert_eq!(doc["expiresAt"], json!(42));
        assert_eq!(doc["lastAccessed"], json!(7));
        assert_eq!(doc["value"][0]["id"], json!("p-1"));
    }
}
