//! Cache store statistics.

use serde::Serialize;

/// Point-in-time view of the cache store.
///
/// Counts reflect the memory tier; `persisted_count` is the number of
/// mirror items under the store's prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStoreStats {
    /// Entries currently held in memory, expired or not.
    pub total: usize,
    /// Memory entries that have not expired.
    pub valid: usize,
    /// Memory entries past their expiry but not yet swept.
    pub expired: usize,
    pub persisted_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStoreStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert_eq!(CacheStoreStats::default().hit_rate(), 0.0);
    }
}
