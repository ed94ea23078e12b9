//! Cache usage counters.

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a live entry.
    pub hits: u64,
    /// Number of reads that found nothing or an expired entry.
    pub misses: u64,
    /// Number of entries currently held (including not yet swept expired ones).
    pub entry_count: u64,
    /// Number of entries removed because their TTL elapsed.
    pub evictions: u64,
}

impl CacheStats {
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
