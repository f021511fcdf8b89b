//! Core data types for the adaptive cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::config::CacheConfigError;

/// Eviction tier of a cache entry. Lower tiers are evicted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    /// First to go under pressure.
    Low,
    /// Default tier.
    #[default]
    Normal,
    /// Only evicted once no low or normal entries remain.
    High,
}

impl CachePriority {
    /// One tier up, saturating at `High`.
    #[must_use]
    pub fn promoted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal | Self::High => Self::High,
        }
    }

    /// One tier down, saturating at `Low`.
    #[must_use]
    pub fn demoted(self) -> Self {
        match self {
            Self::High => Self::Normal,
            Self::Normal | Self::Low => Self::Low,
        }
    }
}

/// Options accepted by `AdaptiveCache::put`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Time to live; falls back to the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Eviction tier.
    pub priority: CachePriority,
    /// Compress the payload immediately instead of waiting for the sweep.
    pub compress: bool,
}

impl PutOptions {
    /// Options with the given TTL and default priority.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), ..Self::default() }
    }

    /// Options with the given priority and no TTL.
    #[must_use]
    pub fn with_priority(priority: CachePriority) -> Self {
        Self { priority, ..Self::default() }
    }
}

/// A single cached value with bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serialized payload, deflated when `compressed` is set.
    pub(crate) payload: Vec<u8>,
    /// Size of `payload` in bytes, used for memory accounting.
    pub size_bytes: usize,
    /// Eviction tier.
    pub priority: CachePriority,
    /// Instant after which the entry reads as a miss.
    pub expires_at: Option<Instant>,
    /// Instant the entry was written.
    pub created_at: Instant,
    /// Instant of the last successful read or write.
    pub last_accessed: Instant,
    /// Number of successful reads plus the initial write.
    pub access_count: u64,
    /// Whether `payload` is currently compressed.
    pub compressed: bool,
    /// Whether the entry was compressed at insertion time.
    pub created_compressed: bool,
}

impl CacheEntry {
    pub(crate) fn new(
        payload: Vec<u8>,
        priority: CachePriority,
        ttl: Option<Duration>,
        compressed: bool,
        now: Instant,
    ) -> Self {
        Self {
            size_bytes: payload.len(),
            payload,
            priority,
            expires_at: ttl.map(|ttl| now + ttl),
            created_at: now,
            last_accessed: now,
            access_count: 1,
            compressed,
            created_compressed: compressed,
        }
    }

    /// Whether the entry has outlived its TTL at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Update the last accessed timestamp and increment access count.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub total_hits: u64,
    /// Total number of cache misses (absent or expired keys).
    pub total_misses: u64,
    /// Entries removed to stay within bounds or by `optimize`.
    pub total_evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub total_expirations: u64,
    /// Successful in-place compressions.
    pub total_compressions: u64,
    /// Compression attempts that failed and left the entry as it was.
    pub compression_failures: u64,
    /// Current number of entries.
    pub entry_count: usize,
    /// Current estimated payload bytes.
    pub memory_bytes: usize,
    /// `hits / (hits + misses)`, zero before the first lookup.
    pub hit_rate: f64,
}

/// Access classification of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTemperature {
    /// Frequently read within the recent window.
    Hot,
    /// Neither hot nor cold.
    Warm,
    /// Not touched for a long time.
    Cold,
}

/// Per-key access counters.
#[derive(Debug, Clone, Serialize)]
pub struct KeyAccessStats {
    /// Cache key.
    pub key: String,
    /// Successful reads.
    pub reads: u64,
    /// Writes.
    pub writes: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Accesses inside the current hot window.
    pub recent_accesses: usize,
    /// Time since the last access.
    #[serde(skip)]
    pub idle_for: Duration,
    /// Classification at the time of the report.
    pub temperature: AccessTemperature,
}

/// Snapshot of the access-pattern analysis.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessPatternReport {
    /// Keys classified as hot, most-accessed first.
    pub hot_keys: Vec<String>,
    /// Keys classified as cold.
    pub cold_keys: Vec<String>,
    /// Per-key counters, sorted by key.
    pub keys: Vec<KeyAccessStats>,
}

/// Outcome of an `optimize` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeReport {
    /// Entries moved up one priority tier.
    pub promoted: usize,
    /// Entries moved down one priority tier.
    pub demoted: usize,
    /// Cold low-priority entries removed.
    pub evicted: usize,
}

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value alone exceeds the memory bound.
    #[error("Entry '{key}' is {size} bytes, larger than the cache memory bound of {limit} bytes")]
    EntryTooLarge {
        /// Cache key.
        key: String,
        /// Encoded size.
        size: usize,
        /// Configured bound.
        limit: usize,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid cache configuration: {0}")]
    Config(#[from] CacheConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(CachePriority::Low < CachePriority::Normal);
        assert!(CachePriority::Normal < CachePriority::High);
        assert_eq!(CachePriority::Low.promoted(), CachePriority::Normal);
        assert_eq!(CachePriority::High.promoted(), CachePriority::High);
        assert_eq!(CachePriority::Low.demoted(), CachePriority::Low);
    }

    #[test]
    fn test_entry_expiry() {
        let now = Instant::now();
        let entry = CacheEntry::new(vec![1, 2, 3], CachePriority::Normal, Some(Duration::from_millis(10)), false, now);
        assert_eq!(entry.size_bytes, 3);
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + Duration::from_millis(10)));
    }

    #[test]
    fn test_entry_touch() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(vec![], CachePriority::Low, None, false, now);
        entry.touch(now + Duration::from_secs(1));
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed, now + Duration::from_secs(1));
        assert!(!entry.is_expired(now + Duration::from_secs(3600)));
    }
}
