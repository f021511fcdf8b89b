//! Adaptive context cache.
//!
//! A bounded in-memory store that keeps hot session and context data off the
//! durable store. Entries are evicted least-recently-used within priority
//! tiers, expire by TTL, and are compressed in the background once they grow
//! past a size threshold. Per-key access counters feed a hot/cold analysis
//! used by [`AdaptiveCache::optimize`].

mod analytics;
#[allow(clippy::module_inception)]
pub mod cache;
mod compression;
pub mod config;
pub mod types;

pub use cache::{AdaptiveCache, CacheMaintenance};
pub use config::{CacheConfig, CacheConfigError};
pub use types::{
    AccessPatternReport, AccessTemperature, CacheEntry, CacheError, CachePriority, CacheStats,
    KeyAccessStats, OptimizeReport, PutOptions,
};
