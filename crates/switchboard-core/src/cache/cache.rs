//! AdaptiveCache implementation with priority-aware LRU eviction.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::analytics::AccessTracker;
use super::compression;
use super::config::CacheConfig;
use super::types::{
    AccessPatternReport, AccessTemperature, CacheEntry, CacheError, CachePriority, CacheStats,
    OptimizeReport, PutOptions,
};

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    memory_bytes: usize,
    stats: CacheStats,
    tracker: AccessTracker,
}

impl CacheState {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Least valuable entry: lowest priority tier first, then least recently used.
    fn find_victim(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by(|(ka, a), (kb, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.last_accessed.cmp(&b.last_accessed))
                    .then_with(|| ka.cmp(kb))
            })
            .map(|(key, _)| key.clone())
    }
}

/// Bounded in-memory cache for session and context data.
///
/// Values are stored as serialized JSON bytes so that size accounting and
/// compression work uniformly. Entries leave the cache through eviction,
/// expiry, `optimize`, or explicit removal.
#[derive(Debug)]
pub struct AdaptiveCache {
    state: Mutex<CacheState>,
    config: CacheConfig,
}

impl AdaptiveCache {
    /// Create a new cache with the given configuration.
    ///
    /// # Errors
    /// Returns `CacheError::Config` if the configuration is invalid.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let tracker = AccessTracker::new(
            config.hot_window(),
            config.hot_access_threshold,
            config.cold_after(),
        );

        Ok(Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                memory_bytes: 0,
                stats: CacheStats::default(),
                tracker,
            }),
            config,
        })
    }

    /// Stores `value` under `key`, evicting as needed to stay within bounds.
    ///
    /// # Errors
    /// Returns an error if the value cannot be serialized or is larger than
    /// the whole memory bound.
    pub async fn put<T>(&self, key: impl Into<String>, value: &T, options: PutOptions) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let key = key.into();
        let raw = serde_json::to_vec(value)?;

        let (payload, compressed) = if options.compress {
            match compression::compress(&raw) {
                Ok(packed) => (packed, true),
                Err(e) => {
                    warn!(key = %key, error = %e, "Compression on insert failed, storing raw payload");
                    (raw, false)
                }
            }
        } else {
            (raw, false)
        };

        if payload.len() > self.config.max_memory_bytes {
            return Err(CacheError::EntryTooLarge {
                key,
                size: payload.len(),
                limit: self.config.max_memory_bytes,
            });
        }

        let ttl = options.ttl.or_else(|| self.config.default_ttl());
        let now = Instant::now();
        let entry = CacheEntry::new(payload, options.priority, ttl, compressed, now);
        let size = entry.size_bytes;

        let mut state = self.state.lock().await;
        state.remove_entry(&key);

        while state.entries.len() >= self.config.max_entries
            || state.memory_bytes + size > self.config.max_memory_bytes
        {
            let Some(victim) = state.find_victim() else { break };
            if let Some(evicted) = state.remove_entry(&victim) {
                state.stats.total_evictions += 1;
                info!(
                    key = %victim,
                    priority = ?evicted.priority,
                    size_bytes = evicted.size_bytes,
                    "Evicted cache entry"
                );
            }
        }

        state.memory_bytes += size;
        state.entries.insert(key.clone(), entry);
        state.tracker.record_write(&key, now);

        debug!(key = %key, size_bytes = size, priority = ?options.priority, compressed, "Cached entry");
        Ok(())
    }

    /// Returns the value stored under `key`, or `None` on a miss.
    ///
    /// Expired entries read as misses even before the sweep removes them.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let bytes = self.get_bytes(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached payload is not valid JSON");
                None
            }
        }
    }

    /// Returns the value under `key` deserialized as `T`.
    ///
    /// # Errors
    /// Returns `CacheError::Serialization` if the cached value does not match `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get_bytes(key).await {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let live = state.entries.get(key).is_some_and(|entry| !entry.is_expired(now));
        if !live {
            state.stats.total_misses += 1;
            state.tracker.record_miss(key, now);
            debug!(key = %key, "Cache miss");
            return None;
        }

        let (payload, compressed) = {
            let entry = state.entries.get_mut(key)?;
            entry.touch(now);
            (entry.payload.clone(), entry.compressed)
        };

        let bytes = if compressed {
            match compression::decompress(&payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping cache entry that failed to decompress");
                    state.remove_entry(key);
                    state.stats.total_misses += 1;
                    state.tracker.record_miss(key, now);
                    return None;
                }
            }
        } else {
            payload
        };

        state.stats.total_hits += 1;
        state.tracker.record_read(key, now);
        Some(bytes)
    }

    /// Whether a live (unexpired) entry exists, without counting as an access.
    pub async fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        let state = self.state.lock().await;
        state.entries.get(key).is_some_and(|entry| !entry.is_expired(now))
    }

    /// Priority tier currently assigned to `key`.
    pub async fn priority_of(&self, key: &str) -> Option<CachePriority> {
        let state = self.state.lock().await;
        state.entries.get(key).map(|entry| entry.priority)
    }

    /// Remove a specific entry.
    ///
    /// # Returns
    /// `true` if the entry was removed, `false` if it was not found.
    pub async fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.remove_entry(key).is_some();
        if removed {
            debug!(key = %key, "Removed cache entry");
        }
        removed
    }

    /// Clear all entries from the cache.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let cleared_count = state.entries.len();
        state.entries.clear();
        state.memory_bytes = 0;
        info!(cleared_count, "Cleared all cache entries");
    }

    /// Number of entries, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Get current cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let mut stats = state.stats.clone();
        stats.entry_count = state.entries.len();
        stats.memory_bytes = state.memory_bytes;
        let lookups = stats.total_hits + stats.total_misses;
        stats.hit_rate = if lookups == 0 { 0.0 } else { stats.total_hits as f64 / lookups as f64 };
        stats
    }

    /// Removes expired entries and frees their memory accounting.
    ///
    /// # Returns
    /// The number of entries removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove_entry(key);
        }
        state.stats.total_expirations += expired.len() as u64;

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Expired cache entries swept");
        }
        expired.len()
    }

    /// Expiry sweep plus pruning of analytics for keys that are gone and cold.
    ///
    /// # Returns
    /// The number of expired entries removed.
    pub async fn force_cleanup(&self) -> usize {
        let removed = self.cleanup_expired().await;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let CacheState { entries, tracker, .. } = &mut *state;
        tracker.retain_live(now, |key| entries.contains_key(key));
        info!(removed, entries = entries.len(), "Forced cache cleanup");
        removed
    }

    /// Compresses large entries that were not stored compressed.
    ///
    /// # Returns
    /// The number of entries compressed.
    pub async fn compress_entries(&self) -> usize {
        self.compress_entries_with(compression::compress).await
    }

    pub(crate) async fn compress_entries_with<F>(&self, compress: F) -> usize
    where
        F: Fn(&[u8]) -> std::io::Result<Vec<u8>>,
    {
        let threshold = self.config.compression_threshold_bytes;
        let mut state = self.state.lock().await;
        let CacheState { entries, memory_bytes, stats, .. } = &mut *state;
        let mut compressed = 0;

        for (key, entry) in entries.iter_mut() {
            if entry.compressed || entry.created_compressed || entry.size_bytes < threshold {
                continue;
            }

            match compress(&entry.payload) {
                Ok(packed) if packed.len() < entry.size_bytes => {
                    *memory_bytes = memory_bytes.saturating_sub(entry.size_bytes) + packed.len();
                    debug!(key = %key, before = entry.size_bytes, after = packed.len(), "Compressed cache entry");
                    entry.size_bytes = packed.len();
                    entry.payload = packed;
                    entry.compressed = true;
                    stats.total_compressions += 1;
                    compressed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    stats.compression_failures += 1;
                    warn!(key = %key, error = %e, "Compression failed, leaving entry uncompressed");
                }
            }
        }

        compressed
    }

    /// Access-pattern analysis over all keys seen by the cache.
    pub async fn access_patterns(&self) -> AccessPatternReport {
        let now = Instant::now();
        self.state.lock().await.tracker.report(now)
    }

    /// Rebalances priorities from hot/cold classification.
    ///
    /// Hot entries move up a tier, cold entries move down a tier, and cold
    /// entries already at `Low` are evicted.
    pub async fn optimize(&self) -> OptimizeReport {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut report = OptimizeReport::default();
        let mut to_evict = Vec::new();

        let CacheState { entries, tracker, .. } = &mut *state;
        for (key, entry) in entries.iter_mut() {
            match tracker.temperature(key, now) {
                AccessTemperature::Hot if entry.priority < CachePriority::High => {
                    entry.priority = entry.priority.promoted();
                    report.promoted += 1;
                }
                AccessTemperature::Cold if entry.priority == CachePriority::Low => {
                    to_evict.push(key.clone());
                }
                AccessTemperature::Cold => {
                    entry.priority = entry.priority.demoted();
                    report.demoted += 1;
                }
                _ => {}
            }
        }

        for key in &to_evict {
            state.remove_entry(key);
        }
        report.evicted = to_evict.len();
        state.stats.total_evictions += to_evict.len() as u64;

        info!(
            promoted = report.promoted,
            demoted = report.demoted,
            evicted = report.evicted,
            "Cache optimization pass finished"
        );
        report
    }

    /// Get the cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Spawns the expiry and compression sweeps on their configured intervals.
    ///
    /// The sweeps stop when the returned handle is shut down or dropped.
    pub fn start_maintenance(self: &Arc<Self>) -> CacheMaintenance {
        let token = CancellationToken::new();

        let cleanup = spawn_sweep(
            Arc::clone(self),
            token.clone(),
            self.config.cleanup_interval(),
            "expiry",
            |cache| async move { cache.cleanup_expired().await },
        );
        let compression = spawn_sweep(
            Arc::clone(self),
            token.clone(),
            self.config.compression_interval(),
            "compression",
            |cache| async move { cache.compress_entries().await },
        );

        info!("Cache maintenance started");
        CacheMaintenance { token, handles: vec![cleanup, compression] }
    }
}

fn spawn_sweep<F, Fut>(
    cache: Arc<AdaptiveCache>,
    token: CancellationToken,
    period: std::time::Duration,
    name: &'static str,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AdaptiveCache>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = usize> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let touched = sweep(Arc::clone(&cache)).await;
                    debug!(sweep = name, touched, "Cache sweep finished");
                }
            }
        }
        debug!(sweep = name, "Cache sweep stopped");
    })
}

/// Handle for the cache's background sweeps.
#[derive(Debug)]
pub struct CacheMaintenance {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl CacheMaintenance {
    /// Stops the sweeps and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweep task ended abnormally");
            }
        }
    }
}

impl Drop for CacheMaintenance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
