//! Per-key access tracking for hot/cold classification.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::types::{AccessPatternReport, AccessTemperature, KeyAccessStats};

#[derive(Debug, Clone)]
struct KeyCounters {
    reads: u64,
    writes: u64,
    misses: u64,
    recent: VecDeque<Instant>,
    last_access: Instant,
}

impl KeyCounters {
    fn new(now: Instant) -> Self {
        Self { reads: 0, writes: 0, misses: 0, recent: VecDeque::new(), last_access: now }
    }

    fn note_access(&mut self, now: Instant, window: Duration) {
        self.recent.push_back(now);
        self.last_access = now;
        self.prune(now, window);
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Tracks reads, writes and misses per key.
#[derive(Debug)]
pub(crate) struct AccessTracker {
    keys: HashMap<String, KeyCounters>,
    hot_window: Duration,
    hot_threshold: usize,
    cold_after: Duration,
}

impl AccessTracker {
    pub(crate) fn new(hot_window: Duration, hot_threshold: usize, cold_after: Duration) -> Self {
        Self { keys: HashMap::new(), hot_window, hot_threshold, cold_after }
    }

    pub(crate) fn record_read(&mut self, key: &str, now: Instant) {
        let window = self.hot_window;
        let counters = self.counters(key, now);
        counters.reads += 1;
        counters.note_access(now, window);
    }

    pub(crate) fn record_write(&mut self, key: &str, now: Instant) {
        let window = self.hot_window;
        let counters = self.counters(key, now);
        counters.writes += 1;
        counters.note_access(now, window);
    }

    pub(crate) fn record_miss(&mut self, key: &str, now: Instant) {
        self.counters(key, now).misses += 1;
    }

    fn counters(&mut self, key: &str, now: Instant) -> &mut KeyCounters {
        self.keys.entry(key.to_string()).or_insert_with(|| KeyCounters::new(now))
    }

    pub(crate) fn temperature(&self, key: &str, now: Instant) -> AccessTemperature {
        self.keys.get(key).map_or(AccessTemperature::Cold, |counters| self.classify(counters, now))
    }

    fn classify(&self, counters: &KeyCounters, now: Instant) -> AccessTemperature {
        let idle = now.saturating_duration_since(counters.last_access);
        if idle >= self.cold_after {
            return AccessTemperature::Cold;
        }
        let recent = counters
            .recent
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.hot_window)
            .count();
        if recent >= self.hot_threshold { AccessTemperature::Hot } else { AccessTemperature::Warm }
    }

    /// Drops counters of keys that are no longer cached and have gone cold.
    pub(crate) fn retain_live<F>(&mut self, now: Instant, is_cached: F)
    where
        F: Fn(&str) -> bool,
    {
        let cold_after = self.cold_after;
        let window = self.hot_window;
        self.keys.retain(|key, counters| {
            counters.prune(now, window);
            is_cached(key) || now.saturating_duration_since(counters.last_access) < cold_after
        });
    }

    pub(crate) fn report(&self, now: Instant) -> AccessPatternReport {
        let mut keys: Vec<KeyAccessStats> = self
            .keys
            .iter()
            .map(|(key, counters)| KeyAccessStats {
                key: key.clone(),
                reads: counters.reads,
                writes: counters.writes,
                misses: counters.misses,
                recent_accesses: counters
                    .recent
                    .iter()
                    .filter(|at| now.saturating_duration_since(**at) <= self.hot_window)
                    .count(),
                idle_for: now.saturating_duration_since(counters.last_access),
                temperature: self.classify(counters, now),
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        let mut hot: Vec<&KeyAccessStats> =
            keys.iter().filter(|k| k.temperature == AccessTemperature::Hot).collect();
        hot.sort_by(|a, b| b.recent_accesses.cmp(&a.recent_accesses).then_with(|| a.key.cmp(&b.key)));
        let hot_keys = hot.into_iter().map(|k| k.key.clone()).collect();
        let cold_keys = keys
            .iter()
            .filter(|k| k.temperature == AccessTemperature::Cold)
            .map(|k| k.key.clone())
            .collect();

        AccessPatternReport { hot_keys, cold_keys, keys }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> AccessTracker {
        AccessTracker::new(Duration::from_secs(60), 3, Duration::from_secs(600))
    }

    #[test]
    fn test_hot_after_threshold_reads() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.record_write("a", now);
        tracker.record_read("a", now);
        assert_eq!(tracker.temperature("a", now), AccessTemperature::Warm);
        tracker.record_read("a", now);
        assert_eq!(tracker.temperature("a", now), AccessTemperature::Hot);
    }

    #[test]
    fn test_reads_age_out_of_hot_window() {
        let mut tracker = tracker();
        let now = Instant::now();
        for _ in 0..3 {
            tracker.record_read("a", now);
        }
        let later = now + Duration::from_secs(120);
        assert_eq!(tracker.temperature("a", later), AccessTemperature::Warm);
        assert_eq!(tracker.temperature("a", now + Duration::from_secs(600)), AccessTemperature::Cold);
    }

    #[test]
    fn test_unknown_key_is_cold_and_misses_counted() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.record_miss("ghost", now);
        let report = tracker.report(now);
        assert_eq!(report.keys[0].misses, 1);
        assert_eq!(tracker.temperature("never-seen", now), AccessTemperature::Cold);
    }

    #[test]
    fn test_retain_live_drops_cold_uncached_keys() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.record_write("kept", now);
        tracker.record_write("gone", now);
        tracker.retain_live(now + Duration::from_secs(700), |key| key == "kept");
        let report = tracker.report(now + Duration::from_secs(700));
        assert_eq!(report.keys.len(), 1);
        assert_eq!(report.keys[0].key, "kept");
        assert_eq!(report.cold_keys, vec!["kept".to_string()]);
    }
}
