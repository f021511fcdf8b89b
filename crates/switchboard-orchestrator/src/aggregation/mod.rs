//! Multi-worker result aggregation.
//!
//! The [`Aggregator`] validates and scores worker outputs, picks an
//! [`AggregationStrategy`] from the score statistics, and merges the outputs
//! accordingly. Results are cached by a SHA-256 signature of the inputs and
//! context, and every aggregation is announced on a broadcast channel.

pub mod scoring;
pub mod strategy;
pub mod types;

pub use strategy::choose_strategy;
pub use types::{
    AggregatedResult, AggregationContext, AggregationError, AggregationEvent, AggregationMetadata,
    AggregationStrategy, AggregatorConfig, AggregatorConfigError, OutputContent, OutputMetadata,
    QualityDistribution, ScoredOutput, SequentialOrder, VoteWeight, WorkerOutput,
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Result type for aggregation.
pub type Result<T> = std::result::Result<T, AggregationError>;

#[derive(Debug, Default)]
struct SignatureCache {
    results: HashMap<String, AggregatedResult>,
    order: VecDeque<String>,
}

impl SignatureCache {
    fn get(&self, signature: &str) -> Option<AggregatedResult> {
        self.results.get(signature).cloned()
    }

    fn insert(&mut self, signature: String, result: AggregatedResult, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.results.insert(signature.clone(), result).is_none() {
            self.order.push_back(signature);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }
}

/// Combines several workers' outputs into one result.
pub struct Aggregator {
    config: AggregatorConfig,
    cache: Mutex<SignatureCache>,
    events: broadcast::Sender<AggregationEvent>,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

impl Aggregator {
    /// Creates an aggregator.
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self { config, cache: Mutex::new(SignatureCache::default()), events }
    }

    /// Subscribes to aggregation events.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregationEvent> {
        self.events.subscribe()
    }

    /// Aggregates worker outputs.
    ///
    /// # Arguments
    /// * `outputs` - Outputs in submission order
    /// * `context` - Request context used for scoring and strategy choice
    ///
    /// # Errors
    /// Returns `AggregationError::EmptyInput` for an empty list and
    /// `AggregationError::NoValidResults` when every output is invalid.
    pub fn aggregate(&self, outputs: Vec<WorkerOutput>, context: &AggregationContext) -> Result<AggregatedResult> {
        if outputs.is_empty() {
            return Err(AggregationError::EmptyInput);
        }

        let signature = signature(&outputs, context);
        if let Some(cached) = self.lock_cache().get(&signature) {
            debug!(signature = %signature, "Aggregation served from signature cache");
            self.emit(&cached, &signature, true);
            return Ok(cached);
        }

        let submitted = outputs.len();
        let valid: Vec<(usize, WorkerOutput)> =
            outputs.into_iter().enumerate().filter(|(index, output)| is_valid(*index, output)).collect();
        let dropped = submitted - valid.len();
        if valid.is_empty() {
            return Err(AggregationError::NoValidResults { dropped });
        }

        let mut ranked: Vec<ScoredOutput> =
            valid.into_iter().map(|(index, output)| scoring::score_output(output, index, context)).collect();
        scoring::rank(&mut ranked);

        let result = self.finish(ranked, dropped, context);
        self.lock_cache().insert(signature.clone(), result.clone(), self.config.cache_capacity);
        self.emit(&result, &signature, false);
        Ok(result)
    }

    /// Aggregates outputs whose scores were computed elsewhere.
    ///
    /// Invalid outputs are still dropped. Results are not cached.
    ///
    /// # Errors
    /// Same as [`Aggregator::aggregate`].
    pub fn aggregate_scored(&self, scored: Vec<ScoredOutput>, context: &AggregationContext) -> Result<AggregatedResult> {
        if scored.is_empty() {
            return Err(AggregationError::EmptyInput);
        }
        let submitted = scored.len();
        let mut ranked: Vec<ScoredOutput> = scored.into_iter().filter(|s| is_valid(s.index, &s.output)).collect();
        let dropped = submitted - ranked.len();
        if ranked.is_empty() {
            return Err(AggregationError::NoValidResults { dropped });
        }
        scoring::rank(&mut ranked);

        let result = self.finish(ranked, dropped, context);
        self.emit(&result, "", false);
        Ok(result)
    }

    fn finish(&self, ranked: Vec<ScoredOutput>, dropped: usize, context: &AggregationContext) -> AggregatedResult {
        let strategy = if ranked.len() == 1 {
            AggregationStrategy::Sequential
        } else {
            choose_strategy(&ranked, context, &self.config)
        };
        let outcome = strategy::apply(strategy, &ranked, context, &self.config);

        info!(
            strategy = %strategy,
            sources = ranked.len(),
            dropped,
            confidence = outcome.confidence,
            "Aggregated worker outputs"
        );

        AggregatedResult {
            strategy,
            confidence: outcome.confidence.clamp(0.0, 1.0),
            content: outcome.content,
            metadata: outcome.metadata,
            dropped,
            sources: ranked.into_iter().map(|s| s.output).collect(),
            timestamp: Utc::now(),
        }
    }

    fn emit(&self, result: &AggregatedResult, signature: &str, cache_hit: bool) {
        let event = AggregationEvent {
            strategy: result.strategy,
            source_count: result.sources.len(),
            dropped: result.dropped,
            confidence: result.confidence,
            cache_hit,
            signature: signature.to_string(),
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, SignatureCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached results.
    pub fn cached_results(&self) -> usize {
        self.lock_cache().results.len()
    }

    /// Drops every cached result.
    pub fn clear_cache(&self) {
        let mut cache = self.lock_cache();
        cache.results.clear();
        cache.order.clear();
    }

    /// Get the aggregator configuration.
    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }
}

/// Validation: an agent id, non-empty content, a parsable timestamp and a
/// confidence in 0.0-1.0.
fn is_valid(index: usize, output: &WorkerOutput) -> bool {
    let problem = if output.agent_id.trim().is_empty() {
        Some("missing agent id")
    } else if output.content.is_empty() {
        Some("empty content")
    } else if output.timestamp.as_deref().is_some_and(|ts| DateTime::parse_from_rfc3339(ts).is_err()) {
        Some("unparsable timestamp")
    } else if output.confidence.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
        Some("confidence outside 0.0-1.0")
    } else {
        None
    };

    match problem {
        Some(problem) => {
            warn!(index, agent_id = %output.agent_id, problem, "Dropping invalid worker output");
            false
        }
        None => true,
    }
}

fn signature(outputs: &[WorkerOutput], context: &AggregationContext) -> String {
    let mut hasher = Sha256::new();
    for output in outputs {
        hasher.update(serde_json::to_vec(output).unwrap_or_default());
        hasher.update([0u8]);
    }
    hasher.update(serde_json::to_vec(context).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_way_scored() -> Vec<ScoredOutput> {
        [("alpha", 0.92), ("beta", 0.90), ("gamma", 0.55)]
            .into_iter()
            .enumerate()
            .map(|(index, (id, composite))| ScoredOutput {
                output: WorkerOutput::text(id, format!("{id} proposal")),
                index,
                quality: composite,
                relevance: composite,
                specialization: 0.5,
                composite,
            })
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let aggregator = Aggregator::default();
        assert_eq!(aggregator.aggregate(Vec::new(), &AggregationContext::default()), Err(AggregationError::EmptyInput));
    }

    #[test]
    fn test_all_invalid_inputs() {
        let aggregator = Aggregator::default();
        let outputs = vec![
            WorkerOutput::text("", "orphan"),
            WorkerOutput::text("a", "   "),
            WorkerOutput::text("b", "late").with_timestamp("yesterday"),
            WorkerOutput::text("c", "sure").with_confidence(1.5),
        ];
        assert_eq!(
            aggregator.aggregate(outputs, &AggregationContext::default()),
            Err(AggregationError::NoValidResults { dropped: 4 })
        );
    }

    #[test]
    fn test_single_valid_output_is_wrapped_sequentially() {
        let aggregator = Aggregator::default();
        let outputs = vec![
            WorkerOutput::text("a", "only answer").with_timestamp("2024-05-01T10:00:00Z"),
            WorkerOutput::structured("", json!({"x": 1})),
        ];
        let result = aggregator.aggregate(outputs, &AggregationContext::default()).unwrap();
        assert_eq!(result.strategy, AggregationStrategy::Sequential);
        assert_eq!(result.content, OutputContent::Text("only answer".to_string()));
        assert_eq!(result.dropped, 1);
        assert_eq!(result.sources.len(), 1);
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn test_spread_scores_vote_for_the_best() {
        let aggregator = Aggregator::default();
        let result = aggregator.aggregate_scored(three_way_scored(), &AggregationContext::default()).unwrap();
        assert_eq!(result.strategy, AggregationStrategy::Voting);
        assert_eq!(result.content, OutputContent::Text("alpha proposal".to_string()));
        let AggregationMetadata::Voting { weights, .. } = &result.metadata else {
            panic!("expected voting metadata");
        };
        assert!((weights.iter().map(|w| w.weight).sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_outputs_reach_consensus() {
        let aggregator = Aggregator::default();
        let outputs: Vec<WorkerOutput> = ["a", "b", "c"]
            .into_iter()
            .map(|id| WorkerOutput::text(id, "Use a write-ahead log.\nFsync before acknowledging.").with_confidence(0.8))
            .collect();
        let result = aggregator.aggregate(outputs, &AggregationContext::with_keywords(["log"])).unwrap();
        assert_eq!(result.strategy, AggregationStrategy::Consensus);
        assert_eq!(
            result.content,
            OutputContent::Text("Use a write-ahead log.\nFsync before acknowledging.".to_string())
        );
        assert_eq!(result.sources.len(), 3);
    }

    #[tokio::test]
    async fn test_repeat_aggregation_hits_signature_cache() {
        let aggregator = Aggregator::default();
        let mut events = aggregator.subscribe();
        let outputs = vec![WorkerOutput::text("a", "first"), WorkerOutput::text("b", "second")];
        let context = AggregationContext::default();

        let first = aggregator.aggregate(outputs.clone(), &context).unwrap();
        let second = aggregator.aggregate(outputs, &context).unwrap();
        assert_eq!(first, second);
        assert_eq!(aggregator.cached_results(), 1);

        assert!(!events.recv().await.unwrap().cache_hit);
        assert!(events.recv().await.unwrap().cache_hit);
    }

    #[test]
    fn test_signature_cache_evicts_oldest() {
        let aggregator = Aggregator::new(AggregatorConfig { cache_capacity: 2, ..AggregatorConfig::default() });
        for text in ["one", "two", "three"] {
            aggregator.aggregate(vec![WorkerOutput::text("a", text)], &AggregationContext::default()).unwrap();
        }
        assert_eq!(aggregator.cached_results(), 2);
        let oldest = signature(&[WorkerOutput::text("a", "one")], &AggregationContext::default());
        assert!(aggregator.lock_cache().get(&oldest).is_none());
    }
}
