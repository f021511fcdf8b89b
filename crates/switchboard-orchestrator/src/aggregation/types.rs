//! Types for result aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::capability::CapabilitySet;

/// Content produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputContent {
    /// Plain text.
    Text(String),
    /// Structured JSON data.
    Structured(Value),
}

impl OutputContent {
    /// Whether there is nothing to aggregate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Structured(Value::Null) => true,
            Self::Structured(Value::Object(map)) => map.is_empty(),
            Self::Structured(Value::Array(items)) => items.is_empty(),
            Self::Structured(_) => false,
        }
    }

    /// Renders the content as text.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(Value::String(text)) => text.clone(),
            Self::Structured(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }

    /// Converts the content into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
        }
    }
}

impl From<&str> for OutputContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for OutputContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for OutputContent {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

/// Declared coverage of a worker output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMetadata {
    /// Aspects of the task the output addresses.
    #[serde(default)]
    pub aspects: Vec<String>,
    /// Capabilities exercised while producing it.
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

/// One worker's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Producing worker.
    pub agent_id: String,
    /// Produced content.
    pub content: OutputContent,
    /// Self-reported confidence in 0.0-1.0.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Errors reported alongside the content.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Declared coverage.
    #[serde(default)]
    pub metadata: Option<OutputMetadata>,
    /// RFC 3339 production time.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Execution time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Tokens consumed.
    #[serde(default)]
    pub tokens: u64,
}

impl WorkerOutput {
    /// A text output.
    pub fn text(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(agent_id, OutputContent::Text(content.into()))
    }

    /// A structured output.
    pub fn structured(agent_id: impl Into<String>, content: Value) -> Self {
        Self::new(agent_id, OutputContent::Structured(content))
    }

    fn new(agent_id: impl Into<String>, content: OutputContent) -> Self {
        Self {
            agent_id: agent_id.into(),
            content,
            confidence: None,
            errors: Vec::new(),
            metadata: None,
            timestamp: None,
            duration_ms: 0,
            tokens: 0,
        }
    }

    /// Sets the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Adds an error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    /// Sets the covered aspects.
    #[must_use]
    pub fn with_aspects<I, S>(mut self, aspects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.get_or_insert_with(OutputMetadata::default).aspects =
            aspects.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the exercised capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.metadata.get_or_insert_with(OutputMetadata::default).capabilities = capabilities;
        self
    }

    /// Sets the production timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Sets the execution cost.
    #[must_use]
    pub fn with_usage(mut self, duration_ms: u64, tokens: u64) -> Self {
        self.duration_ms = duration_ms;
        self.tokens = tokens;
        self
    }

    /// Declared aspects, empty when no metadata was given.
    #[must_use]
    pub fn aspects(&self) -> &[String] {
        self.metadata.as_ref().map_or(&[], |m| m.aspects.as_slice())
    }
}

/// Aggregation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// Merge agreeing outputs.
    Consensus,
    /// Pick the highest-weighted output.
    Voting,
    /// Combine outputs that cover different aspects.
    Synthesis,
    /// Keep outputs in order.
    Sequential,
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consensus => write!(f, "consensus"),
            Self::Voting => write!(f, "voting"),
            Self::Synthesis => write!(f, "synthesis"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Ordering used by the sequential strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequentialOrder {
    /// Order the outputs were submitted in.
    #[default]
    Submission,
    /// Highest composite score first.
    Quality,
}

/// What the outputs are being aggregated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationContext {
    /// Keywords of the originating request.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Domain tag of the originating request.
    #[serde(default)]
    pub domain: Option<String>,
    /// Capabilities the request asked for.
    #[serde(default)]
    pub requested_capabilities: CapabilitySet,
    /// Forces a strategy.
    #[serde(default)]
    pub strategy_override: Option<AggregationStrategy>,
    /// Ordering for the sequential strategy.
    #[serde(default)]
    pub sequential_order: SequentialOrder,
}

impl AggregationContext {
    /// Context with the given request keywords.
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { keywords: keywords.into_iter().map(Into::into).collect(), ..Self::default() }
    }
}

/// A validated output with its scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredOutput {
    /// The output.
    pub output: WorkerOutput,
    /// Position in the submitted list.
    pub index: usize,
    /// Weighted quality in 0.0-1.0.
    pub quality: f64,
    /// Keyword and domain overlap in 0.0-1.0.
    pub relevance: f64,
    /// Capability overlap in 0.0-1.0.
    pub specialization: f64,
    /// `0.5 * quality + 0.3 * relevance + 0.2 * specialization`.
    pub composite: f64,
}

/// Normalized vote of one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteWeight {
    /// Voting worker.
    pub agent_id: String,
    /// Share of the vote.
    pub weight: f64,
}

/// Counts of outputs per quality band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDistribution {
    /// Quality >= 0.7.
    pub high: usize,
    /// Quality >= 0.4.
    pub medium: usize,
    /// Everything else.
    pub low: usize,
}

impl QualityDistribution {
    /// Buckets the given quality scores.
    pub fn from_scores(scores: impl IntoIterator<Item = f64>) -> Self {
        scores.into_iter().fold(Self::default(), |mut dist, quality| {
            if quality >= 0.7 {
                dist.high += 1;
            } else if quality >= 0.4 {
                dist.medium += 1;
            } else {
                dist.low += 1;
            }
            dist
        })
    }
}

/// How a result was merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AggregationMetadata {
    /// Consensus details.
    Consensus {
        /// Share of outputs that agreed with the top one.
        agreement_level: f64,
        /// Workers whose content was merged.
        agreeing_agents: Vec<String>,
    },
    /// Voting details.
    Voting {
        /// Normalized weights, summing to 1.
        weights: Vec<VoteWeight>,
        /// Winning worker.
        winner: String,
    },
    /// Synthesis details.
    Synthesis {
        /// Distinct aspects covered by the inputs.
        aspects_covered: Vec<String>,
        /// Quality bands of the inputs.
        quality_distribution: QualityDistribution,
    },
    /// Sequential details.
    Sequential {
        /// Workers in output order.
        order: Vec<String>,
        /// First worker in the order.
        primary_agent: String,
    },
}

/// Result of aggregating several outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Strategy that produced the result.
    pub strategy: AggregationStrategy,
    /// Confidence in 0.0-1.0.
    pub confidence: f64,
    /// Merged content.
    pub content: OutputContent,
    /// Strategy details.
    pub metadata: AggregationMetadata,
    /// Inputs rejected by validation.
    pub dropped: usize,
    /// Valid inputs, in composite order. Never empty.
    pub sources: Vec<WorkerOutput>,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

/// Emitted after every aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationEvent {
    /// Strategy used.
    pub strategy: AggregationStrategy,
    /// Valid inputs.
    pub source_count: usize,
    /// Rejected inputs.
    pub dropped: usize,
    /// Result confidence.
    pub confidence: f64,
    /// Whether the result came from the signature cache.
    pub cache_hit: bool,
    /// Input signature.
    pub signature: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

/// Errors that can occur during aggregation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
    /// Nothing was submitted.
    #[error("No outputs to aggregate")]
    EmptyInput,

    /// Every output failed validation.
    #[error("No valid outputs to aggregate ({dropped} dropped)")]
    NoValidResults {
        /// Outputs rejected.
        dropped: usize,
    },
}

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Share of outputs near the top needed for consensus (default: 0.7).
    #[serde(default = "default_agreement_threshold")]
    pub agreement_threshold: f64,

    /// Composite distance from the top that counts as agreeing (default: 0.1).
    #[serde(default = "default_consensus_band")]
    pub consensus_band: f64,

    /// Composite spread above which voting is used (default: 0.3).
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,

    /// Distinct aspects per output needed for synthesis (default: 0.7).
    #[serde(default = "default_synthesis_coverage")]
    pub synthesis_coverage: f64,

    /// Weight votes by quality and specialization too (default: false).
    #[serde(default)]
    pub weight_votes_by_quality: bool,

    /// Results kept in the signature cache (default: 100).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Buffered events per subscriber (default: 64).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_agreement_threshold() -> f64 {
    0.7
}

fn default_consensus_band() -> f64 {
    0.1
}

fn default_variance_threshold() -> f64 {
    0.3
}

fn default_synthesis_coverage() -> f64 {
    0.7
}

fn default_cache_capacity() -> usize {
    100
}

fn default_event_capacity() -> usize {
    64
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: default_agreement_threshold(),
            consensus_band: default_consensus_band(),
            variance_threshold: default_variance_threshold(),
            synthesis_coverage: default_synthesis_coverage(),
            weight_votes_by_quality: false,
            cache_capacity: default_cache_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Invalid aggregator settings.
#[derive(Debug, Error, PartialEq)]
pub enum AggregatorConfigError {
    /// A ratio outside 0.0-1.0.
    #[error("{name} must be within 0.0-1.0, got {value}")]
    OutOfRange {
        /// Setting name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// Zero-sized event channel.
    #[error("event_capacity must be greater than 0")]
    InvalidEventCapacity,
}

impl AggregatorConfig {
    /// Validates the settings.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), AggregatorConfigError> {
        let ratios = [
            ("agreement_threshold", self.agreement_threshold),
            ("consensus_band", self.consensus_band),
            ("variance_threshold", self.variance_threshold),
            ("synthesis_coverage", self.synthesis_coverage),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(AggregatorConfigError::OutOfRange { name, value });
            }
        }
        if self.event_capacity == 0 {
            return Err(AggregatorConfigError::InvalidEventCapacity);
        }
        Ok(())
    }
}
