//! Capability selector for choosing a worker per request.
//!
//! Candidates are filtered by capability intersection and circuit state,
//! scored with [`score_worker`], ordered by the requested
//! [`SelectionStrategy`], and the first candidate whose circuit admits a
//! dispatch wins. Admission reserves the half-open trial, so two concurrent
//! selections never both dispatch to a recovering worker.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::SelectionRequest;
use crate::load_balancer::LoadBalancer;
use crate::registry::{ExecutionOutcome, WorkerDescriptor, WorkerRegistry};
use crate::routing::{CircuitBreaker, CircuitBreakerConfig, ScoreWeights, score_worker};

/// How near-equal candidates are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Near-ties by score are broken by load, then success rate, then id.
    #[default]
    Balanced,
    /// Highest score wins; ties broken by id.
    BestMatch,
    /// Least loaded worker wins; score breaks ties.
    LeastLoaded,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::BestMatch => write!(f, "best_match"),
            Self::LeastLoaded => write!(f, "least_loaded"),
        }
    }
}

/// Selector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Score factor weights.
    #[serde(default)]
    pub weights: ScoreWeights,

    /// Score distance from the top that still counts as a tie (default: 0.05).
    #[serde(default = "default_tie_tolerance")]
    pub tie_tolerance: f64,

    /// Latency at which the latency score halves, in ms (default: 2000).
    #[serde(default = "default_reference_latency_ms")]
    pub reference_latency_ms: f64,

    /// Nominal concurrent executions per worker (default: 4).
    #[serde(default = "default_max_concurrent_per_worker")]
    pub max_concurrent_per_worker: usize,

    /// Runner-up candidates reported with a selection (default: 3).
    #[serde(default = "default_max_runners_up")]
    pub max_runners_up: usize,

    /// Strategy used when a request does not name one.
    #[serde(default)]
    pub default_strategy: SelectionStrategy,
}

fn default_tie_tolerance() -> f64 {
    0.05
}

fn default_reference_latency_ms() -> f64 {
    2000.0
}

fn default_max_concurrent_per_worker() -> usize {
    4
}

fn default_max_runners_up() -> usize {
    3
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            tie_tolerance: default_tie_tolerance(),
            reference_latency_ms: default_reference_latency_ms(),
            max_concurrent_per_worker: default_max_concurrent_per_worker(),
            max_runners_up: default_max_runners_up(),
            default_strategy: SelectionStrategy::default(),
        }
    }
}

/// Invalid selector settings.
#[derive(Debug, Error, PartialEq)]
pub enum SelectorConfigError {
    /// Negative, non-finite or all-zero weights.
    #[error("score weights must be non-negative with a positive sum")]
    InvalidWeights,

    /// Tie tolerance outside 0.0-1.0.
    #[error("tie_tolerance must be within 0.0-1.0, got {0}")]
    InvalidTieTolerance(f64),

    /// Reference latency not positive.
    #[error("reference_latency_ms must be greater than 0, got {0}")]
    InvalidReferenceLatency(f64),

    /// Zero concurrency.
    #[error("max_concurrent_per_worker must be greater than 0")]
    InvalidConcurrency,
}

impl SelectorConfig {
    /// Validates the settings.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), SelectorConfigError> {
        if !self.weights.is_valid() {
            return Err(SelectorConfigError::InvalidWeights);
        }
        if !(0.0..=1.0).contains(&self.tie_tolerance) {
            return Err(SelectorConfigError::InvalidTieTolerance(self.tie_tolerance));
        }
        if !(self.reference_latency_ms > 0.0) {
            return Err(SelectorConfigError::InvalidReferenceLatency(self.reference_latency_ms));
        }
        if self.max_concurrent_per_worker == 0 {
            return Err(SelectorConfigError::InvalidConcurrency);
        }
        Ok(())
    }
}

/// Errors that can occur during worker selection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// No active, reachable worker matches the request.
    #[error("No suitable worker: {reason}")]
    NoSuitableWorker {
        /// What ruled the candidates out.
        reason: String,
    },

    /// The named worker's circuit is open.
    #[error("Circuit open for worker {worker_id}")]
    CircuitOpen {
        /// Worker whose circuit is open.
        worker_id: String,
    },
}

/// A scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    /// Worker id.
    pub worker_id: String,
    /// Match score in 0.0-1.0.
    pub score: f64,
    /// Active executions at selection time.
    pub load: usize,
    /// Rolling success rate.
    pub success_rate: f64,
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionResult {
    /// Chosen worker.
    pub worker_id: String,
    /// Match score of the chosen worker.
    pub score: f64,
    /// Confidence in the choice, 0.0-1.0.
    pub confidence: f64,
    /// Human-readable explanation.
    pub reason: String,
    /// Next candidates in selection order.
    pub runners_up: Vec<ScoredCandidate>,
}

/// Confidence from a score and its margin over the best alternative.
fn confidence(score: f64, margin: Option<f64>) -> f64 {
    let margin_factor = margin.map_or(1.0, |m| (m.max(0.0) / 0.3).min(1.0));
    (0.7 * score + 0.3 * margin_factor).clamp(0.0, 1.0)
}

fn by_score(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.worker_id.cmp(&b.worker_id))
}

fn by_load_then_success(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.load
        .cmp(&b.load)
        .then_with(|| b.success_rate.total_cmp(&a.success_rate))
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

/// Orders scored candidates for dispatch.
fn order_candidates(mut candidates: Vec<ScoredCandidate>, strategy: SelectionStrategy, tie_tolerance: f64) -> Vec<ScoredCandidate> {
    candidates.sort_by(by_score);
    match strategy {
        SelectionStrategy::BestMatch => candidates,
        SelectionStrategy::LeastLoaded => {
            candidates.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| by_score(a, b)));
            candidates
        }
        SelectionStrategy::Balanced => {
            let top = candidates.first().map_or(0.0, |c| c.score);
            let split = candidates.iter().take_while(|c| c.score >= top - tie_tolerance).count();
            let rest = candidates.split_off(split);
            candidates.sort_by(by_load_then_success);
            candidates.extend(rest);
            candidates
        }
    }
}

/// Capability-based worker selector with load balancing and circuit breaking.
pub struct CapabilitySelector {
    registry: Arc<WorkerRegistry>,
    load_balancer: LoadBalancer,
    breaker: CircuitBreaker,
    config: SelectorConfig,
}

impl fmt::Debug for CapabilitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySelector")
            .field("config", &self.config)
            .field("breaker", &self.breaker.config())
            .finish_non_exhaustive()
    }
}

impl CapabilitySelector {
    /// Creates a new selector.
    ///
    /// # Arguments
    /// * `registry` - Worker registry to select from
    /// * `config` - Selector settings
    /// * `breaker_config` - Circuit breaker settings
    #[must_use]
    pub fn new(registry: Arc<WorkerRegistry>, config: SelectorConfig, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            registry,
            load_balancer: LoadBalancer::new(config.max_concurrent_per_worker),
            breaker: CircuitBreaker::new(breaker_config),
            config,
        }
    }

    /// Selects the best worker for a request.
    ///
    /// When the chosen worker's circuit is half-open, its single trial is
    /// reserved for this caller. Settle it with
    /// [`CapabilitySelector::record_outcome`], or with
    /// [`CapabilitySelector::release`] if the dispatch never happens.
    ///
    /// # Arguments
    /// * `request` - Capability requirements
    /// * `strategy` - Ordering strategy; `None` uses the configured default
    ///
    /// # Errors
    /// Returns `SelectionError::NoSuitableWorker` if no active worker matches
    /// or every match has an open circuit.
    pub async fn select(
        &self,
        request: &SelectionRequest,
        strategy: Option<SelectionStrategy>,
    ) -> Result<SelectionResult, SelectionError> {
        self.select_excluding(request, strategy, &[]).await
    }

    /// Like [`CapabilitySelector::select`], skipping the given worker ids.
    ///
    /// # Errors
    /// Returns `SelectionError::NoSuitableWorker` when nothing is left.
    pub async fn select_excluding(
        &self,
        request: &SelectionRequest,
        strategy: Option<SelectionStrategy>,
        exclude: &[String],
    ) -> Result<SelectionResult, SelectionError> {
        let strategy = strategy.unwrap_or(self.config.default_strategy);

        let matching: Vec<WorkerDescriptor> = self
            .registry
            .active()
            .await
            .into_iter()
            .filter(|w| !exclude.contains(&w.id))
            .filter(|w| request.required.is_empty() || w.capabilities.intersects(request.required))
            .collect();

        if matching.is_empty() {
            return Err(SelectionError::NoSuitableWorker {
                reason: format!("no active worker offers any of [{}]", request.required),
            });
        }

        let (available, open): (Vec<WorkerDescriptor>, Vec<WorkerDescriptor>) =
            matching.into_iter().partition(|w| self.breaker.is_available(&w.id));

        if available.is_empty() {
            let ids: Vec<&str> = open.iter().map(|w| w.id.as_str()).collect();
            warn!(open_circuits = ?ids, "Every matching worker has an open circuit");
            return Err(SelectionError::NoSuitableWorker {
                reason: format!("all matching workers have open circuits: {}", ids.join(", ")),
            });
        }
        if !open.is_empty() {
            debug!(skipped = open.len(), "Skipped workers with open circuits");
        }

        let loads = self.load_balancer.loads_for(available.iter().map(|w| w.id.as_str())).await;
        let mut coverage_by_id: HashMap<String, f64> = HashMap::with_capacity(available.len());
        let scored: Vec<ScoredCandidate> = available
            .into_iter()
            .map(|w| {
                let breakdown = score_worker(&w, request, &self.config.weights, self.config.reference_latency_ms);
                coverage_by_id.insert(w.id.clone(), breakdown.required);
                ScoredCandidate {
                    load: loads.get(&w.id).copied().unwrap_or(0),
                    success_rate: w.stats.success_rate,
                    score: breakdown.total,
                    worker_id: w.id,
                }
            })
            .collect();

        let best_score = scored.iter().map(|c| c.score).fold(f64::NEG_INFINITY, f64::max);
        let mut ordered = order_candidates(scored, strategy, self.config.tie_tolerance);

        let Some(position) = ordered.iter().position(|c| self.breaker.try_acquire(&c.worker_id)) else {
            return Err(SelectionError::NoSuitableWorker {
                reason: "every candidate's circuit refused the dispatch".to_string(),
            });
        };

        let chosen = ordered.remove(position);
        let best_alternative = ordered.iter().map(|c| c.score).fold(None, |acc: Option<f64>, s| {
            Some(acc.map_or(s, |a| a.max(s)))
        });
        let confidence = confidence(chosen.score, best_alternative.map(|alt| chosen.score - alt));
        let coverage = coverage_by_id.get(&chosen.worker_id).copied().unwrap_or(0.0);

        let reason = format!(
            "{strategy} selection: score {:.2} (best {:.2}), covers {:.0}% of required capabilities, load {}",
            chosen.score,
            best_score,
            coverage * 100.0,
            chosen.load
        );

        info!(
            worker_id = %chosen.worker_id,
            score = chosen.score,
            confidence,
            strategy = %strategy,
            candidates = ordered.len() + 1,
            "Selected worker"
        );

        ordered.truncate(self.config.max_runners_up);
        Ok(SelectionResult {
            worker_id: chosen.worker_id,
            score: chosen.score,
            confidence,
            reason,
            runners_up: ordered,
        })
    }

    /// Admits a dispatch to a caller-pinned worker.
    ///
    /// # Errors
    /// Returns `SelectionError::NoSuitableWorker` for unknown or inactive
    /// workers and `SelectionError::CircuitOpen` when the circuit refuses.
    pub async fn acquire(&self, worker_id: &str, request: &SelectionRequest) -> Result<SelectionResult, SelectionError> {
        let worker = self
            .registry
            .get(worker_id)
            .await
            .filter(|w| w.active)
            .ok_or_else(|| SelectionError::NoSuitableWorker {
                reason: format!("worker {worker_id} is not registered or inactive"),
            })?;

        if !self.breaker.try_acquire(worker_id) {
            return Err(SelectionError::CircuitOpen { worker_id: worker_id.to_string() });
        }

        let score = score_worker(&worker, request, &self.config.weights, self.config.reference_latency_ms).total;
        Ok(SelectionResult {
            worker_id: worker.id,
            score,
            confidence: confidence(score, None),
            reason: "worker pinned by caller".to_string(),
            runners_up: Vec::new(),
        })
    }

    /// Feeds an execution outcome into the statistics and the circuit breaker.
    pub async fn record_outcome(&self, worker_id: &str, outcome: ExecutionOutcome) {
        self.registry.record_outcome(worker_id, outcome).await;
        if outcome.success {
            self.breaker.record_success(worker_id);
        } else {
            self.breaker.record_failure(worker_id);
        }
    }

    /// Returns an unused selection, freeing a reserved half-open trial.
    pub fn release(&self, worker_id: &str) {
        self.breaker.release_trial(worker_id);
    }

    /// Marks the worker busy.
    pub async fn begin_execution(&self, worker_id: &str) {
        self.load_balancer.increment_load(worker_id).await;
    }

    /// Marks the worker idle again.
    pub async fn end_execution(&self, worker_id: &str) {
        self.load_balancer.decrement_load(worker_id).await;
    }

    /// Get the worker registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Get the circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Get the load balancer.
    #[must_use]
    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    /// Get the selector configuration.
    #[must_use]
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, CapabilitySet};
    use crate::routing::CircuitState;
    use std::time::Duration;

    fn caps(list: &[Capability]) -> CapabilitySet {
        list.iter().copied().collect()
    }

    async fn selector_with(workers: Vec<WorkerDescriptor>) -> CapabilitySelector {
        let registry = Arc::new(WorkerRegistry::new());
        for worker in workers {
            registry.register(worker).await;
        }
        CapabilitySelector::new(
            registry,
            SelectorConfig::default(),
            CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::default() },
        )
    }

    #[tokio::test]
    async fn test_no_workers_registered() {
        let selector = selector_with(Vec::new()).await;
        let err = selector.select(&SelectionRequest::default(), None).await.unwrap_err();
        assert!(matches!(err, SelectionError::NoSuitableWorker { .. }));
    }

    #[tokio::test]
    async fn test_best_match_prefers_coverage() {
        let selector = selector_with(vec![
            WorkerDescriptor::new("coder", "Coder", caps(&[Capability::CodeGeneration, Capability::Testing])),
            WorkerDescriptor::new("writer", "Writer", caps(&[Capability::Documentation])),
        ])
        .await;

        let request = SelectionRequest::new(caps(&[Capability::CodeGeneration, Capability::Documentation]))
            .with_preferred(caps(&[Capability::Testing]));
        let result = selector.select(&request, Some(SelectionStrategy::BestMatch)).await.unwrap();
        assert_eq!(result.worker_id, "coder");
        assert_eq!(result.runners_up.len(), 1);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }

    #[tokio::test]
    async fn test_non_matching_workers_are_filtered() {
        let selector = selector_with(vec![WorkerDescriptor::new("writer", "Writer", caps(&[Capability::Documentation]))]).await;
        let request = SelectionRequest::new(caps(&[Capability::Security]));
        let err = selector.select(&request, None).await.unwrap_err();
        assert!(err.to_string().contains("security"));
    }

    #[tokio::test]
    async fn test_balanced_breaks_ties_by_load() {
        let selector = selector_with(vec![
            WorkerDescriptor::new("a", "A", caps(&[Capability::Research])),
            WorkerDescriptor::new("b", "B", caps(&[Capability::Research])),
        ])
        .await;
        selector.begin_execution("a").await;

        let request = SelectionRequest::new(caps(&[Capability::Research]));
        let result = selector.select(&request, None).await.unwrap();
        assert_eq!(result.worker_id, "b");

        selector.end_execution("a").await;
        let result = selector.select(&request, None).await.unwrap();
        assert_eq!(result.worker_id, "a");
    }

    #[tokio::test]
    async fn test_least_loaded_ignores_score_gap() {
        let selector = selector_with(vec![
            WorkerDescriptor::new("strong", "Strong", caps(&[Capability::Security, Capability::Review])),
            WorkerDescriptor::new("weak", "Weak", caps(&[Capability::Security])),
        ])
        .await;
        selector.begin_execution("strong").await;

        let request = SelectionRequest::new(caps(&[Capability::Security, Capability::Review]));
        let best = selector.select(&request, Some(SelectionStrategy::BestMatch)).await.unwrap();
        assert_eq!(best.worker_id, "strong");
        let least = selector.select(&request, Some(SelectionStrategy::LeastLoaded)).await.unwrap();
        assert_eq!(least.worker_id, "weak");
    }

    #[tokio::test]
    async fn test_excluded_workers_are_skipped() {
        let selector = selector_with(vec![
            WorkerDescriptor::new("a", "A", caps(&[Capability::Planning])),
            WorkerDescriptor::new("b", "B", caps(&[Capability::Planning])),
        ])
        .await;
        let request = SelectionRequest::new(caps(&[Capability::Planning]));
        let result = selector.select_excluding(&request, None, &["a".to_string()]).await.unwrap();
        assert_eq!(result.worker_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_excludes_worker_until_cooldown() {
        let selector = selector_with(vec![
            WorkerDescriptor::new("flaky", "Flaky", caps(&[Capability::Debugging, Capability::Testing])),
            WorkerDescriptor::new("steady", "Steady", caps(&[Capability::Debugging])),
        ])
        .await;
        let request = SelectionRequest::new(caps(&[Capability::Debugging, Capability::Testing]));

        for _ in 0..2 {
            selector.record_outcome("flaky", ExecutionOutcome::failure(Duration::from_millis(10))).await;
        }
        assert_eq!(selector.breaker().state("flaky"), CircuitState::Closed);
        selector.record_outcome("flaky", ExecutionOutcome::failure(Duration::from_millis(10))).await;
        assert!(matches!(selector.breaker().state("flaky"), CircuitState::Open { .. }));

        let result = selector.select(&request, Some(SelectionStrategy::BestMatch)).await.unwrap();
        assert_eq!(result.worker_id, "steady");

        let pinned = selector.acquire("flaky", &request).await.unwrap_err();
        assert_eq!(pinned, SelectionError::CircuitOpen { worker_id: "flaky".to_string() });

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = selector.select(&request, Some(SelectionStrategy::BestMatch)).await.unwrap();
        assert_eq!(trial.worker_id, "flaky");
        // The half-open trial is taken; the next selection falls back.
        let next = selector.select(&request, Some(SelectionStrategy::BestMatch)).await.unwrap();
        assert_eq!(next.worker_id, "steady");

        selector.record_outcome("flaky", ExecutionOutcome::success(Duration::from_millis(10), 5)).await;
        assert_eq!(selector.breaker().state("flaky"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_selection_frees_half_open_trial() {
        let selector = selector_with(vec![WorkerDescriptor::new("solo", "Solo", caps(&[Capability::Research]))]).await;
        let request = SelectionRequest::new(caps(&[Capability::Research]));
        for _ in 0..3 {
            selector.record_outcome("solo", ExecutionOutcome::failure(Duration::ZERO)).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = selector.select(&request, None).await.unwrap();
        assert_eq!(trial.worker_id, "solo");
        assert!(selector.select(&request, None).await.is_err());

        selector.release(&trial.worker_id);
        assert_eq!(selector.select(&request, None).await.unwrap().worker_id, "solo");
    }

    #[tokio::test]
    async fn test_all_circuits_open() {
        let selector = selector_with(vec![WorkerDescriptor::new("only", "Only", caps(&[Capability::Translation]))]).await;
        for _ in 0..3 {
            selector.record_outcome("only", ExecutionOutcome::failure(Duration::ZERO)).await;
        }
        let err = selector.select(&SelectionRequest::new(caps(&[Capability::Translation])), None).await.unwrap_err();
        assert!(err.to_string().contains("open circuits: only"));
    }

    #[tokio::test]
    async fn test_acquire_unknown_worker() {
        let selector = selector_with(Vec::new()).await;
        let err = selector.acquire("ghost", &SelectionRequest::default()).await.unwrap_err();
        assert!(matches!(err, SelectionError::NoSuitableWorker { .. }));
    }

    #[test]
    fn test_confidence_bounds() {
        assert!((confidence(1.0, None) - 1.0).abs() < 1e-9);
        assert!((confidence(0.5, Some(0.0)) - 0.35).abs() < 1e-9);
        assert!((confidence(0.5, Some(-0.2)) - 0.35).abs() < 1e-9);
        assert!((confidence(0.8, Some(0.15)) - (0.56 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        assert!(SelectorConfig::default().validate().is_ok());
        let bad = SelectorConfig { tie_tolerance: 1.5, ..SelectorConfig::default() };
        assert_eq!(bad.validate(), Err(SelectorConfigError::InvalidTieTolerance(1.5)));
    }
}
