//! Candidate scoring for capability-based selection.

use serde::{Deserialize, Serialize};

use crate::capability::{Category, SelectionRequest};
use crate::registry::{PerformanceStats, WorkerDescriptor};

/// Weights for the match score factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight for the required-capability overlap.
    #[serde(default = "default_required")]
    pub required: f64,
    /// Weight for the preferred-capability overlap.
    #[serde(default = "default_preferred")]
    pub preferred: f64,
    /// Weight for the category match.
    #[serde(default = "default_category")]
    pub category: f64,
    /// Weight for historical performance.
    #[serde(default = "default_performance")]
    pub performance: f64,
}

fn default_required() -> f64 {
    0.45
}

fn default_preferred() -> f64 {
    0.15
}

fn default_category() -> f64 {
    0.10
}

fn default_performance() -> f64 {
    0.30
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            required: default_required(),
            preferred: default_preferred(),
            category: default_category(),
            performance: default_performance(),
        }
    }
}

impl ScoreWeights {
    /// Whether every weight is finite and non-negative with a positive sum.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let all = [self.required, self.preferred, self.category, self.performance];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && all.iter().sum::<f64>() > 0.0
    }
}

/// Match score with the factors it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Share of required capabilities the worker covers.
    pub required: f64,
    /// Share of preferred capabilities the worker covers.
    pub preferred: f64,
    /// Category agreement (1.0 same, 0.5 general request, 0.0 otherwise).
    pub category: f64,
    /// Normalized historical performance.
    pub performance: f64,
    /// Weighted total in 0.0-1.0.
    pub total: f64,
}

/// Blend of success rate and latency in 0.0-1.0.
///
/// `0.7 * success_rate + 0.3 / (1 + avg_latency / reference_latency)`.
#[must_use]
pub fn performance_score(stats: &PerformanceStats, reference_latency_ms: f64) -> f64 {
    let reference = reference_latency_ms.max(1.0);
    let latency_score = 1.0 / (1.0 + stats.avg_latency_ms.max(0.0) / reference);
    (0.7 * stats.success_rate.clamp(0.0, 1.0) + 0.3 * latency_score).clamp(0.0, 1.0)
}

fn category_score(worker: Category, wanted: Category) -> f64 {
    if worker == wanted {
        1.0
    } else if wanted == Category::General {
        0.5
    } else {
        0.0
    }
}

/// Scores a worker against a request.
///
/// With an empty preferred set the preferred weight drops out and the
/// remaining weights are renormalized, so the total stays in 0.0-1.0.
#[must_use]
pub fn score_worker(
    worker: &WorkerDescriptor,
    request: &SelectionRequest,
    weights: &ScoreWeights,
    reference_latency_ms: f64,
) -> ScoreBreakdown {
    let required = worker.capabilities.coverage_of(request.required);
    let preferred = if request.preferred.is_empty() {
        0.0
    } else {
        worker.capabilities.coverage_of(request.preferred)
    };
    let category = category_score(worker.category, request.category);
    let performance = performance_score(&worker.stats, reference_latency_ms);

    let preferred_weight = if request.preferred.is_empty() { 0.0 } else { weights.preferred };
    let weight_sum = weights.required + preferred_weight + weights.category + weights.performance;
    let weighted = weights.required * required
        + preferred_weight * preferred
        + weights.category * category
        + weights.performance * performance;
    let total = if weight_sum > 0.0 { (weighted / weight_sum).clamp(0.0, 1.0) } else { 0.0 };

    ScoreBreakdown { required, preferred, category, performance, total }
}
