//! Quality, relevance and specialization scoring of worker outputs.

use serde_json::Value;

use super::types::{AggregationContext, OutputContent, ScoredOutput, WorkerOutput};

const COMPLETENESS_WEIGHT: f64 = 0.3;
const ACCURACY_WEIGHT: f64 = 0.25;
const RELEVANCE_WEIGHT: f64 = 0.2;
const COHERENCE_WEIGHT: f64 = 0.15;
const EFFICIENCY_WEIGHT: f64 = 0.1;

/// Words at which a text output counts as complete.
const COMPLETE_WORD_COUNT: f64 = 50.0;
/// Duration at which the time half of efficiency halves.
const REFERENCE_DURATION_MS: f64 = 10_000.0;
/// Token count at which the token half of efficiency halves.
const REFERENCE_TOKENS: f64 = 2_000.0;

fn completeness(output: &WorkerOutput) -> f64 {
    let base = match &output.content {
        OutputContent::Text(text) => (text.split_whitespace().count() as f64 / COMPLETE_WORD_COUNT).min(1.0),
        OutputContent::Structured(Value::Object(map)) if !map.is_empty() => {
            map.values().filter(|v| !v.is_null()).count() as f64 / map.len() as f64
        }
        OutputContent::Structured(Value::Array(items)) => (items.len() as f64 / 5.0).min(1.0),
        OutputContent::Structured(Value::Null) => 0.0,
        OutputContent::Structured(_) => 0.5,
    };
    (base - 0.25 * output.errors.len() as f64).max(0.0)
}

fn accuracy(output: &WorkerOutput) -> f64 {
    let confidence = output.confidence.unwrap_or(0.5);
    if output.errors.is_empty() { confidence } else { confidence * 0.5 }
}

fn brackets_balanced(text: &str) -> bool {
    let count = |c: char| text.chars().filter(|&x| x == c).count();
    count('(') == count(')') && count('[') == count(']') && count('{') == count('}')
}

fn coherence(output: &WorkerOutput) -> f64 {
    match &output.content {
        OutputContent::Structured(Value::Object(_) | Value::Array(_)) => 1.0,
        OutputContent::Structured(_) => 0.7,
        OutputContent::Text(text) => {
            let trimmed = text.trim();
            let mut score = 0.5;
            if trimmed.ends_with(['.', '!', '?', '`', ')']) || trimmed.lines().count() > 1 {
                score += 0.25;
            }
            if brackets_balanced(trimmed) {
                score += 0.25;
            }
            score
        }
    }
}

fn efficiency(output: &WorkerOutput) -> f64 {
    let time = 1.0 / (1.0 + output.duration_ms as f64 / REFERENCE_DURATION_MS);
    let tokens = 1.0 / (1.0 + output.tokens as f64 / REFERENCE_TOKENS);
    (time + tokens) / 2.0
}

/// Keyword and domain overlap with the request context.
///
/// Neutral 0.5 when the context names neither.
#[must_use]
pub fn relevance(output: &WorkerOutput, context: &AggregationContext) -> f64 {
    let mut terms: Vec<String> = context.keywords.iter().map(|k| k.to_lowercase()).collect();
    if let Some(domain) = &context.domain {
        terms.push(domain.to_lowercase());
    }
    terms.retain(|t| !t.trim().is_empty());
    if terms.is_empty() {
        return 0.5;
    }
    let text = output.content.to_text().to_lowercase();
    terms.iter().filter(|t| text.contains(t.as_str())).count() as f64 / terms.len() as f64
}

/// Overlap of exercised with requested capabilities.
///
/// Neutral 0.5 when nothing was requested.
#[must_use]
pub fn specialization(output: &WorkerOutput, context: &AggregationContext) -> f64 {
    if context.requested_capabilities.is_empty() {
        return 0.5;
    }
    let exercised = output.metadata.as_ref().map(|m| m.capabilities).unwrap_or_default();
    exercised.coverage_of(context.requested_capabilities)
}

/// Weighted quality of an output in 0.0-1.0.
#[must_use]
pub fn quality(output: &WorkerOutput, context: &AggregationContext) -> f64 {
    let score = COMPLETENESS_WEIGHT * completeness(output)
        + ACCURACY_WEIGHT * accuracy(output)
        + RELEVANCE_WEIGHT * relevance(output, context)
        + COHERENCE_WEIGHT * coherence(output)
        + EFFICIENCY_WEIGHT * efficiency(output);
    score.clamp(0.0, 1.0)
}

/// `0.5 * quality + 0.3 * relevance + 0.2 * specialization`.
#[must_use]
pub fn composite(quality: f64, relevance: f64, specialization: f64) -> f64 {
    (0.5 * quality + 0.3 * relevance + 0.2 * specialization).clamp(0.0, 1.0)
}

/// Scores an output that sat at `index` in the submitted list.
#[must_use]
pub fn score_output(output: WorkerOutput, index: usize, context: &AggregationContext) -> ScoredOutput {
    let quality = quality(&output, context);
    let relevance = relevance(&output, context);
    let specialization = specialization(&output, context);
    ScoredOutput { composite: composite(quality, relevance, specialization), output, index, quality, relevance, specialization }
}

/// Sorts by composite, highest first, keeping submission order among equals.
pub fn rank(scored: &mut [ScoredOutput]) {
    scored.sort_by(|a, b| b.composite.total_cmp(&a.composite));
}
