//! Strategy decision and the per-strategy merge handlers.
//!
//! [`choose_strategy`] is a pure function of the ranked scores so the
//! decision can be tested without building results. Each handler receives
//! outputs ranked by composite score, highest first.

use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};

use super::types::{
    AggregationContext, AggregationMetadata, AggregationStrategy, AggregatorConfig, OutputContent,
    QualityDistribution, ScoredOutput, SequentialOrder, VoteWeight,
};

/// Float slack for the band comparisons.
const EPSILON: f64 = 1e-9;

/// Merged content, strategy details and confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    /// Merged content.
    pub content: OutputContent,
    /// Strategy details.
    pub metadata: AggregationMetadata,
    /// Confidence before clamping.
    pub confidence: f64,
}

/// Share of outputs within the consensus band of the top score.
#[must_use]
pub fn agreement_level(ranked: &[ScoredOutput], band: f64) -> f64 {
    let Some(top) = ranked.first().map(|s| s.composite) else { return 0.0 };
    let agreeing = ranked.iter().filter(|s| top - s.composite <= band + EPSILON).count();
    agreeing as f64 / ranked.len() as f64
}

fn distinct_aspects(ranked: &[ScoredOutput]) -> BTreeSet<String> {
    ranked
        .iter()
        .flat_map(|s| s.output.aspects().iter())
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Picks the strategy for ranked outputs. The first matching rule wins.
#[must_use]
pub fn choose_strategy(ranked: &[ScoredOutput], context: &AggregationContext, config: &AggregatorConfig) -> AggregationStrategy {
    if let Some(strategy) = context.strategy_override {
        return strategy;
    }
    if ranked.len() < 2 {
        return AggregationStrategy::Sequential;
    }

    if agreement_level(ranked, config.consensus_band) >= config.agreement_threshold {
        return AggregationStrategy::Consensus;
    }

    let max = ranked.iter().map(|s| s.composite).fold(f64::NEG_INFINITY, f64::max);
    let min = ranked.iter().map(|s| s.composite).fold(f64::INFINITY, f64::min);
    if max - min > config.variance_threshold + EPSILON {
        return AggregationStrategy::Voting;
    }

    let aspects = distinct_aspects(ranked).len() as f64;
    if aspects > 0.0 && aspects + EPSILON >= config.synthesis_coverage * ranked.len() as f64 {
        return AggregationStrategy::Synthesis;
    }

    AggregationStrategy::Sequential
}

/// Runs the handler for `strategy`.
#[must_use]
pub fn apply(
    strategy: AggregationStrategy,
    ranked: &[ScoredOutput],
    context: &AggregationContext,
    config: &AggregatorConfig,
) -> StrategyOutcome {
    match strategy {
        AggregationStrategy::Consensus => consensus(ranked, config),
        AggregationStrategy::Voting => voting(ranked, config),
        AggregationStrategy::Synthesis => synthesis(ranked),
        AggregationStrategy::Sequential => sequential(ranked, context.sequential_order),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn consensus(ranked: &[ScoredOutput], config: &AggregatorConfig) -> StrategyOutcome {
    let top = ranked.first().map_or(0.0, |s| s.composite);
    let agreeing: Vec<&ScoredOutput> =
        ranked.iter().filter(|s| top - s.composite <= config.consensus_band + EPSILON).collect();
    let level = agreement_level(ranked, config.consensus_band);

    let contents: Vec<&OutputContent> = agreeing.iter().map(|s| &s.output.content).collect();
    StrategyOutcome {
        content: merge_contents(&contents),
        confidence: 0.6 * mean(agreeing.iter().map(|s| s.composite)) + 0.4 * level,
        metadata: AggregationMetadata::Consensus {
            agreement_level: level,
            agreeing_agents: agreeing.iter().map(|s| s.output.agent_id.clone()).collect(),
        },
    }
}

fn voting(ranked: &[ScoredOutput], config: &AggregatorConfig) -> StrategyOutcome {
    let raw: Vec<f64> = ranked
        .iter()
        .map(|s| {
            if config.weight_votes_by_quality {
                s.composite * s.quality * (0.5 + s.specialization)
            } else {
                s.composite
            }
        })
        .collect();
    let total: f64 = raw.iter().sum();
    let weights: Vec<f64> = if total > 0.0 {
        raw.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / ranked.len().max(1) as f64; ranked.len()]
    };

    let winner = weights
        .iter()
        .enumerate()
        .fold(0, |best, (i, w)| if *w > weights[best] + EPSILON { i } else { best });
    let chosen = &ranked[winner];

    StrategyOutcome {
        content: chosen.output.content.clone(),
        confidence: chosen.composite * (0.5 + 0.5 * weights[winner]),
        metadata: AggregationMetadata::Voting {
            weights: ranked
                .iter()
                .zip(&weights)
                .map(|(s, w)| VoteWeight { agent_id: s.output.agent_id.clone(), weight: *w })
                .collect(),
            winner: chosen.output.agent_id.clone(),
        },
    }
}

fn synthesis(ranked: &[ScoredOutput]) -> StrategyOutcome {
    let contents: Vec<&OutputContent> = ranked.iter().map(|s| &s.output.content).collect();
    let combined = merge_contents(&contents);
    let primary = ranked.first().map_or(Value::Null, |s| s.output.content.to_value());
    let alternatives: Vec<Value> = ranked.iter().skip(1).take(2).map(|s| s.output.content.to_value()).collect();

    StrategyOutcome {
        content: OutputContent::Structured(json!({
            "primary": primary,
            "alternatives": alternatives,
            "combined": combined.to_value(),
        })),
        confidence: mean(ranked.iter().map(|s| s.composite)),
        metadata: AggregationMetadata::Synthesis {
            aspects_covered: distinct_aspects(ranked).into_iter().collect(),
            quality_distribution: QualityDistribution::from_scores(ranked.iter().map(|s| s.quality)),
        },
    }
}

fn sequential(ranked: &[ScoredOutput], order: SequentialOrder) -> StrategyOutcome {
    let mut ordered: Vec<&ScoredOutput> = ranked.iter().collect();
    if order == SequentialOrder::Submission {
        ordered.sort_by_key(|s| s.index);
    }

    let content = match ordered.as_slice() {
        [only] => only.output.content.clone(),
        many if many.iter().all(|s| matches!(s.output.content, OutputContent::Text(_))) => {
            OutputContent::Text(many.iter().map(|s| s.output.content.to_text()).collect::<Vec<_>>().join("\n\n"))
        }
        many => OutputContent::Structured(Value::Array(many.iter().map(|s| s.output.content.to_value()).collect())),
    };
    let primary = ordered.first().map(|s| s.output.agent_id.clone()).unwrap_or_default();

    StrategyOutcome {
        content,
        confidence: ordered.first().map_or(0.0, |s| s.composite),
        metadata: AggregationMetadata::Sequential {
            order: ordered.iter().map(|s| s.output.agent_id.clone()).collect(),
            primary_agent: primary,
        },
    }
}

/// Deep merge for all-structured content, line union otherwise.
fn merge_contents(contents: &[&OutputContent]) -> OutputContent {
    let all_structured = contents.iter().all(|c| matches!(c, OutputContent::Structured(_)));
    if all_structured {
        let merged = contents.iter().fold(Value::Null, |mut acc, content| {
            deep_merge(&mut acc, &content.to_value());
            acc
        });
        OutputContent::Structured(merged)
    } else {
        OutputContent::Text(line_union(contents.iter().map(|c| c.to_text())))
    }
}

/// Lines of every text in order, each distinct line kept once.
fn line_union(texts: impl Iterator<Item = String>) -> String {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    for text in texts {
        for line in text.lines() {
            let key = line.trim().to_string();
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            lines.push(line.trim_end().to_string());
        }
    }
    lines.join("\n")
}

/// Merges `incoming` into `base`. Objects merge per key, arrays gain
/// missing elements, and existing scalars win.
fn deep_merge(base: &mut Value, incoming: &Value) {
    if base.is_null() {
        *base = incoming.clone();
        return;
    }
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(incoming_items)) => {
            for item in incoming_items {
                if !base_items.contains(item) {
                    base_items.push(item.clone());
                }
            }
        }
        _ => {}
    }
}
