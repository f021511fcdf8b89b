//! Capability vocabulary and request analysis.
//!
//! Workers declare what they can do using a closed set of [`Capability`]
//! tags held in a [`CapabilitySet`] bitset, so matching is a bit
//! intersection rather than string comparison. [`RequestAnalyzer`] turns free
//! text into a [`SelectionRequest`] using keyword tables.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Unknown capability tag.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown capability tag: {0}")]
pub struct UnknownCapability(pub String);

/// A skill a worker can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Reading and explaining existing code.
    CodeAnalysis,
    /// Writing new code.
    CodeGeneration,
    /// Finding and fixing defects.
    Debugging,
    /// Writing or running tests.
    Testing,
    /// Restructuring code without changing behaviour.
    Refactoring,
    /// Security review and threat analysis.
    Security,
    /// Producing documentation.
    Documentation,
    /// Gathering and comparing information.
    Research,
    /// Condensing long material.
    Summarization,
    /// Translating between natural languages.
    Translation,
    /// Working with data sets and metrics.
    DataAnalysis,
    /// Breaking work into steps.
    Planning,
    /// Critiquing work products.
    Review,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::CodeAnalysis,
        Self::CodeGeneration,
        Self::Debugging,
        Self::Testing,
        Self::Refactoring,
        Self::Security,
        Self::Documentation,
        Self::Research,
        Self::Summarization,
        Self::Translation,
        Self::DataAnalysis,
        Self::Planning,
        Self::Review,
    ];

    /// Tag used in configuration and logs.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::CodeAnalysis => "code-analysis",
            Self::CodeGeneration => "code-generation",
            Self::Debugging => "debugging",
            Self::Testing => "testing",
            Self::Refactoring => "refactoring",
            Self::Security => "security",
            Self::Documentation => "documentation",
            Self::Research => "research",
            Self::Summarization => "summarization",
            Self::Translation => "translation",
            Self::DataAnalysis => "data-analysis",
            Self::Planning => "planning",
            Self::Review => "review",
        }
    }

    /// Domain family the capability belongs to.
    #[must_use]
    pub fn category(self) -> Category {
        match self {
            Self::CodeAnalysis | Self::CodeGeneration | Self::Refactoring => Category::Development,
            Self::Debugging | Self::Testing | Self::Security | Self::Review => Category::Quality,
            Self::Research | Self::DataAnalysis => Category::Analysis,
            Self::Documentation | Self::Summarization | Self::Translation => Category::Writing,
            Self::Planning => Category::Planning,
        }
    }

    /// Keywords that signal the capability in free text.
    #[must_use]
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::CodeAnalysis => &["analyze code", "explain this code", "code review", "codebase", "function", "module"],
            Self::CodeGeneration => &["implement", "write code", "generate code", "build a", "create a function", "scaffold"],
            Self::Debugging => &["bug", "debug", "error", "crash", "stack trace", "fix"],
            Self::Testing => &["test", "unit test", "coverage", "assert"],
            Self::Refactoring => &["refactor", "clean up", "restructure", "simplify"],
            Self::Security => &["security", "vulnerability", "exploit", "auth", "cve"],
            Self::Documentation => &["document", "readme", "docs", "docstring"],
            Self::Research => &["research", "investigate", "compare", "find out", "sources"],
            Self::Summarization => &["summarize", "summary", "tl;dr", "condense"],
            Self::Translation => &["translate", "translation", "in french", "in spanish", "in german"],
            Self::DataAnalysis => &["data", "dataset", "statistics", "metrics", "csv", "chart"],
            Self::Planning => &["plan", "roadmap", "break down", "milestone", "steps"],
            Self::Review => &["review", "critique", "feedback", "assess"],
        }
    }

    /// Capabilities that usually help alongside this one.
    #[must_use]
    pub fn companions(self) -> &'static [Self] {
        match self {
            Self::CodeGeneration => &[Self::Testing, Self::CodeAnalysis],
            Self::Debugging => &[Self::CodeAnalysis, Self::Testing],
            Self::Refactoring => &[Self::CodeAnalysis, Self::Testing],
            Self::Security => &[Self::CodeAnalysis, Self::Review],
            Self::Research => &[Self::Summarization],
            Self::DataAnalysis => &[Self::Research],
            Self::Planning => &[Self::Research],
            Self::Review => &[Self::CodeAnalysis],
            Self::CodeAnalysis
            | Self::Testing
            | Self::Documentation
            | Self::Summarization
            | Self::Translation => &[],
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|cap| cap.tag() == normalized)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Set of capabilities stored as a bitset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Adds a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.0 |= capability.bit();
    }

    /// Returns the set with `capability` added.
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.insert(capability);
        self
    }

    /// Whether `capability` is present.
    #[must_use]
    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Number of capabilities in the set.
    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Capabilities present in both sets.
    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Capabilities present in either set.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Capabilities in `self` but not in `other`.
    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether the sets share at least one capability.
    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Share of `wanted` covered by `self`, in `[0, 1]`. An empty `wanted`
    /// counts as fully covered.
    #[must_use]
    pub fn coverage_of(self, wanted: Self) -> f64 {
        if wanted.is_empty() {
            return 1.0;
        }
        self.intersection(wanted).len() as f64 / wanted.len() as f64
    }

    /// Iterates capabilities in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |cap| self.contains(*cap))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Capability::tag)).finish()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().map(Capability::tag).collect();
        f.write_str(&tags.join(", "))
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(caps.into_iter().collect())
    }
}

/// Domain family of a request or worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Writing and reading code.
    Development,
    /// Debugging, testing, security and review.
    Quality,
    /// Research and data work.
    Analysis,
    /// Prose output.
    Writing,
    /// Planning and decomposition.
    Planning,
    /// No dominant family.
    #[default]
    General,
}

impl Category {
    /// Tag used in logs and relevance scoring.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Quality => "quality",
            Self::Analysis => "analysis",
            Self::Writing => "writing",
            Self::Planning => "planning",
            Self::General => "general",
        }
    }
}

/// Complexity tier of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Short, single-concern requests.
    #[default]
    Simple,
    /// Several concerns or moderate length.
    Medium,
    /// Long or multi-step requests.
    Complex,
}

/// Priority tier of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    /// Background work.
    Low,
    /// Default.
    #[default]
    Normal,
    /// User is waiting.
    High,
    /// Must not be dropped.
    Critical,
}

/// Capability requirements derived from a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    /// Capabilities a candidate must intersect.
    pub required: CapabilitySet,
    /// Capabilities that raise a candidate's score.
    pub preferred: CapabilitySet,
    /// Complexity tier.
    pub complexity: Complexity,
    /// Domain family.
    pub category: Category,
    /// Priority tier.
    pub priority: PriorityTier,
    /// Keywords that matched during analysis.
    pub keywords: Vec<String>,
}

impl SelectionRequest {
    /// A request requiring `required`.
    #[must_use]
    pub fn new(required: CapabilitySet) -> Self {
        Self { required, ..Self::default() }
    }

    /// Sets the preferred capabilities.
    #[must_use]
    pub fn with_preferred(mut self, preferred: CapabilitySet) -> Self {
        self.preferred = preferred;
        self
    }

    /// Sets the domain category.
    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Sets the priority tier.
    #[must_use]
    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = priority;
        self
    }
}

const COMPLEXITY_MARKERS: &[&str] = &[
    "step-by-step",
    "step by step",
    "architecture",
    "trade-off",
    "tradeoff",
    "end-to-end",
    "multiple",
    "migrate",
    "optimize",
    "design",
];

/// Heuristic keyword-based request analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestAnalyzer;

impl RequestAnalyzer {
    /// Creates an analyzer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Derives capability requirements from free text.
    #[must_use]
    pub fn analyze(&self, text: &str) -> SelectionRequest {
        let lower = text.to_lowercase();
        let mut required = CapabilitySet::empty();
        let mut keywords = Vec::new();

        for capability in Capability::ALL {
            let mut matched = false;
            for keyword in capability.keywords() {
                if lower.contains(keyword) {
                    matched = true;
                    if !keywords.iter().any(|k| k == keyword) {
                        keywords.push((*keyword).to_string());
                    }
                }
            }
            if matched {
                required.insert(capability);
            }
        }

        let preferred = required
            .iter()
            .flat_map(|cap| cap.companions().iter().copied())
            .collect::<CapabilitySet>()
            .difference(required);

        let complexity = Self::complexity(&lower, required);
        let category = Self::dominant_category(required);

        debug!(
            required = %required,
            preferred = %preferred,
            complexity = ?complexity,
            category = ?category,
            "Analyzed request"
        );

        SelectionRequest { required, preferred, complexity, category, priority: PriorityTier::Normal, keywords }
    }

    fn complexity(lower: &str, required: CapabilitySet) -> Complexity {
        let words = lower.split_whitespace().count();
        let markers = COMPLEXITY_MARKERS.iter().filter(|m| lower.contains(*m)).count();

        if words > 150 || markers >= 2 || required.len() >= 4 {
            Complexity::Complex
        } else if words > 40 || markers == 1 || required.len() >= 2 {
            Complexity::Medium
        } else {
            Complexity::Simple
        }
    }

    fn dominant_category(required: CapabilitySet) -> Category {
        let mut counts: Vec<(Category, usize)> = Vec::new();
        for cap in required.iter() {
            let category = cap.category();
            match counts.iter_mut().find(|(c, _)| *c == category) {
                Some((_, n)) => *n += 1,
                None => counts.push((category, 1)),
            }
        }
        counts
            .into_iter()
            .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then_with(|| cb.cmp(ca)))
            .map_or(Category::General, |(category, _)| category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_tags_round_trip() {
        for cap in Capability::ALL {
            assert_eq!(cap.tag().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!("Code_Analysis".parse::<Capability>().unwrap(), Capability::CodeAnalysis);
        assert!("juggling".parse::<Capability>().is_err());
    }

    #[test]
    fn test_set_operations() {
        let a: CapabilitySet = [Capability::Debugging, Capability::Testing].into_iter().collect();
        let b = CapabilitySet::empty().with(Capability::Testing).with(Capability::Review);

        assert_eq!(a.len(), 2);
        assert!(a.intersects(b));
        assert_eq!(a.intersection(b).iter().collect::<Vec<_>>(), vec![Capability::Testing]);
        assert_eq!(a.union(b).len(), 3);
        assert!((a.coverage_of(b) - 0.5).abs() < f64::EPSILON);
        assert!((a.coverage_of(CapabilitySet::empty()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_serializes_as_tags() {
        let set = CapabilitySet::empty().with(Capability::DataAnalysis).with(Capability::Planning);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["data-analysis","planning"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_analyzer_detects_debugging_request() {
        let request = RequestAnalyzer::new().analyze("There is a crash with this stack trace, please fix the bug");
        assert!(request.required.contains(Capability::Debugging));
        assert!(request.preferred.contains(Capability::CodeAnalysis));
        assert!(!request.preferred.contains(Capability::Debugging));
        assert_eq!(request.category, Category::Quality);
        assert!(request.keywords.contains(&"bug".to_string()));
    }

    #[test]
    fn test_analyzer_complexity_tiers() {
        let analyzer = RequestAnalyzer::new();
        assert_eq!(analyzer.analyze("summarize this").complexity, Complexity::Simple);
        assert_eq!(
            analyzer.analyze("design the architecture step by step").complexity,
            Complexity::Complex
        );
        assert_eq!(analyzer.analyze("hello").category, Category::General);
        assert!(analyzer.analyze("hello").required.is_empty());
    }
}
