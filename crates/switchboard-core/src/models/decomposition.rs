//! Task decomposition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One piece of a decomposed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub description: String,
    /// Capability tags the subtask needs, by name.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Indices of subtasks in the same record that must finish first.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl Subtask {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), capabilities: Vec::new(), depends_on: Vec::new() }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn after(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on = indices.into_iter().collect();
        self
    }
}

/// How a request was split into subtasks, appended to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionRecord {
    pub id: String,
    pub session_id: String,
    /// The request that was decomposed.
    pub parent_request: String,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
}

impl DecompositionRecord {
    /// A record stamped now.
    pub fn new(session_id: impl Into<String>, parent_request: impl Into<String>, subtasks: Vec<Subtask>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            parent_request: parent_request.into(),
            subtasks,
            created_at: Utc::now(),
        }
    }

    /// Whether every dependency points at an earlier subtask.
    pub fn is_ordered(&self) -> bool {
        self.subtasks.iter().enumerate().all(|(i, task)| task.depends_on.iter().all(|&dep| dep < i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_order() {
        let ordered = DecompositionRecord::new(
            "s",
            "ship the feature",
            vec![
                Subtask::new("design the schema").with_capabilities(["planning"]),
                Subtask::new("write the migration").with_capabilities(["code_generation"]).after([0]),
            ],
        );
        assert!(ordered.is_ordered());

        let cyclic = DecompositionRecord::new("s", "x", vec![Subtask::new("a").after([1]), Subtask::new("b")]);
        assert!(!cyclic.is_ordered());
    }

    #[test]
    fn test_subtask_defaults_when_missing() {
        let task: Subtask = serde_json::from_str(r#"{"description": "review"}"#).unwrap();
        assert_eq!(task, Subtask::new("review"));
    }
}
