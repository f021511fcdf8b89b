//! Scriptable mock backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::{Model, ModelError, ModelParameters, ModelResponse, ModelUsage};

/// A mock implementation of the `Model` trait for testing and demonstration.
///
/// By default it echoes the prompt. Scripted results queued with
/// [`MockModel::push_response`] and [`MockModel::push_error`] are consumed
/// first, in order.
#[derive(Debug, Default)]
pub struct MockModel {
    id: String,
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    always_fail: Option<ModelError>,
    cost_per_token: f64,
    calls: AtomicUsize,
}

impl MockModel {
    /// Creates a new echoing `MockModel` with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), cost_per_token: 0.000_002, ..Self::default() }
    }

    /// Creates a mock that fails every call with the given error.
    #[must_use]
    pub fn failing(id: impl Into<String>, error: ModelError) -> Self {
        Self { always_fail: Some(error), ..Self::new(id) }
    }

    /// Queues a successful response.
    pub fn push_response(&self, content: impl Into<String>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(Ok(content.into()));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: ModelError) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(Err(error));
    }

    /// Number of generation calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Model for MockModel {
    async fn generate_text(
        &self,
        prompt: &str,
        parameters: Option<ModelParameters>,
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(model_id = %self.id, parameters = ?parameters, "MockModel generating text");

        if let Some(err) = &self.always_fail {
            return Err(err.clone());
        }

        let scripted = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let content = match scripted {
            Some(result) => result?,
            None => format!("Mock response for: {prompt}"),
        };

        let prompt_tokens = count_tokens(prompt);
        let completion_tokens = count_tokens(&content);
        let total_tokens = prompt_tokens + completion_tokens;

        Ok(ModelResponse {
            content,
            model_id: Some(
                parameters.and_then(|p| p.model).unwrap_or_else(|| self.id.clone()),
            ),
            usage: Some(ModelUsage { prompt_tokens, completion_tokens, total_tokens }),
            duration_ms: 1,
            cost_usd: f64::from(total_tokens) * self.cost_per_token,
        })
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

/// Count tokens in a string (simplified: word count).
fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_when_unscripted() {
        let model = MockModel::new("mock");
        let response = model.generate_text("hello there", None).await.unwrap();
        assert_eq!(response.content, "Mock response for: hello there");
        assert_eq!(response.usage.unwrap().prompt_tokens, 2);
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_script_consumed_in_order() {
        let model = MockModel::new("mock");
        model.push_response("first");
        model.push_error(ModelError::Timeout("slow".to_string()));

        assert_eq!(model.generate_text("x", None).await.unwrap().content, "first");
        assert!(matches!(model.generate_text("x", None).await, Err(ModelError::Timeout(_))));
        assert!(model.generate_text("x", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_mock() {
        let model = MockModel::failing("down", ModelError::RequestError("refused".to_string()));
        assert!(model.generate_text("x", None).await.is_err());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_parameters_model_overrides_id() {
        let model = MockModel::new("mock");
        let params = ModelParameters { model: Some("large".to_string()), ..Default::default() };
        let response = model.generate_text("x", Some(params)).await.unwrap();
        assert_eq!(response.model_id.as_deref(), Some("large"));
    }
}
