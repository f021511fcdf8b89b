//! Model backend abstraction for Switchboard.
//!
//! The orchestrator treats language-model generation as a black box: it hands a
//! prompt plus generation parameters to a [`Model`] and gets back text together
//! with token and cost accounting. Concrete providers live outside this
//! workspace; [`MockModel`] is a scriptable stand-in for tests and demos.

mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockModel;

/// Failure of a single generation call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    /// The call never reached the backend or the connection dropped.
    #[error("Request failed: {0}")]
    RequestError(String),

    /// The backend did not answer within its own deadline.
    #[error("Backend timed out: {0}")]
    Timeout(String),

    /// The backend refused the prompt or parameters.
    #[error("Backend rejected the request: {0}")]
    Rejected(String),

    /// The backend is throttling this caller.
    #[error("Rate limited{}", retry_after_secs.map(|s| format!(" (retry after {s}s)")).unwrap_or_default())]
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },

    /// The backend answered with something that is not a usable response.
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),
}

impl ModelError {
    /// Returns `true` for transport-level failures as opposed to errors the
    /// backend reported about the request itself.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::RequestError(_) | Self::Timeout(_))
    }
}

/// Parameters for controlling a single generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Backend model identifier to use; `None` lets the backend pick its default.
    pub model: Option<String>,

    /// System prompt prepended by the backend (the worker persona).
    pub system_prompt: Option<String>,

    /// Sampling temperature, 0 to 2.
    pub temperature: Option<f32>,

    /// The maximum number of tokens to generate.
    pub max_tokens: Option<u32>,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self { model: None, system_prompt: None, temperature: Some(0.7), max_tokens: Some(4096) }
    }
}

/// The response from a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated content.
    pub content: String,

    /// Model that actually produced the text, when the backend says.
    pub model_id: Option<String>,

    pub usage: Option<ModelUsage>,

    /// Wall-clock time the backend spent on the call, in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,

    /// Cost of the call in US dollars as reported by the backend.
    #[serde(default)]
    pub cost_usd: f64,
}

impl ModelResponse {
    /// Total tokens consumed by the call, zero when the backend reported no usage.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.usage.as_ref().map_or(0, |u| u64::from(u.total_tokens))
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A language-model backend.
///
/// All backends must be `Send + Sync` so a single instance can serve
/// concurrent requests.
#[async_trait]
pub trait Model: Send + Sync {
    /// Generates a text completion for the given prompt.
    ///
    /// # Errors
    /// Returns a `ModelError` on transport failure or when the backend rejects the request.
    async fn generate_text(
        &self,
        prompt: &str,
        parameters: Option<ModelParameters>,
    ) -> Result<ModelResponse, ModelError>;

    /// Returns the ID of the backend.
    fn model_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_display() {
        let err = ModelError::RateLimited { retry_after_secs: Some(20) };
        assert_eq!(err.to_string(), "Rate limited (retry after 20s)");
        assert_eq!(ModelError::RateLimited { retry_after_secs: None }.to_string(), "Rate limited");
    }

    #[test]
    fn test_transport_classification() {
        assert!(ModelError::RequestError("reset".to_string()).is_transport());
        assert!(ModelError::Timeout("30s".to_string()).is_transport());
        assert!(!ModelError::Rejected("prompt too long".to_string()).is_transport());
    }

    #[test]
    fn test_total_tokens_without_usage() {
        let response = ModelResponse {
            content: "hi".to_string(),
            model_id: None,
            usage: None,
            duration_ms: 0,
            cost_usd: 0.0,
        };
        assert_eq!(response.total_tokens(), 0);
    }
}
