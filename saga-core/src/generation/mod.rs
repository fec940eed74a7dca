//! The generative capability seam.
//!
//! Everything the engine asks of the text model goes through the
//! [`Generator`] trait. Output is never trusted: callers parse it through
//! [`repair`] and gate it through the quality loop.

mod claude;
pub mod repair;
mod retry;

pub use self::claude::ClaudeGenerator;
pub use retry::{RetryPolicy, RetryingGenerator};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors from the generative capability.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("generation timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider overloaded")]
    Overloaded,

    #[error("empty response")]
    EmptyResponse,

    #[error("refused by content policy: {0}")]
    ContentPolicy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Retryable errors may succeed if the same request is sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited { .. }
                | GenerationError::Timeout
                | GenerationError::Network(_)
                | GenerationError::Overloaded
                | GenerationError::EmptyResponse
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GenerationError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// What a generation call is for. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    StoryPlan,
    ConstraintExtraction,
    Installment,
    Rewrite,
    FactExtraction,
    BeatDetection,
    Summary,
    SynopsisUpdate,
    BibleRefresh,
}

impl Purpose {
    pub fn name(&self) -> &'static str {
        match self {
            Purpose::StoryPlan => "story_plan",
            Purpose::ConstraintExtraction => "constraint_extraction",
            Purpose::Installment => "installment",
            Purpose::Rewrite => "rewrite",
            Purpose::FactExtraction => "fact_extraction",
            Purpose::BeatDetection => "beat_detection",
            Purpose::Summary => "summary",
            Purpose::SynopsisUpdate => "synopsis_update",
            Purpose::BibleRefresh => "bible_refresh",
        }
    }
}

/// A single request to the generative capability.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub purpose: Purpose,
    pub system: String,
    pub user: String,
    pub max_output_tokens: usize,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(purpose: Purpose, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            user: user.into(),
            max_output_tokens: 2048,
            temperature: 0.7,
        }
    }

    pub fn with_max_output_tokens(mut self, max: usize) -> Self {
        self.max_output_tokens = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }
}

/// Sampling settings for the main installment call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// Output cap for installment drafts.
    pub installment_max_tokens: usize,
    /// Output cap for summaries, extraction and other bookkeeping calls.
    pub auxiliary_max_tokens: usize,
    /// Temperature for creative calls.
    pub creative_temperature: f32,
    /// Temperature for extraction calls.
    pub analytic_temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            installment_max_tokens: 6000,
            auxiliary_max_tokens: 1500,
            creative_temperature: 0.85,
            analytic_temperature: 0.2,
        }
    }
}

/// The external text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce text for the request, or fail.
    async fn invoke(&self, request: GenerationRequest) -> Result<String, GenerationError>;
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    async fn invoke(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        (**self).invoke(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::Timeout.is_retryable());
        assert!(GenerationError::EmptyResponse.is_retryable());
        assert!(GenerationError::RateLimited { retry_after: None }.is_retryable());
        assert!(!GenerationError::ContentPolicy("no".into()).is_retryable());
        assert!(!GenerationError::InvalidRequest("bad".into()).is_retryable());
        assert!(!GenerationError::Cancelled.is_retryable());
    }

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new(Purpose::Summary, "sys", "user")
            .with_max_output_tokens(300)
            .with_temperature(3.0);
        assert_eq!(request.max_output_tokens, 300);
        assert_eq!(request.temperature, 1.0);
        assert_eq!(request.purpose.name(), "summary");
    }
}
