//! Claude-backed generator.

use super::{GenerationError, GenerationRequest, Generator};
use async_trait::async_trait;
use claude::{Claude, Request, StopReason};
use tracing::{debug, warn};

/// [`Generator`] implementation over the Claude Messages API.
#[derive(Clone)]
pub struct ClaudeGenerator {
    client: Claude,
}

impl ClaudeGenerator {
    pub fn new(client: Claude) -> Self {
        Self { client }
    }

    /// Create from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, GenerationError> {
        let client = Claude::from_env().map_err(GenerationError::from)?;
        Ok(Self::new(client))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.client = self.client.with_model(model);
        self
    }
}

#[async_trait]
impl Generator for ClaudeGenerator {
    async fn invoke(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let api_request = Request::new(request.system, request.user)
            .with_max_tokens(request.max_output_tokens)
            .with_temperature(request.temperature);

        let response = self.client.complete(api_request).await?;

        debug!(
            purpose = request.purpose.name(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "generation complete"
        );

        if response.stop_reason == StopReason::Refusal {
            return Err(GenerationError::ContentPolicy(response.text));
        }
        if response.is_truncated() {
            // Truncated structured output is repaired downstream.
            warn!(purpose = request.purpose.name(), "generation hit the output limit");
        }
        if response.text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        Ok(response.text)
    }
}

impl From<claude::Error> for GenerationError {
    fn from(err: claude::Error) -> Self {
        match err {
            claude::Error::RateLimited { retry_after } => GenerationError::RateLimited { retry_after },
            claude::Error::Timeout => GenerationError::Timeout,
            claude::Error::Network(msg) => GenerationError::Network(msg),
            claude::Error::Overloaded { .. } => GenerationError::Overloaded,
            claude::Error::ContentPolicy(msg) => GenerationError::ContentPolicy(msg),
            claude::Error::Authentication(msg) => GenerationError::Authentication(msg),
            claude::Error::NoApiKey => {
                GenerationError::Authentication("ANTHROPIC_API_KEY not set".to_string())
            }
            claude::Error::Api { status, message } => {
                GenerationError::InvalidRequest(format!("status {status}: {message}"))
            }
            claude::Error::Parse(msg) => GenerationError::Malformed(msg),
            claude::Error::Config(msg) => GenerationError::InvalidRequest(msg),
        }
    }
}
