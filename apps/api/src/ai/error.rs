use thiserror::Error;
use uuid::Uuid;

use crate::ai::rate_limit::RateWindow;
use crate::ai::usage::Tier;
use crate::llm_client::LlmError;

/// Errors surfaced by the governance layer.
///
/// Admission errors (`TokenLimitExceeded`, `RateLimitExceeded`) are raised
/// before any provider call and never retried. Provider and pipeline errors are
/// retried, then wrapped in `ServiceFailure` with the last cause preserved.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("Daily token limit exceeded for user {user_id}: {used} of {limit} tokens used ({tier} tier)")]
    TokenLimitExceeded {
        user_id: Uuid,
        used: u64,
        limit: u64,
        tier: Tier,
    },

    #[error("Rate limit exceeded: {reason}")]
    RateLimitExceeded { window: RateWindow, reason: String },

    #[error("Prompt processing failed: {0}")]
    PromptProcessing(String),

    #[error("Response processing failed: {message}")]
    ResponseProcessing { message: String },

    #[error("Model provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("Response failed schema validation after {attempts} attempts: {}", errors.join("; "))]
    ValidationFailed { attempts: u32, errors: Vec<String> },

    #[error("AI request failed after {attempts} attempts: {source}")]
    ServiceFailure {
        attempts: u32,
        #[source]
        source: Box<AiError>,
    },

    #[error("Usage store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AiError {
    /// Provider and pipeline failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::PromptProcessing(_) | AiError::ResponseProcessing { .. } | AiError::Provider(_)
        )
    }
}
