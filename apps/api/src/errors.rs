use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ai::error::AiError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Token limit exceeded: {0}")]
    TokenLimitExceeded(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("AI service error: {0}")]
    AiService(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<AiError> for AppError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::TokenLimitExceeded { .. } => AppError::TokenLimitExceeded(err.to_string()),
            AiError::RateLimitExceeded { .. } => AppError::RateLimitExceeded(err.to_string()),
            AiError::ValidationFailed { .. } => AppError::UnprocessableEntity(err.to_string()),
            AiError::PromptProcessing(msg) => AppError::Validation(msg),
            AiError::Store(e) => AppError::Internal(e),
            AiError::ServiceFailure { .. }
            | AiError::ResponseProcessing { .. }
            | AiError::Provider(_) => AppError::AiService(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::UnprocessableEntity(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNPROCESSABLE_ENTITY",
                msg.clone(),
            ),
            AppError::TokenLimitExceeded(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "TOKEN_LIMIT_EXCEEDED",
                msg.clone(),
            ),
            AppError::RateLimitExceeded(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                msg.clone(),
            ),
            AppError::AiService(msg) => {
                tracing::error!("AI service error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    "AI_SERVICE_ERROR",
                    "The AI provider failed to produce a usable response".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
