//! Axum route handlers for the AI governance API.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::rate_limit::WindowStatus;
use crate::ai::types::{AiRequest, AiResult};
use crate::ai::usage::{UsagePeriod, UsageStats};
use crate::errors::AppError;
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub user_id: Uuid,
    #[serde(default)]
    pub period: UsagePeriod,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitQuery {
    pub user_id: Uuid,
    /// Defaults to the configured model client.
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub user_id: Uuid,
    pub client_id: String,
    pub windows: Vec<WindowStatus>,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/ai/generate
///
/// Runs one governed AI request. Admission failures return 429 before any
/// provider call.
pub async fn handle_generate(
    State(state): State<AppState>,
    Json(request): Json<AiRequest>,
) -> Result<Json<AiResult>, AppError> {
    if request.prompt.trim().is_empty() && !request.is_chat() {
        return Err(AppError::Validation("prompt cannot be empty".to_string()));
    }

    let result = state.orchestrator.execute_request(request).await?;
    Ok(Json(result))
}

/// GET /api/v1/ai/usage?user_id=...&period=daily|monthly
pub async fn handle_usage_stats(
    State(state): State<AppState>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsageStats>, AppError> {
    let stats = state
        .usage
        .get_user_usage_stats(params.user_id, params.period)
        .await?;
    Ok(Json(stats))
}

/// GET /api/v1/ai/rate-limit?user_id=...&client_id=...
pub async fn handle_rate_limit_status(
    State(state): State<AppState>,
    Query(params): Query<RateLimitQuery>,
) -> Result<Json<RateLimitStatusResponse>, AppError> {
    let client_id = params
        .client_id
        .unwrap_or_else(|| state.orchestrator.client_id().to_string());
    let windows = state
        .rate_limiter
        .rate_limit_status(params.user_id, &client_id)
        .await?;
    Ok(Json(RateLimitStatusResponse {
        user_id: params.user_id,
        client_id,
        windows,
    }))
}
