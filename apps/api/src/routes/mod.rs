pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::ai::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/ai/generate", post(handlers::handle_generate))
        .route("/api/v1/ai/usage", get(handlers::handle_usage_stats))
        .route("/api/v1/ai/rate-limit", get(handlers::handle_rate_limit_status))
        .with_state(state)
}
