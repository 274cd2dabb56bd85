use std::sync::Arc;

use crate::ai::orchestrator::RequestOrchestrator;
use crate::ai::rate_limit::RateLimiter;
use crate::ai::usage::UsageQuotaTracker;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub usage: Arc<UsageQuotaTracker>,
    pub rate_limiter: Arc<RateLimiter>,
}
