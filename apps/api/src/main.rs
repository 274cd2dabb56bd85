mod ai;
mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ai::orchestrator::RequestOrchestrator;
use crate::ai::rate_limit::RateLimiter;
use crate::ai::store::{GovernanceStore, MemoryStore, PgStore};
use crate::ai::usage::UsageQuotaTracker;
use crate::config::{Config, StoreBackend};
use crate::db::create_pool;
use crate::llm_client::{AnthropicClient, ModelClient};
use crate::routes::build_router;
use crate::state::AppState;

const BUCKET_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AI gateway v{}", env!("CARGO_PKG_VERSION"));

    let store = build_store(&config).await?;

    // Initialize model client
    let client = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
        config.request_timeout,
    )?);
    let model = client.model_info();
    info!(
        "LLM client initialized: {} (model: {}, context window: {})",
        client.client_name(),
        model.model,
        model.context_window
    );

    let usage = Arc::new(UsageQuotaTracker::new(store.clone(), config.quota));
    let rate_limiter = Arc::new(RateLimiter::new(store, config.rate_limit));
    rate_limiter.clone().spawn_cleanup(BUCKET_PURGE_INTERVAL);
    info!(
        "Governance: max_retries={}, validation={:?}, admission={:?}, dev_mode={}",
        config.orchestrator.max_retries,
        config.orchestrator.validation_policy,
        config.quota.admission,
        config.quota.dev_mode
    );

    let orchestrator = Arc::new(RequestOrchestrator::new(
        client,
        usage.clone(),
        rate_limiter.clone(),
        config.orchestrator,
    ));

    // Build app state
    let state = AppState {
        orchestrator,
        usage,
        rate_limiter,
    };

    // Build router
    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()), // TODO: restrict allowed origins once the web client domain is fixed
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Postgres in deployed environments; the in-memory store for local runs.
async fn build_store(config: &Config) -> Result<Arc<dyn GovernanceStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres store"))?;
            let pool = create_pool(url).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        StoreBackend::Memory => {
            info!("Using in-memory governance store (counters are lost on restart)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
