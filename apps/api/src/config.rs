use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::ai::orchestrator::{OrchestratorSettings, ValidationPolicy};
use crate::ai::rate_limit::{RateLimitSettings, RateLimits};
use crate::ai::usage::{QuotaAdmission, QuotaSettings, TierLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend '{other}' (expected postgres or memory)"),
        }
    }
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// Required when `store_backend` is Postgres.
    pub database_url: Option<String>,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    pub production: bool,
    pub request_timeout: Duration,
    pub orchestrator: OrchestratorSettings,
    pub quota: QuotaSettings,
    pub rate_limit: RateLimitSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let store_backend: StoreBackend = env_or("STORE_BACKEND", "postgres")?;
        let database_url = match store_backend {
            StoreBackend::Postgres => Some(require_env("DATABASE_URL")?),
            StoreBackend::Memory => std::env::var("DATABASE_URL").ok(),
        };
        let production = std::env::var("APP_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Ok(Config {
            store_backend,
            database_url,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: env_or("PORT", "8080").context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            production,
            request_timeout: Duration::from_secs(env_or("AI_REQUEST_TIMEOUT_SECS", "120")?),
            orchestrator: OrchestratorSettings {
                max_retries: env_or("AI_MAX_RETRIES", "2")?,
                retry_backoff: Duration::from_millis(env_or("AI_RETRY_BACKOFF_MS", "500")?),
                validation_policy: env_or::<ValidationPolicy>("AI_VALIDATION_POLICY", "fail_open")?,
            },
            quota: QuotaSettings {
                limits: TierLimits {
                    free_daily_tokens: env_or("TIER_FREE_DAILY_TOKENS", "50000")?,
                    basic_daily_tokens: env_or("TIER_BASIC_DAILY_TOKENS", "500000")?,
                },
                admission: env_or::<QuotaAdmission>("AI_QUOTA_ADMISSION", "current")?,
                dev_mode: env_or("AI_DEV_MODE", "false")?,
            },
            rate_limit: RateLimitSettings {
                defaults: RateLimits {
                    requests_per_minute: env_or("RATE_LIMIT_DEFAULT_RPM", "5")?,
                    requests_per_hour: env_or("RATE_LIMIT_DEFAULT_RPH", "100")?,
                    requests_per_day: env_or("RATE_LIMIT_DEFAULT_RPD", "1000")?,
                },
                bypass: env_or("RATE_LIMIT_BYPASS", "false")?,
                production,
            },
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    parse_value(key, &raw)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value '{raw}' for {key}: {e}"))
}
