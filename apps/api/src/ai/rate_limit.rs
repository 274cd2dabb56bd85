//! Rate Limiter: per-user-per-client request counting over minute, hour and
//! day windows.
//!
//! Requests are counted in one-minute buckets. A window sums every bucket whose
//! timestamp lies in `[now - window, now]`, so the window can be up to one
//! bucket (≤60s) wider than a continuous sliding window.
//!
//! Store errors never block traffic: checks fail open, record failures are logged.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai::error::AiError;
use crate::ai::store::GovernanceStore;
use crate::models::usage::RateLimitConfigRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    /// Evaluation order. The first violated window wins.
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::Hour, RateWindow::Day];

    pub fn duration(&self) -> Duration {
        match self {
            RateWindow::Minute => Duration::minutes(1),
            RateWindow::Hour => Duration::hours(1),
            RateWindow::Day => Duration::days(1),
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateWindow::Minute => write!(f, "minute"),
            RateWindow::Hour => write!(f, "hour"),
            RateWindow::Day => write!(f, "day"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
}

impl RateLimits {
    pub fn limit_for(&self, window: RateWindow) -> u32 {
        match window {
            RateWindow::Minute => self.requests_per_minute,
            RateWindow::Hour => self.requests_per_hour,
            RateWindow::Day => self.requests_per_day,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 5,
            requests_per_hour: 100,
            requests_per_day: 1000,
        }
    }
}

impl From<RateLimitConfigRow> for RateLimits {
    fn from(row: RateLimitConfigRow) -> Self {
        Self {
            requests_per_minute: row.requests_per_minute.max(0) as u32,
            requests_per_hour: row.requests_per_hour.max(0) as u32,
            requests_per_day: row.requests_per_day.max(0) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitSettings {
    /// Used for clients without a `RateLimitConfig` row.
    pub defaults: RateLimits,
    /// Disables all checks. Ignored when `production` is set.
    pub bypass: bool,
    pub production: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub window: Option<RateWindow>,
    pub reason: Option<String>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            window: None,
            reason: None,
        }
    }

    fn deny(window: RateWindow, current: u64, limit: u32) -> Self {
        Self {
            allowed: false,
            window: Some(window),
            reason: Some(format!(
                "{current} requests in the last {window} (limit {limit} per {window})"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub window: RateWindow,
    pub limit: u32,
    pub used: u64,
    pub remaining: u64,
}

pub struct RateLimiter {
    store: Arc<dyn GovernanceStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn GovernanceStore>, settings: RateLimitSettings) -> Self {
        if settings.bypass && settings.production {
            warn!("Rate limit bypass requested in production, ignoring");
        }
        Self { store, settings }
    }

    fn bypassed(&self) -> bool {
        self.settings.bypass && !self.settings.production
    }

    /// Configured limits for the client, or the global defaults.
    pub async fn limits_for(&self, client_id: &str) -> Result<RateLimits> {
        Ok(self
            .store
            .rate_limit_config(client_id)
            .await?
            .map(RateLimits::from)
            .unwrap_or(self.settings.defaults))
    }

    pub async fn check_rate_limit(&self, user_id: Uuid, client_id: &str) -> RateLimitDecision {
        self.check_rate_limit_at(user_id, client_id, Utc::now()).await
    }

    pub(crate) async fn check_rate_limit_at(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if self.bypassed() {
            return RateLimitDecision::allow();
        }
        match self.evaluate(user_id, client_id, now).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Rate limit check failed for user {user_id} on {client_id}, allowing: {e:#}");
                RateLimitDecision::allow()
            }
        }
    }

    async fn evaluate(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision> {
        let limits = self.limits_for(client_id).await?;
        for window in RateWindow::ALL {
            let limit = limits.limit_for(window);
            let current = self
                .store
                .sum_rate_buckets(user_id, client_id, now - window.duration(), now)
                .await?;
            if current >= u64::from(limit) {
                debug!("Rate limit hit user={user_id} client={client_id} window={window} count={current} limit={limit}");
                return Ok(RateLimitDecision::deny(window, current, limit));
            }
        }
        Ok(RateLimitDecision::allow())
    }

    /// Counts one request in the current minute's bucket. Never fails the caller.
    pub async fn record_request(&self, user_id: Uuid, client_id: &str) {
        self.record_request_at(user_id, client_id, Utc::now()).await
    }

    pub(crate) async fn record_request_at(&self, user_id: Uuid, client_id: &str, now: DateTime<Utc>) {
        let bucket = truncate_to_minute(now);
        if let Err(e) = self.store.increment_rate_bucket(user_id, client_id, bucket).await {
            warn!("Failed to record rate-limited request for user {user_id} on {client_id}: {e:#}");
        }
    }

    /// Usage and remaining budget for every window.
    pub async fn rate_limit_status(
        &self,
        user_id: Uuid,
        client_id: &str,
    ) -> Result<Vec<WindowStatus>, AiError> {
        self.status_at(user_id, client_id, Utc::now()).await
    }

    pub(crate) async fn status_at(
        &self,
        user_id: Uuid,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WindowStatus>, AiError> {
        let limits = self.limits_for(client_id).await?;
        let mut statuses = Vec::with_capacity(RateWindow::ALL.len());
        for window in RateWindow::ALL {
            let limit = limits.limit_for(window);
            let used = self
                .store
                .sum_rate_buckets(user_id, client_id, now - window.duration(), now)
                .await?;
            statuses.push(WindowStatus {
                window,
                limit,
                used,
                remaining: u64::from(limit).saturating_sub(used),
            });
        }
        Ok(statuses)
    }

    /// Drops buckets that can no longer fall inside the day window.
    pub async fn purge_expired_buckets(&self) -> Result<u64> {
        let cutoff = truncate_to_minute(Utc::now()) - RateWindow::Day.duration() - Duration::minutes(1);
        self.store.purge_rate_buckets_before(cutoff).await
    }

    /// Periodically purges expired buckets for the lifetime of the process.
    pub fn spawn_cleanup(self: Arc<Self>, every: std::time::Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match self.purge_expired_buckets().await {
                    Ok(0) => {}
                    Ok(n) => info!("Purged {n} expired rate limit buckets"),
                    Err(e) => warn!("Rate limit bucket purge failed: {e:#}"),
                }
            }
        });
    }
}

pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}
