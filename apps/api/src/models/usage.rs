use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One row per (user, UTC day). `total_tokens` is always `prompt_tokens + completion_tokens`
/// (a generated column in Postgres).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    pub user_id: Uuid,
    pub usage_date: NaiveDate,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub request_count: i32,
    pub failed_request_count: i32,
    pub client_id: Option<String>,
    /// Cumulative across the day's requests.
    pub response_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-client rate limit overrides. Absent rows fall back to configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RateLimitConfigRow {
    pub client_id: String,
    pub requests_per_minute: i32,
    pub requests_per_hour: i32,
    pub requests_per_day: i32,
}

/// Subscription status as mirrored from the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    /// Parses the billing provider's lowercase status string. Unknown values yield `None`.
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "trialing" => Some(Self::Trialing),
            "past_due" => Some(Self::PastDue),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "incomplete" => Some(Self::Incomplete),
            "incomplete_expired" => Some(Self::IncompleteExpired),
            "unpaid" => Some(Self::Unpaid),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    pub fn is_paying(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}
