//! Usage Quota Tracker: per-user, per-UTC-day token accounting against the
//! ceiling of the user's subscription tier.
//!
//! Admission is best-effort: concurrent requests can all pass `check_intent`
//! before any of their `record_usage` calls land.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ai::error::AiError;
use crate::ai::store::{GovernanceStore, UsageDelta};
use crate::models::usage::UsageRecord;

// ────────────────────────────────────────────────────────────────────────────
// Tiers and settings
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Free,
    Basic,
    /// Development mode: usage is tracked but never limited.
    Dev,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "FREE"),
            Tier::Basic => write!(f, "BASIC"),
            Tier::Dev => write!(f, "DEV"),
        }
    }
}

/// Daily token ceilings per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub free_daily_tokens: u64,
    pub basic_daily_tokens: u64,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free_daily_tokens: 50_000,
            basic_daily_tokens: 500_000,
        }
    }
}

/// How `check_intent` uses the request estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuotaAdmission {
    /// Deny only when usage already recorded today exceeds the ceiling.
    /// The estimate is logged but not added, so one oversized request can
    /// overshoot the quota before the next one is denied.
    #[default]
    Current,
    /// Deny when recorded usage plus the estimate would exceed the ceiling.
    Projected,
}

impl FromStr for QuotaAdmission {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "projected" => Ok(Self::Projected),
            other => anyhow::bail!("unknown quota admission policy '{other}' (expected current|projected)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaSettings {
    pub limits: TierLimits,
    pub admission: QuotaAdmission,
    /// Every user is treated as `Tier::Dev`.
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    #[default]
    Daily,
    Monthly,
}

// ────────────────────────────────────────────────────────────────────────────
// Results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub tier: Tier,
    pub current_usage: u64,
    pub estimated_tokens: u64,
    /// `None` when the tier is unbounded.
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub user_id: Uuid,
    pub period: UsagePeriod,
    pub tier: Tier,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub request_count: u64,
    pub failed_request_count: u64,
    pub average_response_time_ms: u64,
    /// Ceiling for the whole period. `None` in DEV mode.
    pub token_limit: Option<u64>,
    /// Rounded to two decimals. Always 0 when unbounded.
    pub token_usage_percent: f64,
    /// `None` in DEV mode (unbounded).
    pub remaining_tokens: Option<u64>,
    pub days: Vec<UsageRecord>,
}

// ────────────────────────────────────────────────────────────────────────────
// Tracker
// ────────────────────────────────────────────────────────────────────────────

pub struct UsageQuotaTracker {
    store: Arc<dyn GovernanceStore>,
    settings: QuotaSettings,
}

impl UsageQuotaTracker {
    pub fn new(store: Arc<dyn GovernanceStore>, settings: QuotaSettings) -> Self {
        Self { store, settings }
    }

    /// Tier derived from subscription status. A store failure degrades to FREE.
    pub async fn tier_for(&self, user_id: Uuid) -> Tier {
        if self.settings.dev_mode {
            return Tier::Dev;
        }
        match self.store.subscription_status(user_id).await {
            Ok(Some(status)) if status.is_paying() => Tier::Basic,
            Ok(_) => Tier::Free,
            Err(e) => {
                warn!("Subscription lookup failed for user {user_id}, assuming FREE tier: {e:#}");
                Tier::Free
            }
        }
    }

    pub fn daily_limit(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Free => Some(self.settings.limits.free_daily_tokens),
            Tier::Basic => Some(self.settings.limits.basic_daily_tokens),
            Tier::Dev => None,
        }
    }

    /// Admission check against today's recorded usage. Fails open on store errors.
    pub async fn check_intent(&self, user_id: Uuid, estimated_tokens: u64) -> QuotaDecision {
        self.check_intent_on(user_id, estimated_tokens, Utc::now().date_naive())
            .await
    }

    pub(crate) async fn check_intent_on(
        &self,
        user_id: Uuid,
        estimated_tokens: u64,
        today: NaiveDate,
    ) -> QuotaDecision {
        let tier = self.tier_for(user_id).await;
        let limit = self.daily_limit(tier);

        let current_usage = match self.store.usage_between(user_id, today, today).await {
            Ok(records) => records.iter().map(|r| r.total_tokens.max(0) as u64).sum(),
            Err(e) => {
                warn!("Usage lookup failed for user {user_id}, admitting request: {e:#}");
                0
            }
        };

        let allowed = match (limit, self.settings.admission) {
            (None, _) => true,
            (Some(limit), QuotaAdmission::Current) => current_usage <= limit,
            (Some(limit), QuotaAdmission::Projected) => {
                current_usage.saturating_add(estimated_tokens) <= limit
            }
        };

        debug!(
            "Quota check user={user_id} tier={tier} usage={current_usage} estimate={estimated_tokens} limit={limit:?} allowed={allowed}"
        );

        QuotaDecision {
            allowed,
            tier,
            current_usage,
            estimated_tokens,
            limit,
        }
    }

    /// Adds one successful request to today's record.
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        client_id: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
        response_time_ms: u64,
    ) -> Result<()> {
        let delta =
            UsageDelta::success(client_id, prompt_tokens, completion_tokens, response_time_ms);
        self.store
            .upsert_usage(user_id, Utc::now().date_naive(), &delta)
            .await
    }

    /// Counts a request that failed after exhausting its retries, charging
    /// whatever tokens its attempts consumed.
    pub async fn record_failed_attempt(
        &self,
        user_id: Uuid,
        client_id: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<()> {
        let delta = UsageDelta::failure(client_id, prompt_tokens, completion_tokens);
        self.store
            .upsert_usage(user_id, Utc::now().date_naive(), &delta)
            .await
    }

    pub async fn get_user_usage_stats(
        &self,
        user_id: Uuid,
        period: UsagePeriod,
    ) -> Result<UsageStats, AiError> {
        self.stats_on(user_id, period, Utc::now().date_naive()).await
    }

    pub(crate) async fn stats_on(
        &self,
        user_id: Uuid,
        period: UsagePeriod,
        today: NaiveDate,
    ) -> Result<UsageStats, AiError> {
        let start_date = match period {
            UsagePeriod::Daily => today,
            UsagePeriod::Monthly => today.with_day(1).unwrap_or(today),
        };
        let days = self.store.usage_between(user_id, start_date, today).await?;

        let sum = |f: fn(&UsageRecord) -> i64| days.iter().map(|r| f(r).max(0) as u64).sum::<u64>();
        let prompt_tokens = sum(|r| r.prompt_tokens);
        let completion_tokens = sum(|r| r.completion_tokens);
        let total_tokens = prompt_tokens + completion_tokens;
        let request_count = sum(|r| r.request_count as i64);
        let failed_request_count = sum(|r| r.failed_request_count as i64);
        let response_time_ms = sum(|r| r.response_time_ms);
        let average_response_time_ms = if request_count > 0 {
            response_time_ms / request_count
        } else {
            0
        };

        let tier = self.tier_for(user_id).await;
        let token_limit = self.daily_limit(tier).map(|daily| match period {
            UsagePeriod::Daily => daily,
            UsagePeriod::Monthly => daily.saturating_mul(days_in_month(today)),
        });
        let token_usage_percent = token_limit
            .filter(|limit| *limit > 0)
            .map(|limit| round2(total_tokens as f64 / limit as f64 * 100.0))
            .unwrap_or(0.0);
        let remaining_tokens = token_limit.map(|limit| limit.saturating_sub(total_tokens));

        Ok(UsageStats {
            user_id,
            period,
            tier,
            start_date,
            end_date: today,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            request_count,
            failed_request_count,
            average_response_time_ms,
            token_limit,
            token_usage_percent,
            remaining_tokens,
            days,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn days_in_month(date: NaiveDate) -> u64 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(year, month, 1);
    let first_of_this = date.with_day(1);
    match (first_of_next, first_of_this) {
        (Some(next), Some(this)) => (next - this).num_days() as u64,
        _ => 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::store::MemoryStore;
    use crate::models::usage::{RateLimitConfigRow, SubscriptionStatus};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn tracker_with(store: Arc<MemoryStore>, settings: QuotaSettings) -> UsageQuotaTracker {
        UsageQuotaTracker::new(store, settings)
    }

    async fn seed_tokens(store: &MemoryStore, user: Uuid, day: NaiveDate, total: u64) {
        let prompt = total / 2;
        store
            .upsert_usage(user, day, &UsageDelta::success(None, prompt, total - prompt, 10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_basic_tier_boundary_ignores_estimate() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());

        let over = Uuid::new_v4();
        store.set_subscription(over, SubscriptionStatus::Active).unwrap();
        seed_tokens(&store, over, today(), 500_001).await;
        let decision = tracker.check_intent(over, 10).await;
        assert_eq!(decision.tier, Tier::Basic);
        assert!(!decision.allowed);

        let under = Uuid::new_v4();
        store.set_subscription(under, SubscriptionStatus::Active).unwrap();
        seed_tokens(&store, under, today(), 499_999).await;
        let decision = tracker.check_intent(under, 1_000_000).await;
        assert!(decision.allowed, "estimate must not count under current admission");
        assert_eq!(decision.limit, Some(500_000));
    }

    #[tokio::test]
    async fn test_free_tier_without_subscription() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();

        seed_tokens(&store, user, today(), 40_000).await;
        let decision = tracker.check_intent(user, 25_000).await;
        assert_eq!(decision.tier, Tier::Free);
        assert!(decision.allowed);

        seed_tokens(&store, user, today(), 10_000).await;
        assert!(tracker.check_intent(user, 1).await.allowed, "exactly at limit is not over it");

        seed_tokens(&store, user, today(), 1).await;
        assert!(!tracker.check_intent(user, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_lapsed_subscription_is_free_tier() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();
        store.set_subscription(user, SubscriptionStatus::PastDue).unwrap();
        assert_eq!(tracker.tier_for(user).await, Tier::Free);
    }

    #[tokio::test]
    async fn test_projected_admission_counts_estimate() {
        let store = Arc::new(MemoryStore::new());
        let settings = QuotaSettings {
            admission: QuotaAdmission::Projected,
            ..Default::default()
        };
        let tracker = tracker_with(store.clone(), settings);
        let user = Uuid::new_v4();
        seed_tokens(&store, user, today(), 40_000).await;

        assert!(tracker.check_intent(user, 10_000).await.allowed);
        assert!(!tracker.check_intent(user, 10_001).await.allowed);
    }

    #[tokio::test]
    async fn test_yesterdays_usage_does_not_count() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();
        let day = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
        seed_tokens(&store, user, day.pred_opt().unwrap(), 90_000).await;

        let decision = tracker.check_intent_on(user, 100, day).await;
        assert!(decision.allowed);
        assert_eq!(decision.current_usage, 0);
    }

    #[tokio::test]
    async fn test_dev_mode_is_unbounded() {
        let store = Arc::new(MemoryStore::new());
        let settings = QuotaSettings {
            dev_mode: true,
            ..Default::default()
        };
        let tracker = tracker_with(store.clone(), settings);
        let user = Uuid::new_v4();
        seed_tokens(&store, user, today(), 10_000_000).await;

        let decision = tracker.check_intent(user, 1).await;
        assert!(decision.allowed);
        assert_eq!(decision.tier, Tier::Dev);
        assert_eq!(decision.limit, None);

        let stats = tracker.get_user_usage_stats(user, UsagePeriod::Daily).await.unwrap();
        assert_eq!(stats.token_limit, None);
        assert_eq!(stats.remaining_tokens, None);
        assert_eq!(stats.token_usage_percent, 0.0);
    }

    #[tokio::test]
    async fn test_total_is_always_sum_of_parts() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();

        tracker.record_usage(user, Some("claude"), 120, 30, 400).await.unwrap();
        tracker.record_failed_attempt(user, Some("claude"), 40, 10).await.unwrap();
        tracker.record_usage(user, None, 7, 0, 50).await.unwrap();
        tracker.record_usage(user, Some("claude"), 0, 9, 50).await.unwrap();

        let records = store.usage_between(user, today(), today()).await.unwrap();
        for r in &records {
            assert_eq!(r.total_tokens, r.prompt_tokens + r.completion_tokens);
        }
        assert_eq!(records[0].total_tokens, 216);
        assert_eq!(records[0].request_count, 3);
        assert_eq!(records[0].failed_request_count, 1);
    }

    #[tokio::test]
    async fn test_daily_stats_aggregation_and_rounding() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();

        tracker.record_usage(user, Some("claude"), 1000, 500, 800).await.unwrap();
        tracker.record_usage(user, Some("claude"), 2000, 1000, 1200).await.unwrap();

        let stats = tracker.get_user_usage_stats(user, UsagePeriod::Daily).await.unwrap();
        assert_eq!(stats.total_tokens, 4500);
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.average_response_time_ms, 1000);
        assert_eq!(stats.token_limit, Some(50_000));
        assert_eq!(stats.token_usage_percent, 9.0);
        assert_eq!(stats.remaining_tokens, Some(45_500));

        let basic = Uuid::new_v4();
        store.set_subscription(basic, SubscriptionStatus::Active).unwrap();
        tracker.record_usage(basic, None, 1000, 333, 0).await.unwrap();
        let stats = tracker.get_user_usage_stats(basic, UsagePeriod::Daily).await.unwrap();
        // 1333 / 500000 = 0.2666% → 0.27
        assert_eq!(stats.token_usage_percent, 0.27);
    }

    #[tokio::test]
    async fn test_monthly_stats_cover_month_to_date() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker_with(store.clone(), QuotaSettings::default());
        let user = Uuid::new_v4();
        let today = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();

        seed_tokens(&store, user, NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(), 9_000).await;
        seed_tokens(&store, user, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(), 1_000).await;
        seed_tokens(&store, user, today, 2_000).await;

        let stats = tracker.stats_on(user, UsagePeriod::Monthly, today).await.unwrap();
        assert_eq!(stats.start_date, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert_eq!(stats.total_tokens, 3_000);
        assert_eq!(stats.days.len(), 2);
        // February 2026 has 28 days.
        assert_eq!(stats.token_limit, Some(50_000 * 28));
        assert_eq!(stats.remaining_tokens, Some(50_000 * 28 - 3_000));
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()), 29);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()), 31);
        assert_eq!(days_in_month(NaiveDate::from_ymd_opt(2026, 4, 1).unwrap()), 30);
    }

    #[test]
    fn test_quota_admission_parse() {
        assert_eq!("Projected".parse::<QuotaAdmission>().unwrap(), QuotaAdmission::Projected);
        assert!("strict".parse::<QuotaAdmission>().is_err());
    }

    struct BrokenStore;

    #[async_trait]
    impl GovernanceStore for BrokenStore {
        async fn upsert_usage(&self, _: Uuid, _: NaiveDate, _: &UsageDelta) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn usage_between(&self, _: Uuid, _: NaiveDate, _: NaiveDate) -> Result<Vec<UsageRecord>> {
            anyhow::bail!("connection refused")
        }
        async fn increment_rate_bucket(&self, _: Uuid, _: &str, _: DateTime<Utc>) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn sum_rate_buckets(&self, _: Uuid, _: &str, _: DateTime<Utc>, _: DateTime<Utc>) -> Result<u64> {
            anyhow::bail!("connection refused")
        }
        async fn rate_limit_config(&self, _: &str) -> Result<Option<RateLimitConfigRow>> {
            anyhow::bail!("connection refused")
        }
        async fn subscription_status(&self, _: Uuid) -> Result<Option<SubscriptionStatus>> {
            anyhow::bail!("connection refused")
        }
        async fn purge_rate_buckets_before(&self, _: DateTime<Utc>) -> Result<u64> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_on_admission_but_not_on_stats() {
        let tracker = UsageQuotaTracker::new(Arc::new(BrokenStore), QuotaSettings::default());
        let user = Uuid::new_v4();
        let decision = tracker.check_intent(user, 100).await;
        assert!(decision.allowed);
        assert_eq!(decision.tier, Tier::Free);

        assert!(tracker.record_usage(user, None, 1, 1, 1).await.is_err());
        let err = tracker
            .get_user_usage_stats(user, UsagePeriod::Daily)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Store(_)));
    }
}
