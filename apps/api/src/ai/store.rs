//! Persistence boundary for usage and rate-limit counters.
//!
//! All counter mutations are single atomic upserts keyed by
//! (user, day) and (user, client, minute). The tracker and limiter hold no
//! locks of their own; concurrent requests coordinate only through these.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::usage::{RateLimitConfigRow, SubscriptionStatus, UsageRecord};

/// Increment applied to a day's usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub requests: u32,
    pub failed_requests: u32,
    pub response_time_ms: u64,
    pub client_id: Option<String>,
}

impl UsageDelta {
    pub fn success(
        client_id: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
        response_time_ms: u64,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            requests: 1,
            failed_requests: 0,
            response_time_ms,
            client_id: client_id.map(String::from),
        }
    }

    /// A failed request still carries the tokens its provider calls consumed.
    pub fn failure(client_id: Option<&str>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            failed_requests: 1,
            client_id: client_id.map(String::from),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait GovernanceStore: Send + Sync {
    /// Creates the (user, day) record if absent, then adds `delta`, atomically.
    async fn upsert_usage(&self, user_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> Result<()>;

    /// Records with `from <= usage_date <= to`, oldest first.
    async fn usage_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UsageRecord>>;

    /// Creates the (user, client, minute) bucket if absent, then increments it, atomically.
    async fn increment_rate_bucket(
        &self,
        user_id: Uuid,
        client_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<()>;

    /// Sum of bucket counts with `from <= window_start <= to`.
    async fn sum_rate_buckets(
        &self,
        user_id: Uuid,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64>;

    async fn rate_limit_config(&self, client_id: &str) -> Result<Option<RateLimitConfigRow>>;

    async fn subscription_status(&self, user_id: Uuid) -> Result<Option<SubscriptionStatus>>;

    /// Deletes buckets older than `cutoff`. Returns how many were removed.
    async fn purge_rate_buckets_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ────────────────────────────────────────────────────────────────────────────

/// Postgres-backed store. Schema: `migrations/0001_ai_governance.sql`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GovernanceStore for PgStore {
    async fn upsert_usage(&self, user_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_usage_records
                (user_id, usage_date, prompt_tokens, completion_tokens,
                 request_count, failed_request_count, client_id, response_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, usage_date) DO UPDATE SET
                prompt_tokens        = ai_usage_records.prompt_tokens + EXCLUDED.prompt_tokens,
                completion_tokens    = ai_usage_records.completion_tokens + EXCLUDED.completion_tokens,
                request_count        = ai_usage_records.request_count + EXCLUDED.request_count,
                failed_request_count = ai_usage_records.failed_request_count + EXCLUDED.failed_request_count,
                client_id            = COALESCE(EXCLUDED.client_id, ai_usage_records.client_id),
                response_time_ms     = ai_usage_records.response_time_ms + EXCLUDED.response_time_ms,
                updated_at           = NOW()
            "#,
        )
        .bind(user_id)
        .bind(day)
        .bind(to_i64(delta.prompt_tokens))
        .bind(to_i64(delta.completion_tokens))
        .bind(delta.requests as i32)
        .bind(delta.failed_requests as i32)
        .bind(delta.client_id.as_deref())
        .bind(to_i64(delta.response_time_ms))
        .execute(&self.pool)
        .await
        .context("Failed to upsert usage record")?;
        Ok(())
    }

    async fn usage_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UsageRecord>> {
        Ok(sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT user_id, usage_date, prompt_tokens, completion_tokens, total_tokens,
                   request_count, failed_request_count, client_id, response_time_ms,
                   created_at, updated_at
            FROM ai_usage_records
            WHERE user_id = $1 AND usage_date >= $2 AND usage_date <= $3
            ORDER BY usage_date ASC
            "#,
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load usage records")?)
    }

    async fn increment_rate_bucket(
        &self,
        user_id: Uuid,
        client_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_rate_limit_usage (user_id, client_id, window_start, request_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, client_id, window_start)
            DO UPDATE SET request_count = ai_rate_limit_usage.request_count + 1
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(window_start)
        .execute(&self.pool)
        .await
        .context("Failed to increment rate limit bucket")?;
        Ok(())
    }

    async fn sum_rate_buckets(
        &self,
        user_id: Uuid,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(request_count), 0)::BIGINT
            FROM ai_rate_limit_usage
            WHERE user_id = $1 AND client_id = $2
              AND window_start >= $3 AND window_start <= $4
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("Failed to sum rate limit buckets")?;
        Ok(total.max(0) as u64)
    }

    async fn rate_limit_config(&self, client_id: &str) -> Result<Option<RateLimitConfigRow>> {
        Ok(sqlx::query_as::<_, RateLimitConfigRow>(
            r#"
            SELECT client_id, requests_per_minute, requests_per_hour, requests_per_day
            FROM ai_rate_limit_configs
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load rate limit config")?)
    }

    async fn subscription_status(&self, user_id: Uuid) -> Result<Option<SubscriptionStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM subscriptions WHERE user_id = $1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load subscription status")?;
        Ok(status.as_deref().and_then(SubscriptionStatus::parse))
    }

    async fn purge_rate_buckets_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ai_rate_limit_usage WHERE window_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge rate limit buckets")?;
        Ok(result.rows_affected())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

type BucketKey = (Uuid, String, DateTime<Utc>);

#[derive(Default)]
struct MemoryState {
    usage: HashMap<(Uuid, NaiveDate), UsageRecord>,
    buckets: HashMap<BucketKey, u64>,
    configs: HashMap<String, RateLimitConfigRow>,
    subscriptions: HashMap<Uuid, SubscriptionStatus>,
}

/// Process-local store for development (`STORE_BACKEND=memory`) and tests.
/// Each operation runs inside one critical section, which gives it the same
/// atomicity as the Postgres upserts.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(f(&mut state))
    }

    pub fn set_rate_limit_config(&self, config: RateLimitConfigRow) -> Result<()> {
        self.with_state(|s| {
            s.configs.insert(config.client_id.clone(), config);
        })
    }

    pub fn set_subscription(&self, user_id: Uuid, status: SubscriptionStatus) -> Result<()> {
        self.with_state(|s| {
            s.subscriptions.insert(user_id, status);
        })
    }
}

#[async_trait]
impl GovernanceStore for MemoryStore {
    async fn upsert_usage(&self, user_id: Uuid, day: NaiveDate, delta: &UsageDelta) -> Result<()> {
        self.with_state(|s| {
            let now = Utc::now();
            let record = s.usage.entry((user_id, day)).or_insert_with(|| UsageRecord {
                user_id,
                usage_date: day,
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                request_count: 0,
                failed_request_count: 0,
                client_id: None,
                response_time_ms: 0,
                created_at: now,
                updated_at: now,
            });
            record.prompt_tokens += to_i64(delta.prompt_tokens);
            record.completion_tokens += to_i64(delta.completion_tokens);
            record.total_tokens = record.prompt_tokens + record.completion_tokens;
            record.request_count += delta.requests as i32;
            record.failed_request_count += delta.failed_requests as i32;
            if delta.client_id.is_some() {
                record.client_id = delta.client_id.clone();
            }
            record.response_time_ms += to_i64(delta.response_time_ms);
            record.updated_at = now;
        })
    }

    async fn usage_between(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<UsageRecord>> {
        self.with_state(|s| {
            let mut records: Vec<UsageRecord> = s
                .usage
                .values()
                .filter(|r| r.user_id == user_id && r.usage_date >= from && r.usage_date <= to)
                .cloned()
                .collect();
            records.sort_by_key(|r| r.usage_date);
            records
        })
    }

    async fn increment_rate_bucket(
        &self,
        user_id: Uuid,
        client_id: &str,
        window_start: DateTime<Utc>,
    ) -> Result<()> {
        self.with_state(|s| {
            *s.buckets
                .entry((user_id, client_id.to_string(), window_start))
                .or_insert(0) += 1;
        })
    }

    async fn sum_rate_buckets(
        &self,
        user_id: Uuid,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64> {
        self.with_state(|s| {
            s.buckets
                .iter()
                .filter(|((uid, cid, start), _)| {
                    *uid == user_id && cid == client_id && *start >= from && *start <= to
                })
                .map(|(_, count)| *count)
                .sum()
        })
    }

    async fn rate_limit_config(&self, client_id: &str) -> Result<Option<RateLimitConfigRow>> {
        self.with_state(|s| s.configs.get(client_id).cloned())
    }

    async fn subscription_status(&self, user_id: Uuid) -> Result<Option<SubscriptionStatus>> {
        self.with_state(|s| s.subscriptions.get(&user_id).copied())
    }

    async fn purge_rate_buckets_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_state(|s| {
            let before = s.buckets.len();
            s.buckets.retain(|(_, _, start), _| *start >= cutoff);
            (before - s.buckets.len()) as u64
        })
    }
}
