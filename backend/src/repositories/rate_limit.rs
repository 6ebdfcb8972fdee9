//! Sliding-window counters keyed by `hash(identifier:action)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::rate_limit::{
    apply_step, RateLimitDecision, RateLimitRecord, RateLimitStep, RateLimitSubject,
};
use crate::repositories::transaction::{begin_transaction, commit_transaction, lock_scope};

const RECORD_COLUMNS: &str = "key, identifier, action, attempts, first_attempt_at, last_attempt_at, \
     blocked_until, successful_attempts, total_attempts, total_blocked_duration";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Reads the counter, applies `step` and writes the result back as one
    /// atomic unit, so concurrent callers on the same key are serialized.
    async fn transition(
        &self,
        subject: &RateLimitSubject,
        step: RateLimitStep,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError>;

    async fn find(&self, key: &str) -> Result<Option<RateLimitRecord>, AppError>;

    async fn reset(&self, key: &str) -> Result<bool, AppError>;

    /// Deletes rows with no live block whose last attempt predates `cutoff`.
    async fn delete_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn transition(
        &self,
        subject: &RateLimitSubject,
        step: RateLimitStep,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut tx = begin_transaction(&self.pool).await?;
        lock_scope(&mut tx, &format!("rate_limit:{}", subject.key)).await?;

        let sql = format!("SELECT {RECORD_COLUMNS} FROM rate_limits WHERE key = $1");
        let current = sqlx::query_as::<_, RateLimitRecord>(&sql)
            .bind(&subject.key)
            .fetch_optional(&mut *tx)
            .await?;

        let transition = apply_step(current, subject, step, now);
        if let Some(record) = &transition.record {
            sqlx::query(
                "INSERT INTO rate_limits (key, identifier, action, attempts, first_attempt_at, \
                 last_attempt_at, blocked_until, successful_attempts, total_attempts, \
                 total_blocked_duration) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (key) DO UPDATE SET \
                    attempts = EXCLUDED.attempts, \
                    first_attempt_at = EXCLUDED.first_attempt_at, \
                    last_attempt_at = EXCLUDED.last_attempt_at, \
                    blocked_until = EXCLUDED.blocked_until, \
                    successful_attempts = EXCLUDED.successful_attempts, \
                    total_attempts = EXCLUDED.total_attempts, \
                    total_blocked_duration = EXCLUDED.total_blocked_duration",
            )
            .bind(&record.key)
            .bind(&record.identifier)
            .bind(&record.action)
            .bind(record.attempts)
            .bind(record.first_attempt_at)
            .bind(record.last_attempt_at)
            .bind(record.blocked_until)
            .bind(record.successful_attempts)
            .bind(record.total_attempts)
            .bind(record.total_blocked_duration)
            .execute(&mut *tx)
            .await?;
        }

        commit_transaction(tx).await?;
        Ok(transition.decision)
    }

    async fn find(&self, key: &str) -> Result<Option<RateLimitRecord>, AppError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM rate_limits WHERE key = $1");
        let record = sqlx::query_as::<_, RateLimitRecord>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn reset(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM rate_limits \
             WHERE last_attempt_at < $1 AND (blocked_until IS NULL OR blocked_until <= $2)",
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
