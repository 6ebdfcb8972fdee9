//! Single-use ledger for refresh tokens that are not bound to a session.

use async_trait::async_trait;
use bb8_redis::redis;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::redis::RedisPool;
use crate::error::AppError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefreshTokenLedger: Send + Sync {
    /// Records `jti` as spent. Returns `false` when it had already been claimed.
    async fn claim(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool, AppError>;

    /// Removes claims whose token would have expired anyway.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

pub struct RedisRefreshLedger {
    pool: RedisPool,
}

impl RedisRefreshLedger {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn claim_key(jti: &str) -> String {
        format!("refresh_claim:{}", jti)
    }
}

#[async_trait]
impl RefreshTokenLedger for RedisRefreshLedger {
    async fn claim(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool, AppError> {
        let span = tracing::debug_span!("redis_claim_refresh", jti);
        let _enter = span.enter();

        let ttl_seconds = (expires_at - Utc::now()).num_seconds().max(1);
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::claim_key(jti))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, Option<String>>(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64, AppError> {
        // Keys carry their own TTL.
        Ok(0)
    }
}

#[derive(Clone)]
pub struct PgRefreshLedger {
    pool: PgPool,
}

impl PgRefreshLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenLedger for PgRefreshLedger {
    async fn claim(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT INTO refresh_token_claims (jti, expires_at, claimed_at) \
             VALUES ($1, $2, NOW()) ON CONFLICT (jti) DO NOTHING",
        )
        .bind(jti)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM refresh_token_claims WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
