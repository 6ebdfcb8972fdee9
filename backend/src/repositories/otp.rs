use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::otp::OtpRecord;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// Replaces any pending code for the contact.
    async fn upsert(&self, record: &OtpRecord) -> Result<(), AppError>;

    async fn find(&self, contact: &str) -> Result<Option<OtpRecord>, AppError>;

    /// Atomically bumps the wrong-attempt counter, returning the new value.
    /// `None` when there is no code or it already holds `max_attempts`.
    async fn increment_attempts(
        &self,
        contact: &str,
        max_attempts: i32,
    ) -> Result<Option<i32>, AppError>;

    /// Deletes the pending code only if it is still `code_hash`, unexpired at
    /// `now`, and below `max_attempts`. Returns whether this caller removed it.
    async fn consume(
        &self,
        contact: &str,
        code_hash: &str,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn delete(&self, contact: &str) -> Result<bool, AppError>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct PgOtpStore {
    pool: PgPool,
}

impl PgOtpStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OtpStore for PgOtpStore {
    async fn upsert(&self, record: &OtpRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO otp_codes (contact, code_hash, expires_at, attempts, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (contact) DO UPDATE SET \
                code_hash = EXCLUDED.code_hash, \
                expires_at = EXCLUDED.expires_at, \
                attempts = EXCLUDED.attempts, \
                created_at = EXCLUDED.created_at",
        )
        .bind(&record.contact)
        .bind(&record.code_hash)
        .bind(record.expires_at)
        .bind(record.attempts)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, contact: &str) -> Result<Option<OtpRecord>, AppError> {
        let record = sqlx::query_as::<_, OtpRecord>(
            "SELECT contact, code_hash, expires_at, attempts, created_at \
             FROM otp_codes WHERE contact = $1",
        )
        .bind(contact)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn increment_attempts(
        &self,
        contact: &str,
        max_attempts: i32,
    ) -> Result<Option<i32>, AppError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE otp_codes SET attempts = attempts + 1 \
             WHERE contact = $1 AND attempts < $2 \
             RETURNING attempts",
        )
        .bind(contact)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn consume(
        &self,
        contact: &str,
        code_hash: &str,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM otp_codes \
             WHERE contact = $1 AND code_hash = $2 AND attempts < $3 AND expires_at > $4",
        )
        .bind(contact)
        .bind(code_hash)
        .bind(max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, contact: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM otp_codes WHERE contact = $1")
            .bind(contact)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM otp_codes WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
