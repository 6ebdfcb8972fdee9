use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::two_factor::{TwoFactorAttempt, TwoFactorCredential};
use crate::repositories::transaction::{begin_transaction, commit_transaction, conflict_on_unique};
use crate::types::{CredentialId, UserId};

const CREDENTIAL_COLUMNS: &str =
    "id, user_id, method, secret, destination, last_used_at, created_at, is_active";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TwoFactorStore: Send + Sync {
    async fn find_active(&self, user_id: UserId) -> Result<Option<TwoFactorCredential>, AppError>;

    /// Fails with Conflict when the user already has an active credential.
    async fn insert_active(&self, credential: &TwoFactorCredential) -> Result<(), AppError>;

    async fn update_secret(&self, id: CredentialId, secret: &str) -> Result<(), AppError>;

    /// Swaps the secret only while it still equals `expected`. Returns whether
    /// this caller made the swap.
    async fn consume_secret(
        &self,
        id: CredentialId,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, AppError>;

    async fn touch(&self, id: CredentialId, now: DateTime<Utc>) -> Result<(), AppError>;

    async fn deactivate(&self, user_id: UserId) -> Result<bool, AppError>;

    /// Drops every unused code for the user and stores the new batch.
    async fn replace_backup_codes(
        &self,
        user_id: UserId,
        code_hashes: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Marks the code used if it exists and is still unused.
    async fn consume_backup_code(
        &self,
        user_id: UserId,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn count_unused_backup_codes(&self, user_id: UserId) -> Result<i64, AppError>;

    async fn revoke_unused_backup_codes(&self, user_id: UserId) -> Result<u64, AppError>;

    async fn log_attempt(&self, attempt: &TwoFactorAttempt) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgTwoFactorStore {
    pool: PgPool,
}

impl PgTwoFactorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TwoFactorStore for PgTwoFactorStore {
    async fn find_active(&self, user_id: UserId) -> Result<Option<TwoFactorCredential>, AppError> {
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM two_factor_credentials \
             WHERE user_id = $1 AND is_active"
        );
        let credential = sqlx::query_as::<_, TwoFactorCredential>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(credential)
    }

    async fn insert_active(&self, credential: &TwoFactorCredential) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO two_factor_credentials ({CREDENTIAL_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        sqlx::query(&sql)
            .bind(credential.id)
            .bind(credential.user_id)
            .bind(credential.method)
            .bind(&credential.secret)
            .bind(&credential.destination)
            .bind(credential.last_used_at)
            .bind(credential.created_at)
            .bind(credential.is_active)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_on_unique(e, "Two-factor authentication is already enabled"))?;
        Ok(())
    }

    async fn update_secret(&self, id: CredentialId, secret: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE two_factor_credentials SET secret = $1 WHERE id = $2")
            .bind(secret)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume_secret(
        &self,
        id: CredentialId,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE two_factor_credentials SET secret = $3 \
             WHERE id = $1 AND secret = $2 AND is_active",
        )
        .bind(id)
        .bind(expected)
        .bind(replacement)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: CredentialId, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE two_factor_credentials SET last_used_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate(&self, user_id: UserId) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE two_factor_credentials SET is_active = FALSE WHERE user_id = $1 AND is_active",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_backup_codes(
        &self,
        user_id: UserId,
        code_hashes: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut tx = begin_transaction(&self.pool).await?;
        sqlx::query("DELETE FROM backup_codes WHERE user_id = $1 AND NOT is_used")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for hash in code_hashes {
            sqlx::query(
                "INSERT INTO backup_codes (user_id, code_hash, is_used, used_at, created_at) \
                 VALUES ($1, $2, FALSE, NULL, $3)",
            )
            .bind(user_id)
            .bind(hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        commit_transaction(tx).await?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: UserId,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE backup_codes SET is_used = TRUE, used_at = $1 \
             WHERE user_id = $2 AND code_hash = $3 AND NOT is_used",
        )
        .bind(now)
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_unused_backup_codes(&self, user_id: UserId) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM backup_codes WHERE user_id = $1 AND NOT is_used",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn revoke_unused_backup_codes(&self, user_id: UserId) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM backup_codes WHERE user_id = $1 AND NOT is_used")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn log_attempt(&self, attempt: &TwoFactorAttempt) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO two_factor_attempts (user_id, method, success, device_fingerprint, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(attempt.user_id)
        .bind(attempt.method)
        .bind(attempt.success)
        .bind(&attempt.device_fingerprint)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
