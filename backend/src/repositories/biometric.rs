use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::biometric::{
    BiometricAttempt, BiometricTemplate, BiometricType, EnrollmentOutcome,
};
use crate::repositories::transaction::{
    begin_transaction, commit_transaction, conflict_on_unique, lock_scope,
};
use crate::types::{TemplateId, UserId};

const TEMPLATE_COLUMNS: &str = "id, user_id, biometric_type, encrypted_template, template_hash, \
     quality_score, verification_count, successful_verifications, failed_verifications, \
     created_at, expires_at, is_active";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BiometricStore: Send + Sync {
    /// Stores the template unless the user already holds `cap` usable
    /// templates of its type or another user holds a usable template with the
    /// same hash. Concurrent enrollments are serialized on both.
    async fn insert_capped(
        &self,
        template: &BiometricTemplate,
        cap: i64,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentOutcome, AppError>;

    /// Active, unexpired templates ordered by quality, best first.
    async fn list_usable(
        &self,
        user_id: UserId,
        kind: BiometricType,
        now: DateTime<Utc>,
    ) -> Result<Vec<BiometricTemplate>, AppError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<BiometricTemplate>, AppError>;

    async fn record_outcome(&self, id: TemplateId, success: bool) -> Result<(), AppError>;

    async fn revoke(&self, user_id: UserId, id: TemplateId) -> Result<bool, AppError>;

    async fn log_attempt(&self, attempt: &BiometricAttempt) -> Result<(), AppError>;

    async fn attempts_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BiometricAttempt>, AppError>;
}

#[derive(Clone)]
pub struct PgBiometricStore {
    pool: PgPool,
}

impl PgBiometricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BiometricStore for PgBiometricStore {
    async fn insert_capped(
        &self,
        template: &BiometricTemplate,
        cap: i64,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentOutcome, AppError> {
        let mut tx = begin_transaction(&self.pool).await?;
        lock_scope(
            &mut tx,
            &format!("biometric:{}:{}", template.user_id, template.biometric_type),
        )
        .await?;
        lock_scope(&mut tx, &format!("biometric_hash:{}", template.template_hash)).await?;

        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM biometric_templates \
             WHERE template_hash = $1 AND user_id <> $2 AND is_active AND expires_at > $3)",
        )
        .bind(&template.template_hash)
        .bind(template.user_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        if taken {
            return Ok(EnrollmentOutcome::DuplicateTemplate);
        }

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM biometric_templates \
             WHERE user_id = $1 AND biometric_type = $2 AND is_active AND expires_at > $3",
        )
        .bind(template.user_id)
        .bind(template.biometric_type)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        if active >= cap {
            return Ok(EnrollmentOutcome::CapReached);
        }

        let sql = format!(
            "INSERT INTO biometric_templates ({TEMPLATE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        sqlx::query(&sql)
            .bind(template.id)
            .bind(template.user_id)
            .bind(template.biometric_type)
            .bind(&template.encrypted_template)
            .bind(&template.template_hash)
            .bind(template.quality_score)
            .bind(template.verification_count)
            .bind(template.successful_verifications)
            .bind(template.failed_verifications)
            .bind(template.created_at)
            .bind(template.expires_at)
            .bind(template.is_active)
            .execute(&mut *tx)
            .await
            .map_err(|err| conflict_on_unique(err, "Biometric template already exists"))?;
        commit_transaction(tx).await?;
        Ok(EnrollmentOutcome::Inserted)
    }

    async fn list_usable(
        &self,
        user_id: UserId,
        kind: BiometricType,
        now: DateTime<Utc>,
    ) -> Result<Vec<BiometricTemplate>, AppError> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM biometric_templates \
             WHERE user_id = $1 AND biometric_type = $2 AND is_active AND expires_at > $3 \
             ORDER BY quality_score DESC, created_at DESC"
        );
        let templates = sqlx::query_as::<_, BiometricTemplate>(&sql)
            .bind(user_id)
            .bind(kind)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(templates)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<BiometricTemplate>, AppError> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM biometric_templates \
             WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let templates = sqlx::query_as::<_, BiometricTemplate>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(templates)
    }

    async fn record_outcome(&self, id: TemplateId, success: bool) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE biometric_templates SET \
                verification_count = verification_count + 1, \
                successful_verifications = successful_verifications + CASE WHEN $2 THEN 1 ELSE 0 END, \
                failed_verifications = failed_verifications + CASE WHEN $2 THEN 0 ELSE 1 END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, user_id: UserId, id: TemplateId) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE biometric_templates SET is_active = FALSE \
             WHERE id = $1 AND user_id = $2 AND is_active",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn log_attempt(&self, attempt: &BiometricAttempt) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO biometric_attempts \
             (user_id, biometric_type, template_id, score, success, device_fingerprint, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(attempt.user_id)
        .bind(attempt.biometric_type)
        .bind(attempt.template_id)
        .bind(attempt.score)
        .bind(attempt.success)
        .bind(&attempt.device_fingerprint)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attempts_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BiometricAttempt>, AppError> {
        let attempts = sqlx::query_as::<_, BiometricAttempt>(
            "SELECT user_id, biometric_type, template_id, score, success, device_fingerprint, \
             created_at FROM biometric_attempts \
             WHERE user_id = $1 AND created_at >= $2 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }
}
