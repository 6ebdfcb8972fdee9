//! Session persistence with the per-user active-session cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::session::Session;
use crate::repositories::transaction::{begin_transaction, commit_transaction, lock_scope};
use crate::types::{SessionId, UserId};

const SESSION_COLUMNS: &str = "id, user_id, device_fingerprint, device_info, location, refresh_jti, \
     created_at, last_active_at, expires_at, is_active";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts `session`, first revoking the oldest active sessions of the same
    /// user so that at most `cap` remain active. Returns the evicted ids.
    ///
    /// Cap check and eviction happen atomically per user.
    async fn insert_capped(&self, session: &Session, cap: usize)
        -> Result<Vec<SessionId>, AppError>;

    async fn find(&self, id: SessionId) -> Result<Option<Session>, AppError>;

    /// Active, unexpired sessions, newest first.
    async fn list_active(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError>;

    /// Compare-and-swap of the accepted refresh token id. Succeeds only while
    /// the session is usable and still expects `expected_jti`.
    async fn rotate_refresh_jti(
        &self,
        id: SessionId,
        expected_jti: &str,
        new_jti: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn revoke(&self, id: SessionId) -> Result<bool, AppError>;

    async fn revoke_all_except(&self, user_id: UserId, except: SessionId)
        -> Result<u64, AppError>;

    async fn revoke_all(&self, user_id: UserId) -> Result<u64, AppError>;

    /// Deletes sessions that are expired or no longer active.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert_capped(
        &self,
        session: &Session,
        cap: usize,
    ) -> Result<Vec<SessionId>, AppError> {
        let mut tx = begin_transaction(&self.pool).await?;
        lock_scope(&mut tx, &format!("sessions:{}", session.user_id)).await?;

        let active: Vec<SessionId> = sqlx::query_scalar(
            "SELECT id FROM sessions \
             WHERE user_id = $1 AND is_active AND expires_at > $2 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(session.user_id)
        .bind(session.created_at)
        .fetch_all(&mut *tx)
        .await?;

        let overflow = (active.len() + 1).saturating_sub(cap.max(1));
        let evicted: Vec<SessionId> = active.into_iter().take(overflow).collect();
        for id in &evicted {
            sqlx::query("UPDATE sessions SET is_active = FALSE WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO sessions (id, user_id, device_fingerprint, device_info, location, \
             refresh_jti, created_at, last_active_at, expires_at, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.device_fingerprint)
        .bind(&session.device_info)
        .bind(&session.location)
        .bind(&session.refresh_jti)
        .bind(session.created_at)
        .bind(session.last_active_at)
        .bind(session.expires_at)
        .bind(session.is_active)
        .execute(&mut *tx)
        .await?;

        commit_transaction(tx).await?;
        Ok(evicted)
    }

    async fn find(&self, id: SessionId) -> Result<Option<Session>, AppError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn list_active(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = $1 AND is_active AND expires_at > $2 \
             ORDER BY created_at DESC, id DESC"
        );
        let sessions = sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn rotate_refresh_jti(
        &self,
        id: SessionId,
        expected_jti: &str,
        new_jti: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE sessions SET refresh_jti = $1, last_active_at = $2 \
             WHERE id = $3 AND refresh_jti = $4 AND is_active AND expires_at > $2",
        )
        .bind(new_jti)
        .bind(now)
        .bind(id)
        .bind(expected_jti)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke(&self, id: SessionId) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE sessions SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_except(
        &self,
        user_id: UserId,
        except: SessionId,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE WHERE user_id = $1 AND id <> $2 AND is_active",
        )
        .bind(user_id)
        .bind(except)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all(&self, user_id: UserId) -> Result<u64, AppError> {
        let result =
            sqlx::query("UPDATE sessions SET is_active = FALSE WHERE user_id = $1 AND is_active")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1 OR NOT is_active")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
