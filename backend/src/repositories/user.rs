//! User records and the wallet opened alongside each account.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::user::{NewUser, User, Wallet};
use crate::repositories::transaction::{begin_transaction, commit_transaction, conflict_on_unique};
use crate::types::{UserId, WalletId};

const USER_COLUMNS: &str =
    "id, email, phone, password_hash, role, first_name, last_name, is_blocked, created_at, updated_at";
const WALLET_COLUMNS: &str = "id, user_id, balance, currency, created_at";

/// User-record provider: existence checks, blocked status and account creation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AppError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, AppError>;

    /// True when any account already uses `email` or `phone`.
    async fn exists_by_email_or_phone(&self, email: &str, phone: &str) -> Result<bool, AppError>;

    /// Creates the user and a zero-balance wallet in one unit of work.
    async fn create_with_wallet(
        &self,
        user: &NewUser,
        currency: &str,
    ) -> Result<(User, Wallet), AppError>;

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>, AppError>;

    async fn set_blocked(&self, id: UserId, blocked: bool) -> Result<bool, AppError>;
}

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, column: &str, value: &str) -> Result<Option<User>, AppError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AppError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        self.find_one("email", email).await
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, AppError> {
        self.find_one("phone", phone).await
    }

    async fn exists_by_email_or_phone(&self, email: &str, phone: &str) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1 OR phone = $2)",
        )
        .bind(email)
        .bind(phone)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_with_wallet(
        &self,
        user: &NewUser,
        currency: &str,
    ) -> Result<(User, Wallet), AppError> {
        let now = Utc::now();
        let mut tx = begin_transaction(&self.pool).await?;

        let insert_user = format!(
            "INSERT INTO users (id, email, phone, password_hash, role, first_name, last_name, \
             is_blocked, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $8) RETURNING {USER_COLUMNS}"
        );
        let created = sqlx::query_as::<_, User>(&insert_user)
            .bind(UserId::new())
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.password_hash)
            .bind(user.role)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| conflict_on_unique(e, "User with this email or phone already exists"))?;

        let insert_wallet = format!(
            "INSERT INTO wallets (id, user_id, balance, currency, created_at) \
             VALUES ($1, $2, 0, $3, $4) RETURNING {WALLET_COLUMNS}"
        );
        let wallet = sqlx::query_as::<_, Wallet>(&insert_wallet)
            .bind(WalletId::new())
            .bind(created.id)
            .bind(currency)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        commit_transaction(tx).await?;
        Ok((created, wallet))
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>, AppError> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = $1");
        let wallet = sqlx::query_as::<_, Wallet>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(wallet)
    }

    async fn set_blocked(&self, id: UserId, blocked: bool) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE users SET is_blocked = $1, updated_at = NOW() WHERE id = $2")
                .bind(blocked)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
