//! Keyed-store capabilities, one trait per entity.
//!
//! Postgres implementations back production; [`InMemoryStore`] serves every
//! trait from a single process-local state for tests.

pub mod biometric;
pub mod memory;
pub mod otp;
pub mod rate_limit;
pub mod refresh_ledger;
pub mod session;
pub mod transaction;
pub mod two_factor;
pub mod user;

use std::sync::Arc;

use sqlx::PgPool;

use crate::db::redis::RedisPool;

pub use biometric::{BiometricStore, PgBiometricStore};
pub use memory::InMemoryStore;
pub use otp::{OtpStore, PgOtpStore};
pub use rate_limit::{PgRateLimitStore, RateLimitStore};
pub use refresh_ledger::{PgRefreshLedger, RedisRefreshLedger, RefreshTokenLedger};
pub use session::{PgSessionStore, SessionStore};
pub use two_factor::{PgTwoFactorStore, TwoFactorStore};
pub use user::{PgUserStore, UserStore};

/// The full set of stores the services are wired against.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub otps: Arc<dyn OtpStore>,
    pub biometrics: Arc<dyn BiometricStore>,
    pub two_factor: Arc<dyn TwoFactorStore>,
    pub refresh_ledger: Arc<dyn RefreshTokenLedger>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(InMemoryStore::new()))
    }

    pub fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            users: store.clone(),
            sessions: store.clone(),
            rate_limits: store.clone(),
            otps: store.clone(),
            biometrics: store.clone(),
            two_factor: store.clone(),
            refresh_ledger: store,
        }
    }

    /// Postgres for every entity; the refresh ledger moves to Redis when a pool is given.
    pub fn postgres(pool: PgPool, redis: Option<RedisPool>) -> Self {
        let refresh_ledger: Arc<dyn RefreshTokenLedger> = match redis {
            Some(redis) => Arc::new(RedisRefreshLedger::new(redis)),
            None => Arc::new(PgRefreshLedger::new(pool.clone())),
        };
        Self {
            users: Arc::new(PgUserStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            rate_limits: Arc::new(PgRateLimitStore::new(pool.clone())),
            otps: Arc::new(PgOtpStore::new(pool.clone())),
            biometrics: Arc::new(PgBiometricStore::new(pool.clone())),
            two_factor: Arc::new(PgTwoFactorStore::new(pool)),
            refresh_ledger,
        }
    }
}
