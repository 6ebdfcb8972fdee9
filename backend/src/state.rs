use std::sync::Arc;

use crate::config::Config;
use crate::db::connection::{create_pool, run_migrations};
use crate::db::redis::create_redis_pool;
use crate::repositories::Stores;
use crate::services::{
    AuthService, BiometricService, CleanupService, KeyManager, NotificationDispatcher,
    RateLimiter, SessionManager, SmtpDispatcher, TwoFactorService,
};
use crate::utils::encryption::AesGcmCipher;
use crate::utils::matcher::EditDistanceMatcher;
use crate::utils::password::Argon2PasswordHasher;

/// Every service, wired against one set of stores and one key manager.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub stores: Stores,
    pub keys: Arc<KeyManager>,
    pub rate_limiter: RateLimiter,
    pub sessions: SessionManager,
    pub auth: AuthService,
    pub biometrics: BiometricService,
    pub two_factor: TwoFactorService,
    pub cleanup: CleanupService,
}

impl AppState {
    pub fn new(
        config: Config,
        stores: Stores,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> anyhow::Result<Self> {
        let keys = Arc::new(KeyManager::from_config(&config));
        let validation = keys.validate();
        if !validation.valid {
            for error in &validation.errors {
                tracing::warn!(%error, "signing key check failed");
            }
        }

        let cipher = Arc::new(AesGcmCipher::from_config(&config)?);
        let rate_limiter = RateLimiter::new(stores.rate_limits.clone(), config.rate_limits.clone());
        let sessions = SessionManager::new(stores.sessions.clone(), keys.clone(), &config);
        let auth = AuthService::new(
            &stores,
            keys.clone(),
            sessions.clone(),
            rate_limiter.clone(),
            Arc::new(Argon2PasswordHasher),
            dispatcher.clone(),
            &config,
        );
        let biometrics = BiometricService::new(
            stores.biometrics.clone(),
            rate_limiter.clone(),
            cipher.clone(),
            Arc::new(EditDistanceMatcher),
        );
        let two_factor = TwoFactorService::new(
            stores.two_factor.clone(),
            rate_limiter.clone(),
            cipher,
            dispatcher,
            &config,
        );
        let cleanup = CleanupService::new(stores.clone(), config.rate_limit_retention_hours);

        Ok(Self {
            config,
            stores,
            keys,
            rate_limiter,
            sessions,
            auth,
            biometrics,
            two_factor,
            cleanup,
        })
    }

    /// Process-local stores; nothing survives a restart.
    pub fn in_memory(config: Config, dispatcher: Arc<dyn NotificationDispatcher>) -> anyhow::Result<Self> {
        Self::new(config, Stores::in_memory(), dispatcher)
    }

    /// Postgres (migrated on connect), Redis for refresh claims when configured,
    /// SMTP and webhook delivery from the environment.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = create_pool(&config.database_url).await?;
        run_migrations(&pool).await?;
        let redis = create_redis_pool(&config).await?;
        let dispatcher = Arc::new(SmtpDispatcher::from_config(&config)?);
        Self::new(config, Stores::postgres(pool, redis), dispatcher)
    }
}
