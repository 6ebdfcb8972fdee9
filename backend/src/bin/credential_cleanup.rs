use gatekeeper_backend::{
    config::{mask_secret, Config},
    db::{connection::create_pool, connection::run_migrations, redis::create_redis_pool},
    repositories::Stores,
    services::CleanupService,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatekeeper_backend=info,credential_cleanup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(
        database_url = %mask_secret(&config.database_url),
        retention_hours = config.rate_limit_retention_hours,
        "starting credential cleanup"
    );

    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    let redis = create_redis_pool(&config).await?;

    let stores = Stores::postgres(pool.clone(), redis);
    let report = CleanupService::new(stores, config.rate_limit_retention_hours)
        .sweep()
        .await?;

    for table in ["sessions", "otp_codes", "rate_limits", "refresh_token_claims"] {
        sqlx::query(&format!("VACUUM (ANALYZE) {table}"))
            .execute(&pool)
            .await?;
    }

    tracing::info!(?report, "credential cleanup complete");
    Ok(())
}
