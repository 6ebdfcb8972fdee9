use anyhow::{anyhow, Context};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use crate::models::rate_limit::{RateLimitAction, RateLimitPolicy};
use crate::models::signing_key::SigningKey;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/gatekeeper";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub redis_pool_size: u32,
    pub redis_connect_timeout: u64,
    pub signing_keys: Vec<SigningKey>,
    pub legacy_access_secret: Option<String>,
    pub legacy_refresh_secret: Option<String>,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    pub max_active_sessions: usize,
    pub session_ttl_days: i64,
    pub time_zone: Tz,
    pub suspicious_countries: Vec<String>,
    pub mfa_issuer: String,
    pub template_encryption_key: Option<String>,
    pub otp_ttl_minutes: i64,
    pub otp_max_attempts: i32,
    pub rate_limits: RateLimitConfig,
    pub rate_limit_retention_hours: i64,
    pub smtp: SmtpConfig,
    pub notify_webhook_url: Option<String>,
    /// ISO 4217 code for wallets opened at registration.
    pub wallet_currency: String,
}

#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

/// Per-action overrides on top of the built-in policy table.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    overrides: BTreeMap<RateLimitAction, RateLimitPolicy>,
}

impl RateLimitConfig {
    pub fn policy_for(&self, action: RateLimitAction) -> RateLimitPolicy {
        self.overrides
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_policy())
    }

    pub fn set(&mut self, action: RateLimitAction, policy: RateLimitPolicy) {
        self.overrides.insert(action, policy);
    }

    fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        for action in RateLimitAction::ALL {
            let defaults = action.default_policy();
            let prefix = format!("RATE_LIMIT_{}", action.env_key());
            let window = env_parse(&format!("{prefix}_WINDOW_SECONDS"), defaults.window_seconds)?;
            let max = env_parse(&format!("{prefix}_MAX_ATTEMPTS"), defaults.max_attempts)?;
            let block = env_parse(&format!("{prefix}_BLOCK_SECONDS"), defaults.block_seconds)?;
            let policy = RateLimitPolicy::new(window, max, block);
            if policy != defaults {
                config.set(action, policy);
            }
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            redis_url: None,
            redis_pool_size: 10,
            redis_connect_timeout: 5,
            signing_keys: Vec::new(),
            legacy_access_secret: None,
            legacy_refresh_secret: None,
            access_token_ttl_minutes: 15,
            refresh_token_ttl_days: 7,
            max_active_sessions: 5,
            session_ttl_days: 7,
            time_zone: chrono_tz::UTC,
            suspicious_countries: Vec::new(),
            mfa_issuer: "Gatekeeper".to_string(),
            template_encryption_key: None,
            otp_ttl_minutes: 15,
            otp_max_attempts: 3,
            rate_limits: RateLimitConfig::default(),
            rate_limit_retention_hours: 24 * 8,
            smtp: SmtpConfig {
                port: 587,
                from_address: "noreply@gatekeeper.local".to_string(),
                ..SmtpConfig::default()
            },
            notify_webhook_url: None,
            wallet_currency: "NGN".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let redis_url = env_optional("REDIS_URL");

        let signing_keys = match env_optional("JWT_SIGNING_KEYS") {
            Some(raw) => serde_json::from_str::<Vec<SigningKey>>(&raw)
                .context("JWT_SIGNING_KEYS must be a JSON array of signing keys")?,
            None => Vec::new(),
        };
        let legacy_access_secret = env_optional("JWT_SECRET");
        let legacy_refresh_secret = env_optional("JWT_REFRESH_SECRET");
        if signing_keys.is_empty() && legacy_access_secret.is_none() {
            return Err(anyhow!(
                "Either JWT_SIGNING_KEYS or JWT_SECRET must be configured"
            ));
        }

        let time_zone_name = env::var("APP_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());
        let time_zone: Tz = time_zone_name
            .parse()
            .map_err(|_| anyhow!("Invalid APP_TIMEZONE value: {}", time_zone_name))?;

        let suspicious_countries = env_optional("SUSPICIOUS_COUNTRIES")
            .map(|raw| {
                raw.split(',')
                    .map(|c| c.trim().to_ascii_uppercase())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let template_encryption_key = env_optional("TEMPLATE_ENCRYPTION_KEY");
        if let Some(key) = &template_encryption_key {
            if key.len() != 64 || hex::decode(key).is_err() {
                return Err(anyhow!(
                    "TEMPLATE_ENCRYPTION_KEY must be 64 hexadecimal characters"
                ));
            }
        }

        let smtp = SmtpConfig {
            host: env_optional("SMTP_HOST"),
            port: env_parse("SMTP_PORT", defaults.smtp.port)?,
            username: env_optional("SMTP_USERNAME"),
            password: env_optional("SMTP_PASSWORD"),
            from_address: env::var("SMTP_FROM_ADDRESS")
                .unwrap_or_else(|_| defaults.smtp.from_address.clone()),
        };

        Ok(Config {
            database_url,
            redis_url,
            redis_pool_size: env_parse("REDIS_POOL_SIZE", defaults.redis_pool_size)?,
            redis_connect_timeout: env_parse(
                "REDIS_CONNECT_TIMEOUT",
                defaults.redis_connect_timeout,
            )?,
            signing_keys,
            legacy_access_secret,
            legacy_refresh_secret,
            access_token_ttl_minutes: env_parse(
                "ACCESS_TOKEN_TTL_MINUTES",
                defaults.access_token_ttl_minutes,
            )?,
            refresh_token_ttl_days: env_parse(
                "REFRESH_TOKEN_TTL_DAYS",
                defaults.refresh_token_ttl_days,
            )?,
            max_active_sessions: env_parse("MAX_ACTIVE_SESSIONS", defaults.max_active_sessions)?
                .max(1),
            session_ttl_days: env_parse("SESSION_TTL_DAYS", defaults.session_ttl_days)?,
            time_zone,
            suspicious_countries,
            mfa_issuer: env::var("MFA_ISSUER").unwrap_or(defaults.mfa_issuer),
            template_encryption_key,
            otp_ttl_minutes: env_parse("OTP_TTL_MINUTES", defaults.otp_ttl_minutes)?,
            otp_max_attempts: env_parse("OTP_MAX_ATTEMPTS", defaults.otp_max_attempts)?,
            rate_limits: RateLimitConfig::from_env()?,
            rate_limit_retention_hours: env_parse(
                "RATE_LIMIT_RETENTION_HOURS",
                defaults.rate_limit_retention_hours,
            )?,
            smtp,
            notify_webhook_url: env_optional("NOTIFY_WEBHOOK_URL"),
            wallet_currency: env::var("WALLET_CURRENCY").unwrap_or(defaults.wallet_currency),
        })
    }
}

/// Masks a secret for log output, keeping a short prefix and the length.
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "<empty>".into();
    }
    let prefix = s.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, s.len())
}

fn env_optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match env_optional(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        None => Ok(default),
    }
}
