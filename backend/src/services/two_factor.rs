//! Second-factor credentials: TOTP, SMS/e-mail codes and backup codes.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::Config;
use crate::error::AppError;
use crate::models::rate_limit::RateLimitAction;
use crate::models::two_factor::{
    BackupCodeVerification, SetupTwoFactorRequest, TwoFactorAttempt, TwoFactorCredential,
    TwoFactorMethod, TwoFactorSetup,
};
use crate::repositories::TwoFactorStore;
use crate::services::notification::NotificationDispatcher;
use crate::services::rate_limiter::RateLimiter;
use crate::types::{CredentialId, UserId};
use crate::utils::encryption::SecretCipher;
use crate::utils::mfa::{generate_otpauth_uri, generate_totp_secret, verify_totp_code};
use crate::utils::security::{
    constant_time_eq, normalize_backup_code, random_backup_code, random_numeric_code, sha256_hex,
};
use crate::validation::rules::{
    is_six_digit_code, looks_like_email, normalize_contact, validate_phone, CODE_DIGITS,
};

pub const BACKUP_CODE_COUNT: usize = 10;

/// Code awaiting confirmation, stored encrypted as `code|expires_unix`.
struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

impl PendingCode {
    fn encode(&self) -> String {
        format!("{}|{}", self.code, self.expires_at.timestamp())
    }

    fn decode(raw: &str) -> Option<Self> {
        let (code, expires) = raw.split_once('|')?;
        if code.is_empty() {
            return None;
        }
        let expires_at = Utc.timestamp_opt(expires.parse().ok()?, 0).single()?;
        Some(Self {
            code: code.to_string(),
            expires_at,
        })
    }
}

#[derive(Clone)]
pub struct TwoFactorService {
    store: Arc<dyn TwoFactorStore>,
    rate_limiter: RateLimiter,
    cipher: Arc<dyn SecretCipher>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    issuer: String,
    code_ttl: Duration,
}

impl TwoFactorService {
    pub fn new(
        store: Arc<dyn TwoFactorStore>,
        rate_limiter: RateLimiter,
        cipher: Arc<dyn SecretCipher>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            cipher,
            dispatcher,
            issuer: config.mfa_issuer.clone(),
            code_ttl: Duration::minutes(config.otp_ttl_minutes),
        }
    }

    pub async fn setup_two_factor(
        &self,
        request: SetupTwoFactorRequest,
    ) -> Result<TwoFactorSetup, AppError> {
        if self.store.find_active(request.user_id).await?.is_some() {
            return Err(AppError::Conflict(
                "Two-factor authentication is already enabled".into(),
            ));
        }
        let now = Utc::now();

        if request.method == TwoFactorMethod::Totp {
            let secret = generate_totp_secret();
            let account = request
                .account_name
                .clone()
                .unwrap_or_else(|| request.user_id.to_string());
            let qr_payload = generate_otpauth_uri(&self.issuer, &account, &secret)?;

            self.store
                .insert_active(&TwoFactorCredential {
                    id: CredentialId::new(),
                    user_id: request.user_id,
                    method: TwoFactorMethod::Totp,
                    secret: self.cipher.encrypt(&secret)?,
                    destination: None,
                    last_used_at: None,
                    created_at: now,
                    is_active: true,
                })
                .await?;
            let backup_codes = match self.store_backup_codes(request.user_id, now).await {
                Ok(codes) => codes,
                Err(err) => {
                    self.abandon_setup(request.user_id).await;
                    return Err(err);
                }
            };

            tracing::info!(user_id = %request.user_id, "totp two-factor enabled");
            return Ok(TwoFactorSetup {
                method: TwoFactorMethod::Totp,
                secret: Some(secret),
                qr_payload: Some(qr_payload),
                backup_codes,
            });
        }

        let destination = self.destination_for(request.method, request.destination.as_deref())?;
        let pending = self.new_pending_code(now);
        let credential = TwoFactorCredential {
            id: CredentialId::new(),
            user_id: request.user_id,
            method: request.method,
            secret: self.cipher.encrypt(&pending.encode())?,
            destination: Some(destination),
            last_used_at: None,
            created_at: now,
            is_active: true,
        };
        self.store.insert_active(&credential).await?;
        if let Err(err) = self.deliver(&credential, &pending.code).await {
            self.abandon_setup(request.user_id).await;
            return Err(err);
        }

        tracing::info!(user_id = %request.user_id, method = request.method.as_str(), "code-based two-factor enabled");
        Ok(TwoFactorSetup {
            method: request.method,
            secret: None,
            qr_payload: None,
            backup_codes: Vec::new(),
        })
    }

    /// Sends a fresh code for SMS/e-mail credentials; replaces any pending one.
    pub async fn issue_two_factor_code(&self, user_id: UserId) -> Result<DateTime<Utc>, AppError> {
        let credential = self.active_credential(user_id).await?;
        if !credential.method.is_code_based() {
            return Err(AppError::validation(
                "Authenticator apps generate their own codes",
            ));
        }
        let pending = self.new_pending_code(Utc::now());
        self.store
            .update_secret(credential.id, &self.cipher.encrypt(&pending.encode())?)
            .await?;
        self.deliver(&credential, &pending.code).await?;
        Ok(pending.expires_at)
    }

    /// Verifies a TOTP or delivered code. Code-based codes are single-use.
    pub async fn verify_two_factor(
        &self,
        user_id: UserId,
        code: &str,
        device_fingerprint: Option<String>,
    ) -> Result<bool, AppError> {
        if !is_six_digit_code(code) {
            return Err(AppError::validation("Verification code must be 6 digits"));
        }
        let identifier = user_id.to_string();
        self.rate_limiter
            .enforce(&identifier, RateLimitAction::TwoFactorVerification)
            .await?;

        let credential = self.active_credential(user_id).await?;
        let now = Utc::now();
        let mut success = match credential.method {
            TwoFactorMethod::Totp => {
                let secret = self.cipher.decrypt(&credential.secret)?;
                verify_totp_code(&secret, code)?
            }
            TwoFactorMethod::Sms | TwoFactorMethod::Email => {
                let pending = PendingCode::decode(&self.cipher.decrypt(&credential.secret)?);
                match pending {
                    Some(pending) if pending.expires_at > now => {
                        constant_time_eq(&pending.code, code)
                    }
                    _ => false,
                }
            }
        };

        // Only the caller that clears the pending code may count it as used.
        if success && credential.method.is_code_based() {
            success = self
                .store
                .consume_secret(credential.id, &credential.secret, &self.cipher.encrypt("")?)
                .await?;
        }
        if success {
            self.store.touch(credential.id, now).await?;
        }
        self.store
            .log_attempt(&TwoFactorAttempt {
                user_id,
                method: credential.method,
                success,
                device_fingerprint,
                created_at: now,
            })
            .await?;
        if success {
            self.rate_limiter
                .record(&identifier, RateLimitAction::TwoFactorVerification, true)
                .await?;
        }

        tracing::info!(%user_id, method = credential.method.as_str(), success, "two-factor verification");
        Ok(success)
    }

    pub async fn verify_backup_code(
        &self,
        user_id: UserId,
        code: &str,
    ) -> Result<BackupCodeVerification, AppError> {
        let identifier = user_id.to_string();
        self.rate_limiter
            .enforce(&identifier, RateLimitAction::TwoFactorVerification)
            .await?;
        let credential = self.active_credential(user_id).await?;

        let now = Utc::now();
        let hash = sha256_hex(&normalize_backup_code(code));
        let success = self.store.consume_backup_code(user_id, &hash, now).await?;
        let remaining_codes = self.store.count_unused_backup_codes(user_id).await?;

        self.store
            .log_attempt(&TwoFactorAttempt {
                user_id,
                method: credential.method,
                success,
                device_fingerprint: None,
                created_at: now,
            })
            .await?;
        if success {
            self.rate_limiter
                .record(&identifier, RateLimitAction::TwoFactorVerification, true)
                .await?;
        }

        if success && remaining_codes <= 2 {
            tracing::warn!(%user_id, remaining_codes, "backup codes running low");
        }
        Ok(BackupCodeVerification {
            success,
            remaining_codes,
        })
    }

    /// Issues a new batch of backup codes; unused old codes stop working.
    pub async fn regenerate_backup_codes(&self, user_id: UserId) -> Result<Vec<String>, AppError> {
        self.active_credential(user_id).await?;
        let codes = self.store_backup_codes(user_id, Utc::now()).await?;
        tracing::info!(%user_id, "backup codes regenerated");
        Ok(codes)
    }

    /// Requires a valid current code before turning 2FA off.
    pub async fn disable_two_factor(&self, user_id: UserId, code: &str) -> Result<(), AppError> {
        if !self.verify_two_factor(user_id, code, None).await? {
            return Err(AppError::Unauthorized("Invalid verification code".into()));
        }
        self.store.deactivate(user_id).await?;
        let revoked = self.store.revoke_unused_backup_codes(user_id).await?;
        tracing::info!(%user_id, revoked, "two-factor disabled");

        if let Err(err) = self
            .dispatcher
            .send_notification(
                user_id,
                "security",
                "Two-factor authentication disabled",
                "Two-factor authentication was turned off for your account.",
            )
            .await
        {
            tracing::warn!(%user_id, error = %err, "failed to send security notice");
        }
        Ok(())
    }

    /// Rolls back a half-finished setup so the user can try again.
    async fn abandon_setup(&self, user_id: UserId) {
        match self.store.deactivate(user_id).await {
            Ok(_) => tracing::warn!(%user_id, "two-factor setup abandoned"),
            Err(err) => {
                tracing::error!(%user_id, error = %err, "failed to roll back two-factor setup")
            }
        }
    }

    async fn active_credential(&self, user_id: UserId) -> Result<TwoFactorCredential, AppError> {
        self.store
            .find_active(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Two-factor authentication is not enabled".into()))
    }

    async fn store_backup_codes(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError> {
        let codes: Vec<String> = (0..BACKUP_CODE_COUNT).map(|_| random_backup_code()).collect();
        let hashes: Vec<String> = codes
            .iter()
            .map(|code| sha256_hex(&normalize_backup_code(code)))
            .collect();
        self.store.replace_backup_codes(user_id, &hashes, now).await?;
        Ok(codes)
    }

    fn new_pending_code(&self, now: DateTime<Utc>) -> PendingCode {
        PendingCode {
            code: random_numeric_code(CODE_DIGITS),
            expires_at: now + self.code_ttl,
        }
    }

    fn destination_for(
        &self,
        method: TwoFactorMethod,
        destination: Option<&str>,
    ) -> Result<String, AppError> {
        let destination = destination
            .map(normalize_contact)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| AppError::validation("A destination is required for this method"))?;
        match method {
            TwoFactorMethod::Sms => {
                validate_phone(&destination)
                    .map_err(|_| AppError::validation("Invalid phone number"))?;
            }
            TwoFactorMethod::Email if !looks_like_email(&destination) => {
                return Err(AppError::validation("Invalid e-mail address"));
            }
            _ => {}
        }
        Ok(destination)
    }

    async fn deliver(&self, credential: &TwoFactorCredential, code: &str) -> Result<(), AppError> {
        let Some(destination) = credential.destination.as_deref() else {
            return Err(AppError::validation("Credential has no destination"));
        };
        let minutes = self.code_ttl.num_minutes();
        match credential.method {
            TwoFactorMethod::Sms => {
                self.dispatcher
                    .send_sms(
                        destination,
                        &format!("Your verification code is {code}. It expires in {minutes} minutes."),
                    )
                    .await?
            }
            TwoFactorMethod::Email => {
                self.dispatcher
                    .send_email(
                        destination,
                        "Your verification code",
                        &format!(
                            "<p>Your verification code is <strong>{code}</strong>.</p><p>It expires in {minutes} minutes.</p>"
                        ),
                    )
                    .await?
            }
            TwoFactorMethod::Totp => {}
        }
        Ok(())
    }
}
