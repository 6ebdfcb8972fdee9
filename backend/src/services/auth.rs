//! Registration, password and OTP login, and refresh-token exchange.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use validator::Validate;

use crate::config::Config;
use crate::error::AppError;
use crate::models::otp::{OtpChannel, OtpDispatch, OtpRecord, SendOtpRequest, VerifyOtpRequest};
use crate::models::rate_limit::RateLimitAction;
use crate::models::session::DeviceInfo;
use crate::models::user::{
    AuthResponse, AuthUser, LoginRequest, NewUser, RegisterRequest, RegisterResponse, User,
    UserRole, Wallet,
};
use crate::repositories::{OtpStore, RefreshTokenLedger, Stores, UserStore};
use crate::services::key_manager::KeyManager;
use crate::services::notification::NotificationDispatcher;
use crate::services::rate_limiter::{ensure_allowed, RateLimiter};
use crate::services::session::SessionManager;
use crate::types::UserId;
use crate::utils::jwt::{AccessClaims, RefreshClaims};
use crate::utils::password::PasswordHasher;
use crate::utils::security::{constant_time_eq, random_alphanumeric, random_numeric_code, sha256_hex};
use crate::validation::rules::{
    is_six_digit_code, looks_like_email, normalize_contact, validate_phone, CODE_DIGITS,
};

const INVALID_CREDENTIALS: &str = "Invalid email or password";
const GENERATED_PASSWORD_LENGTH: usize = 16;

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    otps: Arc<dyn OtpStore>,
    refresh_ledger: Arc<dyn RefreshTokenLedger>,
    keys: Arc<KeyManager>,
    sessions: SessionManager,
    rate_limiter: RateLimiter,
    hasher: Arc<dyn PasswordHasher>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    otp_ttl: Duration,
    otp_max_attempts: i32,
    wallet_currency: String,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: &Stores,
        keys: Arc<KeyManager>,
        sessions: SessionManager,
        rate_limiter: RateLimiter,
        hasher: Arc<dyn PasswordHasher>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        config: &Config,
    ) -> Self {
        Self {
            users: stores.users.clone(),
            otps: stores.otps.clone(),
            refresh_ledger: stores.refresh_ledger.clone(),
            keys,
            sessions,
            rate_limiter,
            hasher,
            dispatcher,
            access_ttl: Duration::minutes(config.access_token_ttl_minutes),
            refresh_ttl: Duration::days(config.refresh_token_ttl_days),
            otp_ttl: Duration::minutes(config.otp_ttl_minutes),
            otp_max_attempts: config.otp_max_attempts,
            wallet_currency: config.wallet_currency.clone(),
        }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, AppError> {
        request.validate()?;
        let email = normalize_contact(&request.email);
        let phone = normalize_contact(&request.phone);
        let ip = client_ip(request.device.as_ref());

        let decision = self
            .rate_limiter
            .check_registration_rate_limit(&email, &phone, ip)
            .await?;
        ensure_allowed(&decision)?;

        let (user, wallet) = match self.create_registered_user(&request, &email, &phone).await {
            Ok(created) => created,
            Err(err) => {
                self.release_registration(&email, &phone).await;
                return Err(err);
            }
        };

        tracing::info!(user_id = %user.id, wallet_id = %wallet.id, "user registered");
        let auth = self.issue_tokens(&user, request.device.as_ref()).await?;
        Ok(RegisterResponse { auth, wallet })
    }

    /// Unknown e-mail and wrong password produce the same error.
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse, AppError> {
        request.validate()?;
        let email = normalize_contact(&request.email);
        let ip = client_ip(request.device.as_ref());

        let decision = self.rate_limiter.check_login_rate_limit(&email, ip).await?;
        ensure_allowed(&decision)?;

        let user = match self.users.find_by_email(&email).await? {
            Some(user) if self.hasher.verify(&request.password, &user.password_hash)? => user,
            _ => {
                tracing::info!("login rejected: invalid credentials");
                return Err(AppError::Unauthorized(INVALID_CREDENTIALS.into()));
            }
        };
        if user.is_blocked {
            tracing::warn!(user_id = %user.id, "login rejected: account blocked");
            return Err(AppError::Unauthorized("Account is blocked".into()));
        }

        self.reset_login_counters(&email, ip).await?;
        tracing::info!(user_id = %user.id, "user logged in");
        self.issue_tokens(&user, request.device.as_ref()).await
    }

    pub async fn send_otp(&self, request: SendOtpRequest) -> Result<OtpDispatch, AppError> {
        let contact = normalize_contact(&request.contact);
        match request.channel {
            OtpChannel::Sms => {
                validate_phone(&contact).map_err(|_| AppError::validation("Invalid phone number"))?
            }
            OtpChannel::Email if !looks_like_email(&contact) => {
                return Err(AppError::validation("Invalid e-mail address"));
            }
            OtpChannel::Email => {}
        }

        let decision = self.rate_limiter.check_otp_rate_limit(&contact).await?;
        ensure_allowed(&decision)?;

        let now = Utc::now();
        let code = random_numeric_code(CODE_DIGITS);
        let record = OtpRecord {
            contact: contact.clone(),
            code_hash: sha256_hex(&code),
            expires_at: now + self.otp_ttl,
            attempts: 0,
            created_at: now,
        };
        self.otps.upsert(&record).await?;

        let minutes = self.otp_ttl.num_minutes();
        let delivery = match request.channel {
            OtpChannel::Sms => {
                self.dispatcher
                    .send_sms(
                        &contact,
                        &format!("Your login code is {code}. It expires in {minutes} minutes."),
                    )
                    .await
            }
            OtpChannel::Email => {
                self.dispatcher
                    .send_email(
                        &contact,
                        "Your login code",
                        &format!(
                            "<p>Your login code is <strong>{code}</strong>.</p><p>It expires in {minutes} minutes.</p>"
                        ),
                    )
                    .await
            }
        };
        if let Err(err) = delivery {
            self.otps.delete(&contact).await?;
            tracing::error!(error = %err, "otp delivery failed");
            return Err(AppError::InternalServerError(err));
        }

        tracing::info!(channel = ?request.channel, "otp sent");
        Ok(OtpDispatch {
            contact,
            channel: request.channel,
            expires_at: record.expires_at,
        })
    }

    /// Redeems a login code, creating the account on first use. The code is
    /// taken exactly as sent; surrounding whitespace makes it malformed.
    pub async fn verify_otp(&self, request: VerifyOtpRequest) -> Result<AuthResponse, AppError> {
        if !is_six_digit_code(&request.code) {
            return Err(AppError::validation("Code must be 6 digits"));
        }
        let contact = normalize_contact(&request.contact);

        let record = self
            .otps
            .find(&contact)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired code".into()))?;
        let now = Utc::now();
        if record.is_expired_at(now) {
            self.otps.delete(&contact).await?;
            return Err(AppError::Expired("Code has expired".into()));
        }
        if record.attempts >= self.otp_max_attempts {
            self.otps.delete(&contact).await?;
            return Err(AppError::Unauthorized(
                "Too many incorrect attempts. Request a new code.".into(),
            ));
        }

        let presented = sha256_hex(&request.code);
        if !constant_time_eq(&presented, &record.code_hash) {
            let attempts = self
                .otps
                .increment_attempts(&contact, self.otp_max_attempts)
                .await?;
            tracing::info!(attempts = ?attempts, "otp mismatch");
            return Err(AppError::Unauthorized("Invalid code".into()));
        }

        // A blocked account must not burn the code.
        let existing = self.find_by_contact(&contact).await?;
        if existing.as_ref().is_some_and(|user| user.is_blocked) {
            tracing::warn!("otp login rejected: account blocked");
            return Err(AppError::Unauthorized("Account is blocked".into()));
        }
        if !self
            .otps
            .consume(&contact, &presented, self.otp_max_attempts, now)
            .await?
        {
            return Err(AppError::Unauthorized("Invalid or expired code".into()));
        }

        let user = match existing {
            Some(user) => user,
            None => self.create_for_contact(&contact).await?,
        };
        tracing::info!(user_id = %user.id, "otp login");
        self.issue_tokens(&user, request.device.as_ref()).await
    }

    /// Exchanges a refresh token for a new pair. Each refresh token works once.
    pub async fn refresh(&self, token: &str) -> Result<AuthResponse, AppError> {
        let claims = self.keys.verify_refresh(token)?;
        let user_id = claims
            .user_id()
            .map_err(|_| AppError::Unauthorized("Invalid refresh token".into()))?;
        let session_id = claims
            .session_id()
            .map_err(|_| AppError::Unauthorized("Invalid refresh token".into()))?;

        if session_id.is_some() {
            let (user, issued) =
                tokio::try_join!(self.load_active_user(user_id), self.sessions.rotate(&claims))?;
            return Ok(AuthResponse {
                access_token: self.sign_access(&user)?,
                refresh_token: issued.refresh_token,
                user: AuthUser::from(&user),
            });
        }

        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".into()))?;
        if !self.refresh_ledger.claim(&claims.jti, expires_at).await? {
            tracing::warn!(%user_id, "refresh token reuse detected");
            return Err(AppError::Unauthorized(
                "Refresh token has already been used".into(),
            ));
        }
        let user = self.load_active_user(user_id).await?;
        self.issue_tokens(&user, None).await
    }

    /// Signs an access token and a refresh token. With device metadata the
    /// refresh token is bound to a new session; otherwise it is standalone.
    pub async fn issue_tokens(
        &self,
        user: &User,
        device: Option<&DeviceInfo>,
    ) -> Result<AuthResponse, AppError> {
        let access_token = self.sign_access(user)?;
        let refresh_token = match device {
            Some(device) => {
                self.sessions
                    .create_session(user.id, device, None)
                    .await?
                    .refresh_token
            }
            None => {
                let claims = RefreshClaims::new(user.id, None, self.refresh_ttl);
                self.keys.sign_refresh(&claims)?
            }
        };
        Ok(AuthResponse {
            access_token,
            refresh_token,
            user: AuthUser::from(user),
        })
    }

    fn sign_access(&self, user: &User) -> Result<String, AppError> {
        let claims = AccessClaims::new(
            user.id,
            user.email.clone(),
            user.role.as_str(),
            self.access_ttl,
        );
        self.keys.sign_access(&claims)
    }

    async fn load_active_user(&self, user_id: UserId) -> Result<User, AppError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".into()))?;
        if user.is_blocked {
            return Err(AppError::Unauthorized("Account is blocked".into()));
        }
        Ok(user)
    }

    async fn create_registered_user(
        &self,
        request: &RegisterRequest,
        email: &str,
        phone: &str,
    ) -> Result<(User, Wallet), AppError> {
        if self.users.exists_by_email_or_phone(email, phone).await? {
            return Err(AppError::Conflict(
                "User with this email or phone already exists".into(),
            ));
        }
        let password_hash = self.hasher.hash(&request.password)?;
        self.users
            .create_with_wallet(
                &NewUser {
                    email: Some(email.to_string()),
                    phone: Some(phone.to_string()),
                    password_hash,
                    role: UserRole::User,
                    first_name: request.first_name.clone(),
                    last_name: request.last_name.clone(),
                },
                &self.wallet_currency,
            )
            .await
    }

    /// Gives back the contact slots of a registration that did not complete.
    async fn release_registration(&self, email: &str, phone: &str) {
        for contact in [email, phone] {
            if let Err(err) = self
                .rate_limiter
                .release(contact, RateLimitAction::RegistrationContact)
                .await
            {
                tracing::error!(error = %err, "failed to release registration slot");
            }
        }
    }

    async fn reset_login_counters(&self, email: &str, ip: Option<&str>) -> Result<(), AppError> {
        self.rate_limiter
            .record(email, RateLimitAction::LoginEmail, true)
            .await?;
        if let Some(ip) = ip {
            self.rate_limiter
                .record(ip, RateLimitAction::LoginIp, true)
                .await?;
        }
        Ok(())
    }

    async fn find_by_contact(&self, contact: &str) -> Result<Option<User>, AppError> {
        if looks_like_email(contact) {
            self.users.find_by_email(contact).await
        } else {
            self.users.find_by_phone(contact).await
        }
    }

    async fn create_for_contact(&self, contact: &str) -> Result<User, AppError> {
        let is_email = looks_like_email(contact);
        let password_hash = self
            .hasher
            .hash(&random_alphanumeric(GENERATED_PASSWORD_LENGTH))?;
        let new_user = NewUser {
            email: is_email.then(|| contact.to_string()),
            phone: (!is_email).then(|| contact.to_string()),
            password_hash,
            role: UserRole::User,
            first_name: None,
            last_name: None,
        };
        match self
            .users
            .create_with_wallet(&new_user, &self.wallet_currency)
            .await
        {
            Ok((user, wallet)) => {
                tracing::info!(user_id = %user.id, wallet_id = %wallet.id, "user created from otp login");
                Ok(user)
            }
            // Another login for the same contact created the account first.
            Err(AppError::Conflict(message)) => self
                .find_by_contact(contact)
                .await?
                .ok_or(AppError::Conflict(message)),
            Err(err) => Err(err),
        }
    }
}

fn client_ip(device: Option<&DeviceInfo>) -> Option<&str> {
    device
        .map(|d| d.ip.trim())
        .filter(|ip| !ip.is_empty())
}
