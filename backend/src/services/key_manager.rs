//! Rotating set of HMAC signing keys addressed by `kid`.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};

use crate::config::Config;
use crate::error::AppError;
use crate::models::signing_key::{KeyPurpose, SigningKey};
use crate::utils::jwt::{decode_token, encode_token, token_kid, AccessClaims, RefreshClaims};
use crate::utils::security::{random_alphanumeric, random_secret};

const MIN_SECRET_LENGTH: usize = 32;
const SHORT_ALPHANUMERIC_LENGTH: usize = 48;
const WEAK_SUBSTRINGS: [&str; 3] = ["secret", "default", "password"];
const GENERATED_SECRET_BYTES: usize = 48;

#[derive(Debug, Clone, Default)]
struct KeySet {
    keys: Vec<SigningKey>,
    legacy_access: Option<String>,
    legacy_refresh: Option<String>,
}

impl KeySet {
    fn active(&self) -> Option<&SigningKey> {
        self.keys
            .iter()
            .filter(|k| k.is_active)
            .max_by_key(|k| k.created_at)
    }

    fn legacy(&self, purpose: KeyPurpose) -> Option<&str> {
        match purpose {
            KeyPurpose::Access => self.legacy_access.as_deref(),
            KeyPurpose::Refresh => self
                .legacy_refresh
                .as_deref()
                .or(self.legacy_access.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Holds the key set behind an `Arc` that is swapped wholesale on rotation, so
/// lookups never observe a half-applied change.
pub struct KeyManager {
    keys: RwLock<Arc<KeySet>>,
}

impl KeyManager {
    pub fn new(
        keys: Vec<SigningKey>,
        legacy_access: Option<String>,
        legacy_refresh: Option<String>,
    ) -> Self {
        Self {
            keys: RwLock::new(Arc::new(KeySet {
                keys,
                legacy_access,
                legacy_refresh,
            })),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.signing_keys.clone(),
            config.legacy_access_secret.clone(),
            config.legacy_refresh_secret.clone(),
        )
    }

    /// Mints a fresh, inactive key with random secrets.
    pub fn generate() -> SigningKey {
        let now = Utc::now();
        SigningKey {
            kid: format!(
                "k{}-{}",
                now.format("%Y%m%d%H%M%S"),
                random_alphanumeric(6).to_ascii_lowercase()
            ),
            access_secret: random_secret(GENERATED_SECRET_BYTES),
            refresh_secret: random_secret(GENERATED_SECRET_BYTES),
            created_at: now,
            is_active: false,
        }
    }

    fn snapshot(&self) -> Result<Arc<KeySet>, AppError> {
        self.keys
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| AppError::InternalServerError(anyhow::anyhow!("key set lock poisoned")))
    }

    fn replace(&self, next: KeySet) -> Result<(), AppError> {
        let mut guard = self
            .keys
            .write()
            .map_err(|_| AppError::InternalServerError(anyhow::anyhow!("key set lock poisoned")))?;
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn active_key(&self) -> Option<SigningKey> {
        self.snapshot().ok()?.active().cloned()
    }

    pub fn keys(&self) -> Vec<SigningKey> {
        self.snapshot()
            .map(|set| set.keys.clone())
            .unwrap_or_default()
    }

    /// Resolves a secret by `kid`, falling back to the legacy secret when the
    /// token has no `kid` or it is unknown.
    pub fn find_secret(&self, kid: Option<&str>, purpose: KeyPurpose) -> Option<String> {
        let set = self.snapshot().ok()?;
        kid.and_then(|kid| set.keys.iter().find(|k| k.kid == kid))
            .map(|k| k.secret(purpose).to_string())
            .or_else(|| set.legacy(purpose).map(str::to_string))
    }

    pub fn kid_of(token: &str) -> Option<String> {
        token_kid(token)
    }

    pub fn validate(&self) -> KeyValidation {
        let set = match self.snapshot() {
            Ok(set) => set,
            Err(err) => {
                return KeyValidation {
                    valid: false,
                    errors: vec![err.to_string()],
                }
            }
        };

        let mut errors = Vec::new();
        if set.keys.is_empty() && set.legacy_access.is_none() {
            errors.push("no signing keys configured".to_string());
        }
        if set.keys.iter().filter(|k| k.is_active).count() > 1 {
            errors.push("more than one signing key is marked active".to_string());
        }
        if !set.keys.is_empty() && set.active().is_none() && set.legacy_access.is_none() {
            errors.push("no active signing key".to_string());
        }
        for key in &set.keys {
            errors.extend(validate_key(key));
        }
        if let Some(secret) = &set.legacy_access {
            errors.extend(check_secret("legacy access secret", secret));
        }
        if let Some(secret) = &set.legacy_refresh {
            errors.extend(check_secret("legacy refresh secret", secret));
            if set.legacy_access.as_deref() == Some(secret.as_str()) {
                errors.push("legacy access and refresh secrets must differ".to_string());
            }
        }

        KeyValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Installs `key` as the only active key. Previous keys stay available for
    /// verification until retired.
    pub fn rotate(&self, key: SigningKey) -> Result<SigningKey, AppError> {
        let problems = validate_key(&key);
        if !problems.is_empty() {
            return Err(AppError::Validation(problems));
        }

        let current = self.snapshot()?;
        if current.keys.iter().any(|k| k.kid == key.kid) {
            return Err(AppError::Conflict(format!("kid {} already exists", key.kid)));
        }

        let active = SigningKey {
            is_active: true,
            ..key
        };
        let mut next = (*current).clone();
        next.keys = next.keys.iter().map(SigningKey::demoted).collect();
        next.keys.push(active.clone());
        self.replace(next)?;

        tracing::info!(kid = %active.kid, "signing key rotated");
        Ok(active)
    }

    /// Removes a non-active key; tokens signed with it stop verifying.
    pub fn retire(&self, kid: &str) -> Result<bool, AppError> {
        let current = self.snapshot()?;
        let Some(target) = current.keys.iter().find(|k| k.kid == kid) else {
            return Ok(false);
        };
        if target.is_active {
            return Err(AppError::Conflict(
                "the active signing key cannot be retired".to_string(),
            ));
        }

        let mut next = (*current).clone();
        next.keys.retain(|k| k.kid != kid);
        self.replace(next)?;

        tracing::info!(kid, "signing key retired");
        Ok(true)
    }

    fn sign<T: Serialize>(&self, claims: &T, purpose: KeyPurpose) -> Result<String, AppError> {
        let set = self.snapshot()?;
        let token = match set.active() {
            Some(key) => encode_token(claims, Some(&key.kid), key.secret(purpose))?,
            None => {
                let secret = set.legacy(purpose).ok_or_else(|| {
                    AppError::InternalServerError(anyhow::anyhow!("no signing key configured"))
                })?;
                encode_token(claims, None, secret)?
            }
        };
        Ok(token)
    }

    fn verify<T: DeserializeOwned>(&self, token: &str, purpose: KeyPurpose) -> Result<T, AppError> {
        let kid = Self::kid_of(token);
        let secret = self
            .find_secret(kid.as_deref(), purpose)
            .ok_or_else(|| AppError::Unauthorized("Invalid token".into()))?;
        decode_token::<T>(token, &secret).map_err(|err| {
            tracing::debug!(kid = ?kid, error = %err, "token verification failed");
            AppError::Unauthorized("Invalid or expired token".into())
        })
    }

    pub fn sign_access(&self, claims: &AccessClaims) -> Result<String, AppError> {
        self.sign(claims, KeyPurpose::Access)
    }

    pub fn sign_refresh(&self, claims: &RefreshClaims) -> Result<String, AppError> {
        self.sign(claims, KeyPurpose::Refresh)
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AppError> {
        self.verify(token, KeyPurpose::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AppError> {
        self.verify(token, KeyPurpose::Refresh)
    }
}

fn validate_key(key: &SigningKey) -> Vec<String> {
    let mut errors = Vec::new();
    if key.kid.trim().is_empty() {
        errors.push("signing key has an empty kid".to_string());
    }
    errors.extend(check_secret(&format!("{} access secret", key.kid), &key.access_secret));
    errors.extend(check_secret(&format!("{} refresh secret", key.kid), &key.refresh_secret));
    if key.access_secret == key.refresh_secret {
        errors.push(format!("{}: access and refresh secrets must differ", key.kid));
    }
    errors
}

fn check_secret(label: &str, secret: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if secret.len() < MIN_SECRET_LENGTH {
        errors.push(format!("{label} must be at least {MIN_SECRET_LENGTH} characters"));
    }
    let lowered = secret.to_ascii_lowercase();
    if let Some(pattern) = WEAK_SUBSTRINGS.iter().find(|p| lowered.contains(*p)) {
        errors.push(format!("{label} contains the weak pattern \"{pattern}\""));
    }
    if secret.len() < SHORT_ALPHANUMERIC_LENGTH && secret.chars().all(|c| c.is_ascii_alphanumeric())
    {
        errors.push(format!("{label} is a short purely alphanumeric string"));
    }
    errors
}
