//! Process-local store backend for tests and single-instance deployments.
//!
//! Every trait is served from one `Mutex`-guarded state so compound updates
//! (rate-limit transitions, capped session inserts) stay atomic. Limits only
//! hold cluster-wide when all instances share a Postgres/Redis backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::biometric::{
    BiometricAttempt, BiometricTemplate, BiometricType, EnrollmentOutcome,
};
use crate::models::otp::OtpRecord;
use crate::models::rate_limit::{
    apply_step, RateLimitDecision, RateLimitRecord, RateLimitStep, RateLimitSubject,
};
use crate::models::session::Session;
use crate::models::two_factor::{BackupCode, TwoFactorAttempt, TwoFactorCredential};
use crate::models::user::{NewUser, User, Wallet};
use crate::repositories::{
    BiometricStore, OtpStore, RateLimitStore, RefreshTokenLedger, SessionStore, TwoFactorStore,
    UserStore,
};
use crate::types::{CredentialId, SessionId, TemplateId, UserId, WalletId};

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    wallets: HashMap<UserId, Wallet>,
    sessions: HashMap<SessionId, Session>,
    rate_limits: HashMap<String, RateLimitRecord>,
    otps: HashMap<String, OtpRecord>,
    templates: HashMap<TemplateId, BiometricTemplate>,
    biometric_attempts: Vec<BiometricAttempt>,
    credentials: HashMap<CredentialId, TwoFactorCredential>,
    backup_codes: Vec<BackupCode>,
    two_factor_attempts: Vec<TwoFactorAttempt>,
    refresh_claims: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalServerError(anyhow::anyhow!("store lock poisoned")))
    }
}

#[async_trait]
impl UserStore for InMemoryStore {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, AppError> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let state = self.lock()?;
        Ok(state
            .users
            .values()
            .find(|u| u.email.as_deref() == Some(email))
            .cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>, AppError> {
        let state = self.lock()?;
        Ok(state
            .users
            .values()
            .find(|u| u.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn exists_by_email_or_phone(&self, email: &str, phone: &str) -> Result<bool, AppError> {
        let state = self.lock()?;
        Ok(state.users.values().any(|u| {
            u.email.as_deref() == Some(email) || u.phone.as_deref() == Some(phone)
        }))
    }

    async fn create_with_wallet(
        &self,
        user: &NewUser,
        currency: &str,
    ) -> Result<(User, Wallet), AppError> {
        let mut state = self.lock()?;
        let taken = state.users.values().any(|u| {
            (user.email.is_some() && u.email == user.email)
                || (user.phone.is_some() && u.phone == user.phone)
        });
        if taken {
            return Err(AppError::Conflict(
                "User with this email or phone already exists".into(),
            ));
        }

        let now = Utc::now();
        let created = User {
            id: UserId::new(),
            email: user.email.clone(),
            phone: user.phone.clone(),
            password_hash: user.password_hash.clone(),
            role: user.role,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            is_blocked: false,
            created_at: now,
            updated_at: now,
        };
        let wallet = Wallet {
            id: WalletId::new(),
            user_id: created.id,
            balance: 0,
            currency: currency.to_string(),
            created_at: now,
        };
        state.users.insert(created.id, created.clone());
        state.wallets.insert(created.id, wallet.clone());
        Ok((created, wallet))
    }

    async fn find_wallet(&self, user_id: UserId) -> Result<Option<Wallet>, AppError> {
        Ok(self.lock()?.wallets.get(&user_id).cloned())
    }

    async fn set_blocked(&self, id: UserId, blocked: bool) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        Ok(match state.users.get_mut(&id) {
            Some(user) => {
                user.is_blocked = blocked;
                user.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn insert_capped(
        &self,
        session: &Session,
        cap: usize,
    ) -> Result<Vec<SessionId>, AppError> {
        let mut state = self.lock()?;
        let mut active: Vec<(DateTime<Utc>, SessionId)> = state
            .sessions
            .values()
            .filter(|s| s.user_id == session.user_id && s.is_usable_at(session.created_at))
            .map(|s| (s.created_at, s.id))
            .collect();
        active.sort();

        let overflow = (active.len() + 1).saturating_sub(cap.max(1));
        let evicted: Vec<SessionId> = active.into_iter().take(overflow).map(|(_, id)| id).collect();
        for id in &evicted {
            if let Some(existing) = state.sessions.get_mut(id) {
                existing.is_active = false;
            }
        }
        state.sessions.insert(session.id, session.clone());
        Ok(evicted)
    }

    async fn find(&self, id: SessionId) -> Result<Option<Session>, AppError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn list_active(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let state = self.lock()?;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_usable_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    async fn rotate_refresh_jti(
        &self,
        id: SessionId,
        expected_jti: &str,
        new_jti: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(&id) {
            Some(session) if session.is_usable_at(now) && session.refresh_jti == expected_jti => {
                session.refresh_jti = new_jti.to_string();
                session.last_active_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, id: SessionId) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        Ok(match state.sessions.get_mut(&id) {
            Some(session) => {
                session.is_active = false;
                true
            }
            None => false,
        })
    }

    async fn revoke_all_except(
        &self,
        user_id: UserId,
        except: SessionId,
    ) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let mut revoked = 0;
        for session in state.sessions.values_mut() {
            if session.user_id == user_id && session.id != except && session.is_active {
                session.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_all(&self, user_id: UserId) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let mut revoked = 0;
        for session in state.sessions.values_mut() {
            if session.user_id == user_id && session.is_active {
                session.is_active = false;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| s.is_active && s.expires_at >= now);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn transition(
        &self,
        subject: &RateLimitSubject,
        step: RateLimitStep,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let mut state = self.lock()?;
        let current = state.rate_limits.get(&subject.key).cloned();
        let transition = apply_step(current, subject, step, now);
        if let Some(record) = transition.record {
            state.rate_limits.insert(record.key.clone(), record);
        }
        Ok(transition.decision)
    }

    async fn find(&self, key: &str) -> Result<Option<RateLimitRecord>, AppError> {
        Ok(self.lock()?.rate_limits.get(key).cloned())
    }

    async fn reset(&self, key: &str) -> Result<bool, AppError> {
        Ok(self.lock()?.rate_limits.remove(key).is_some())
    }

    async fn delete_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let before = state.rate_limits.len();
        state
            .rate_limits
            .retain(|_, r| r.last_attempt_at >= cutoff || r.is_blocked_at(now));
        Ok((before - state.rate_limits.len()) as u64)
    }
}

#[async_trait]
impl OtpStore for InMemoryStore {
    async fn upsert(&self, record: &OtpRecord) -> Result<(), AppError> {
        self.lock()?
            .otps
            .insert(record.contact.clone(), record.clone());
        Ok(())
    }

    async fn find(&self, contact: &str) -> Result<Option<OtpRecord>, AppError> {
        Ok(self.lock()?.otps.get(contact).cloned())
    }

    async fn increment_attempts(
        &self,
        contact: &str,
        max_attempts: i32,
    ) -> Result<Option<i32>, AppError> {
        let mut state = self.lock()?;
        Ok(state
            .otps
            .get_mut(contact)
            .filter(|record| record.attempts < max_attempts)
            .map(|record| {
                record.attempts += 1;
                record.attempts
            }))
    }

    async fn consume(
        &self,
        contact: &str,
        code_hash: &str,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let redeemable = state.otps.get(contact).is_some_and(|record| {
            record.code_hash == code_hash
                && record.attempts < max_attempts
                && !record.is_expired_at(now)
        });
        if redeemable {
            state.otps.remove(contact);
        }
        Ok(redeemable)
    }

    async fn delete(&self, contact: &str) -> Result<bool, AppError> {
        Ok(self.lock()?.otps.remove(contact).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let before = state.otps.len();
        state.otps.retain(|_, record| !record.is_expired_at(now));
        Ok((before - state.otps.len()) as u64)
    }
}

#[async_trait]
impl BiometricStore for InMemoryStore {
    async fn insert_capped(
        &self,
        template: &BiometricTemplate,
        cap: i64,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentOutcome, AppError> {
        let mut state = self.lock()?;
        let usable: Vec<&BiometricTemplate> = state
            .templates
            .values()
            .filter(|t| t.is_usable_at(now))
            .collect();
        if usable
            .iter()
            .any(|t| t.template_hash == template.template_hash && t.user_id != template.user_id)
        {
            return Ok(EnrollmentOutcome::DuplicateTemplate);
        }
        let active = usable
            .iter()
            .filter(|t| t.user_id == template.user_id && t.biometric_type == template.biometric_type)
            .count() as i64;
        if active >= cap {
            return Ok(EnrollmentOutcome::CapReached);
        }
        state.templates.insert(template.id, template.clone());
        Ok(EnrollmentOutcome::Inserted)
    }

    async fn list_usable(
        &self,
        user_id: UserId,
        kind: BiometricType,
        now: DateTime<Utc>,
    ) -> Result<Vec<BiometricTemplate>, AppError> {
        let state = self.lock()?;
        let mut templates: Vec<BiometricTemplate> = state
            .templates
            .values()
            .filter(|t| t.user_id == user_id && t.biometric_type == kind && t.is_usable_at(now))
            .cloned()
            .collect();
        templates.sort_by(|a, b| {
            b.quality_score
                .cmp(&a.quality_score)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(templates)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<BiometricTemplate>, AppError> {
        let state = self.lock()?;
        let mut templates: Vec<BiometricTemplate> = state
            .templates
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(templates)
    }

    async fn record_outcome(&self, id: TemplateId, success: bool) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if let Some(template) = state.templates.get_mut(&id) {
            template.verification_count += 1;
            if success {
                template.successful_verifications += 1;
            } else {
                template.failed_verifications += 1;
            }
        }
        Ok(())
    }

    async fn revoke(&self, user_id: UserId, id: TemplateId) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        Ok(match state.templates.get_mut(&id) {
            Some(template) if template.user_id == user_id && template.is_active => {
                template.is_active = false;
                true
            }
            _ => false,
        })
    }

    async fn log_attempt(&self, attempt: &BiometricAttempt) -> Result<(), AppError> {
        self.lock()?.biometric_attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BiometricAttempt>, AppError> {
        let state = self.lock()?;
        let mut attempts: Vec<BiometricAttempt> = state
            .biometric_attempts
            .iter()
            .filter(|a| a.user_id == user_id && a.created_at >= since)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }
}

#[async_trait]
impl TwoFactorStore for InMemoryStore {
    async fn find_active(&self, user_id: UserId) -> Result<Option<TwoFactorCredential>, AppError> {
        let state = self.lock()?;
        Ok(state
            .credentials
            .values()
            .find(|c| c.user_id == user_id && c.is_active)
            .cloned())
    }

    async fn insert_active(&self, credential: &TwoFactorCredential) -> Result<(), AppError> {
        let mut state = self.lock()?;
        if state
            .credentials
            .values()
            .any(|c| c.user_id == credential.user_id && c.is_active)
        {
            return Err(AppError::Conflict(
                "Two-factor authentication is already enabled".into(),
            ));
        }
        state.credentials.insert(credential.id, credential.clone());
        Ok(())
    }

    async fn update_secret(&self, id: CredentialId, secret: &str) -> Result<(), AppError> {
        if let Some(credential) = self.lock()?.credentials.get_mut(&id) {
            credential.secret = secret.to_string();
        }
        Ok(())
    }

    async fn consume_secret(
        &self,
        id: CredentialId,
        expected: &str,
        replacement: &str,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state.credentials.get_mut(&id) {
            Some(credential) if credential.is_active && credential.secret == expected => {
                credential.secret = replacement.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, id: CredentialId, now: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(credential) = self.lock()?.credentials.get_mut(&id) {
            credential.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn deactivate(&self, user_id: UserId) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let mut changed = false;
        for credential in state.credentials.values_mut() {
            if credential.user_id == user_id && credential.is_active {
                credential.is_active = false;
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn replace_backup_codes(
        &self,
        user_id: UserId,
        code_hashes: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state
            .backup_codes
            .retain(|c| c.user_id != user_id || c.is_used);
        let unique: HashSet<&String> = code_hashes.iter().collect();
        state.backup_codes.extend(unique.into_iter().map(|hash| BackupCode {
            user_id,
            code_hash: hash.clone(),
            is_used: false,
            used_at: None,
            created_at: now,
        }));
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        user_id: UserId,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        match state
            .backup_codes
            .iter_mut()
            .find(|c| c.user_id == user_id && c.code_hash == code_hash && !c.is_used)
        {
            Some(code) => {
                code.is_used = true;
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_unused_backup_codes(&self, user_id: UserId) -> Result<i64, AppError> {
        let state = self.lock()?;
        Ok(state
            .backup_codes
            .iter()
            .filter(|c| c.user_id == user_id && !c.is_used)
            .count() as i64)
    }

    async fn revoke_unused_backup_codes(&self, user_id: UserId) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let before = state.backup_codes.len();
        state
            .backup_codes
            .retain(|c| c.user_id != user_id || c.is_used);
        Ok((before - state.backup_codes.len()) as u64)
    }

    async fn log_attempt(&self, attempt: &TwoFactorAttempt) -> Result<(), AppError> {
        self.lock()?.two_factor_attempts.push(attempt.clone());
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenLedger for InMemoryStore {
    async fn claim(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        if state.refresh_claims.contains_key(jti) {
            return Ok(false);
        }
        state.refresh_claims.insert(jti.to_string(), expires_at);
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        let before = state.refresh_claims.len();
        state.refresh_claims.retain(|_, expires_at| *expires_at > now);
        Ok((before - state.refresh_claims.len()) as u64)
    }
}
