//! Biometric enrollment and threshold-based verification.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use validator::Validate;

use crate::error::AppError;
use crate::models::biometric::{
    BiometricAttempt, BiometricTemplate, BiometricVerification, EnrollBiometricRequest,
    EnrollmentOutcome, TemplateSummary, VerifyBiometricRequest,
};
use crate::models::rate_limit::RateLimitAction;
use crate::repositories::BiometricStore;
use crate::services::rate_limiter::RateLimiter;
use crate::types::{TemplateId, UserId};
use crate::utils::encryption::SecretCipher;
use crate::utils::matcher::BiometricMatcher;
use crate::utils::security::sha256_hex;

pub const MIN_ENROLL_QUALITY: i32 = 70;
pub const MAX_TEMPLATES_PER_TYPE: i64 = 3;
const TEMPLATE_TTL_DAYS: i64 = 365;

#[derive(Clone)]
pub struct BiometricService {
    store: Arc<dyn BiometricStore>,
    rate_limiter: RateLimiter,
    cipher: Arc<dyn SecretCipher>,
    matcher: Arc<dyn BiometricMatcher>,
}

impl BiometricService {
    pub fn new(
        store: Arc<dyn BiometricStore>,
        rate_limiter: RateLimiter,
        cipher: Arc<dyn SecretCipher>,
        matcher: Arc<dyn BiometricMatcher>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            cipher,
            matcher,
        }
    }

    pub async fn enroll(&self, request: EnrollBiometricRequest) -> Result<TemplateSummary, AppError> {
        request.validate()?;
        if request.quality_score < MIN_ENROLL_QUALITY {
            return Err(AppError::validation(format!(
                "Template quality must be at least {MIN_ENROLL_QUALITY}"
            )));
        }

        let now = Utc::now();
        let kind = request.biometric_type;
        let template = BiometricTemplate {
            id: TemplateId::new(),
            user_id: request.user_id,
            biometric_type: kind,
            encrypted_template: self.cipher.encrypt(&request.template)?,
            template_hash: sha256_hex(&request.template),
            quality_score: request.quality_score,
            verification_count: 0,
            successful_verifications: 0,
            failed_verifications: 0,
            created_at: now,
            expires_at: now + Duration::days(TEMPLATE_TTL_DAYS),
            is_active: true,
        };
        match self
            .store
            .insert_capped(&template, MAX_TEMPLATES_PER_TYPE, now)
            .await?
        {
            EnrollmentOutcome::Inserted => {}
            EnrollmentOutcome::CapReached => {
                return Err(AppError::Conflict(format!(
                    "At most {MAX_TEMPLATES_PER_TYPE} active {kind} templates are allowed"
                )));
            }
            EnrollmentOutcome::DuplicateTemplate => {
                tracing::warn!(user_id = %request.user_id, %kind, "duplicate biometric template rejected");
                return Err(AppError::Conflict(
                    "Biometric template is already enrolled".into(),
                ));
            }
        }

        tracing::info!(user_id = %template.user_id, %kind, template_id = %template.id, "biometric template enrolled");
        Ok(TemplateSummary::from(&template))
    }

    /// Scores the sample against every usable template and classifies the best
    /// score. Decryption problems count as a failed attempt rather than an error.
    pub async fn verify(
        &self,
        request: VerifyBiometricRequest,
    ) -> Result<BiometricVerification, AppError> {
        request.validate()?;
        if request.template.trim().is_empty() {
            return Err(AppError::validation("Biometric sample must not be empty"));
        }
        let identifier = request.user_id.to_string();
        self.rate_limiter
            .enforce(&identifier, RateLimitAction::BiometricVerification)
            .await?;

        let now = Utc::now();
        let kind = request.biometric_type;
        let candidates = self.store.list_usable(request.user_id, kind, now).await?;

        let mut best: Option<(f64, TemplateId)> = None;
        for candidate in &candidates {
            let stored = match self.cipher.decrypt(&candidate.encrypted_template) {
                Ok(stored) => stored,
                Err(err) => {
                    tracing::warn!(template_id = %candidate.id, error = %err, "template could not be decrypted");
                    continue;
                }
            };
            let score = self.matcher.score(kind, &request.template, &stored);
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, candidate.id));
            }
        }

        let (score, template_id) = match best {
            Some((score, id)) => (score, Some(id)),
            None => (0.0, candidates.first().map(|c| c.id)),
        };
        let (success, confidence) = kind.thresholds().classify(score);

        self.store
            .log_attempt(&BiometricAttempt {
                user_id: request.user_id,
                biometric_type: kind,
                template_id,
                score,
                success,
                device_fingerprint: request.device_fingerprint.clone(),
                created_at: now,
            })
            .await?;
        if let Some(id) = template_id {
            self.store.record_outcome(id, success).await?;
        }
        if success {
            self.rate_limiter
                .record(&identifier, RateLimitAction::BiometricVerification, true)
                .await?;
        }

        if candidates.is_empty() {
            tracing::info!(user_id = %request.user_id, %kind, "no enrolled templates for verification");
        }
        tracing::info!(user_id = %request.user_id, %kind, success, confidence, "biometric verification");

        Ok(BiometricVerification {
            success,
            confidence,
            score,
            template_id,
        })
    }

    pub async fn list_templates(&self, user_id: UserId) -> Result<Vec<TemplateSummary>, AppError> {
        let templates = self.store.list_for_user(user_id).await?;
        Ok(templates.iter().map(TemplateSummary::from).collect())
    }

    pub async fn revoke_template(&self, user_id: UserId, id: TemplateId) -> Result<(), AppError> {
        if !self.store.revoke(user_id, id).await? {
            return Err(AppError::NotFound("Biometric template not found".into()));
        }
        tracing::info!(%user_id, template_id = %id, "biometric template revoked");
        Ok(())
    }

    pub async fn attempt_history(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<BiometricAttempt>, AppError> {
        self.store.attempts_since(user_id, since).await
    }
}
