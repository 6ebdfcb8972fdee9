//! Sliding-window rate limiting with escalating blocks.

use std::sync::Arc;

use chrono::Utc;

use crate::config::RateLimitConfig;
use crate::error::AppError;
use crate::models::rate_limit::{
    apply_step, rate_limit_key, ApiTier, RateLimitAction, RateLimitDecision, RateLimitStep,
    RateLimitSubject,
};
use crate::repositories::RateLimitStore;
use crate::types::UserId;
use crate::validation::rules::normalize_contact;

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policies: RateLimitConfig) -> Self {
        Self { store, policies }
    }

    fn subject(&self, identifier: &str, action: RateLimitAction) -> RateLimitSubject {
        RateLimitSubject::new(identifier, action, self.policies.policy_for(action))
    }

    /// Evaluates (and, when a block starts or a window rolls over, persists)
    /// the counter for `(identifier, action)`.
    pub async fn check(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, AppError> {
        let subject = self.subject(identifier, action);
        let decision = self
            .store
            .transition(&subject, RateLimitStep::Check, Utc::now())
            .await?;
        if !decision.allowed {
            tracing::warn!(
                action = action.as_str(),
                blocked_until = ?decision.blocked_until,
                "rate limit exceeded"
            );
        }
        Ok(decision)
    }

    pub async fn record(
        &self,
        identifier: &str,
        action: RateLimitAction,
        success: bool,
    ) -> Result<RateLimitDecision, AppError> {
        let subject = self.subject(identifier, action);
        self.store
            .transition(&subject, RateLimitStep::Record { success }, Utc::now())
            .await
    }

    /// Read-only view of the counter; never starts a block.
    pub async fn status(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, AppError> {
        let subject = self.subject(identifier, action);
        let current = self.store.find(&subject.key).await?;
        Ok(apply_step(current, &subject, RateLimitStep::Check, Utc::now()).decision)
    }

    /// Administrative unblock.
    pub async fn reset(&self, identifier: &str, action: RateLimitAction) -> Result<bool, AppError> {
        let removed = self.store.reset(&rate_limit_key(identifier, action)).await?;
        if removed {
            tracing::info!(action = action.as_str(), "rate limit reset");
        }
        Ok(removed)
    }

    /// Reserves one attempt. The window check and the increment are a single
    /// store transition, so concurrent callers cannot share the last slot.
    pub async fn consume(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, AppError> {
        let subject = self.subject(identifier, action);
        let decision = self
            .store
            .transition(&subject, RateLimitStep::Consume, Utc::now())
            .await?;
        if !decision.allowed {
            tracing::warn!(
                action = action.as_str(),
                blocked_until = ?decision.blocked_until,
                "rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Returns an attempt taken by [`consume`](Self::consume) whose work was
    /// never carried out.
    pub async fn release(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, AppError> {
        let subject = self.subject(identifier, action);
        self.store
            .transition(&subject, RateLimitStep::Release, Utc::now())
            .await
    }

    /// Reserves an attempt and turns a denial into [`AppError::RateLimited`].
    pub async fn enforce(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitDecision, AppError> {
        let decision = self.consume(identifier, action).await?;
        ensure_allowed(&decision)?;
        Ok(decision)
    }

    /// Reserves an attempt on every counter; the most restrictive decision
    /// wins. When any counter denies, the slots taken on the others are
    /// handed back.
    async fn consume_all(
        &self,
        counters: &[(&str, RateLimitAction)],
    ) -> Result<RateLimitDecision, AppError> {
        let mut granted = Vec::with_capacity(counters.len());
        let mut combined: Option<RateLimitDecision> = None;
        for &(identifier, action) in counters {
            let decision = self.consume(identifier, action).await?;
            if decision.allowed {
                granted.push((identifier, action));
            }
            combined = Some(match combined {
                Some(current) => most_restrictive(current, decision),
                None => decision,
            });
        }
        let combined = combined.ok_or_else(|| {
            AppError::InternalServerError(anyhow::anyhow!("no rate-limit counters given"))
        })?;
        if !combined.allowed {
            for (identifier, action) in granted {
                self.release(identifier, action).await?;
            }
        }
        Ok(combined)
    }

    /// Reserves a login attempt on the e-mail counter and, when known, the IP
    /// counter. A successful login resets them through [`record`](Self::record).
    pub async fn check_login_rate_limit(
        &self,
        email: &str,
        ip: Option<&str>,
    ) -> Result<RateLimitDecision, AppError> {
        let email = normalize_contact(email);
        let mut counters = vec![(email.as_str(), RateLimitAction::LoginEmail)];
        if let Some(ip) = ip {
            counters.push((ip, RateLimitAction::LoginIp));
        }
        self.consume_all(&counters).await
    }

    /// Reserves a registration on the e-mail, phone and IP counters. Callers
    /// release the contact slots when the registration does not go through.
    pub async fn check_registration_rate_limit(
        &self,
        email: &str,
        phone: &str,
        ip: Option<&str>,
    ) -> Result<RateLimitDecision, AppError> {
        let email = normalize_contact(email);
        let phone = normalize_contact(phone);
        let mut counters = vec![
            (email.as_str(), RateLimitAction::RegistrationContact),
            (phone.as_str(), RateLimitAction::RegistrationContact),
        ];
        if let Some(ip) = ip {
            counters.push((ip, RateLimitAction::RegistrationIp));
        }
        self.consume_all(&counters).await
    }

    pub async fn check_otp_rate_limit(&self, contact: &str) -> Result<RateLimitDecision, AppError> {
        self.consume(&normalize_contact(contact), RateLimitAction::OtpSend)
            .await
    }

    pub async fn check_biometric_rate_limit(
        &self,
        user_id: UserId,
    ) -> Result<RateLimitDecision, AppError> {
        self.consume(&user_id.to_string(), RateLimitAction::BiometricVerification)
            .await
    }

    pub async fn check_two_factor_rate_limit(
        &self,
        user_id: UserId,
    ) -> Result<RateLimitDecision, AppError> {
        self.consume(&user_id.to_string(), RateLimitAction::TwoFactorVerification)
            .await
    }

    /// Counts the request itself: every allowed call uses up one slot.
    pub async fn check_api_rate_limit(
        &self,
        identifier: &str,
        tier: ApiTier,
    ) -> Result<RateLimitDecision, AppError> {
        self.consume(identifier, tier.action()).await
    }
}

/// Maps a denial onto the error surfaced to callers.
pub fn ensure_allowed(decision: &RateLimitDecision) -> Result<(), AppError> {
    if decision.allowed {
        return Ok(());
    }
    Err(AppError::RateLimited {
        message: "Too many attempts. Please try again later.".to_string(),
        reset_at: decision.blocked_until.unwrap_or(decision.reset_time),
    })
}

fn most_restrictive(a: RateLimitDecision, b: RateLimitDecision) -> RateLimitDecision {
    match (a.allowed, b.allowed) {
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if b.reset_time > a.reset_time {
                b
            } else {
                a
            }
        }
        (true, true) => {
            if b.remaining_attempts < a.remaining_attempts {
                b
            } else {
                a
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rate_limit::RateLimitPolicy;
    use crate::repositories::InMemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryStore::new()), RateLimitConfig::default())
    }

    /// Lets other tasks run before every store call, widening race windows.
    struct YieldingStore(InMemoryStore);

    #[async_trait::async_trait]
    impl RateLimitStore for YieldingStore {
        async fn transition(
            &self,
            subject: &RateLimitSubject,
            step: RateLimitStep,
            now: chrono::DateTime<Utc>,
        ) -> Result<RateLimitDecision, AppError> {
            tokio::task::yield_now().await;
            RateLimitStore::transition(&self.0, subject, step, now).await
        }

        async fn find(
            &self,
            key: &str,
        ) -> Result<Option<crate::models::rate_limit::RateLimitRecord>, AppError> {
            RateLimitStore::find(&self.0, key).await
        }

        async fn reset(&self, key: &str) -> Result<bool, AppError> {
            RateLimitStore::reset(&self.0, key).await
        }

        async fn delete_stale(
            &self,
            cutoff: chrono::DateTime<Utc>,
            now: chrono::DateTime<Utc>,
        ) -> Result<u64, AppError> {
            RateLimitStore::delete_stale(&self.0, cutoff, now).await
        }
    }

    #[tokio::test]
    async fn k_failures_then_check_blocks() {
        for k in [1, 3, 5] {
            let mut policies = RateLimitConfig::default();
            policies.set(RateLimitAction::LoginEmail, RateLimitPolicy::new(900, k, 1800));
            let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), policies);

            for _ in 0..k {
                limiter
                    .record("a@x.com", RateLimitAction::LoginEmail, false)
                    .await
                    .expect("record");
            }
            let decision = limiter
                .check("a@x.com", RateLimitAction::LoginEmail)
                .await
                .expect("check");
            assert!(!decision.allowed, "k={k}");
            let until = decision.blocked_until.expect("blocked");
            assert!(until > Utc::now());

            let after = limiter
                .record("a@x.com", RateLimitAction::LoginEmail, true)
                .await
                .expect("record");
            assert!(after.allowed);
            assert!(after.blocked_until.is_none());
            let record = limiter
                .store
                .find(&rate_limit_key("a@x.com", RateLimitAction::LoginEmail))
                .await
                .expect("find")
                .expect("exists");
            assert_eq!(record.attempts, 0);
            assert_eq!(record.successful_attempts, 1);
        }
    }

    #[tokio::test]
    async fn remaining_attempts_count_down() {
        let limiter = limiter();
        let fresh = limiter
            .check("1.2.3.4", RateLimitAction::LoginIp)
            .await
            .expect("check");
        assert_eq!(fresh.remaining_attempts, 10);

        limiter
            .record("1.2.3.4", RateLimitAction::LoginIp, false)
            .await
            .expect("record");
        let decision = limiter
            .check("1.2.3.4", RateLimitAction::LoginIp)
            .await
            .expect("check");
        assert_eq!(decision.remaining_attempts, 9);
    }

    #[tokio::test]
    async fn enforce_maps_block_to_rate_limited() {
        let limiter = limiter();
        for _ in 0..3 {
            limiter
                .record("+2348000000000", RateLimitAction::OtpSend, false)
                .await
                .expect("record");
        }
        let err = limiter
            .enforce("+2348000000000", RateLimitAction::OtpSend)
            .await
            .expect_err("blocked");
        assert!(matches!(err, AppError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn status_does_not_start_a_block() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter
                .record("a@x.com", RateLimitAction::LoginEmail, false)
                .await
                .expect("record");
        }
        let status = limiter
            .status("a@x.com", RateLimitAction::LoginEmail)
            .await
            .expect("status");
        assert!(!status.allowed);
        let record = limiter
            .store
            .find(&rate_limit_key("a@x.com", RateLimitAction::LoginEmail))
            .await
            .expect("find")
            .expect("exists");
        assert!(record.blocked_until.is_none());
    }

    #[tokio::test]
    async fn reset_clears_a_block() {
        let limiter = limiter();
        for _ in 0..5 {
            limiter
                .record("a@x.com", RateLimitAction::LoginEmail, false)
                .await
                .expect("record");
        }
        assert!(!limiter
            .check("a@x.com", RateLimitAction::LoginEmail)
            .await
            .expect("check")
            .allowed);
        assert!(limiter
            .reset("a@x.com", RateLimitAction::LoginEmail)
            .await
            .expect("reset"));
        assert!(limiter
            .check("a@x.com", RateLimitAction::LoginEmail)
            .await
            .expect("check")
            .allowed);
    }

    #[tokio::test]
    async fn login_check_takes_most_restrictive_counter() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter
                .record("9.9.9.9", RateLimitAction::LoginIp, false)
                .await
                .expect("record");
        }
        let decision = limiter
            .check_login_rate_limit("fresh@x.com", Some("9.9.9.9"))
            .await
            .expect("check");
        assert!(!decision.allowed);

        let by_email_only = limiter
            .check_login_rate_limit("fresh@x.com", None)
            .await
            .expect("check");
        assert!(by_email_only.allowed);
    }

    #[tokio::test]
    async fn api_checks_count_every_request() {
        let mut policies = RateLimitConfig::default();
        policies.set(RateLimitAction::ApiFree, RateLimitPolicy::new(60, 2, 300));
        let limiter = RateLimiter::new(Arc::new(InMemoryStore::new()), policies);

        assert!(limiter.check_api_rate_limit("key", ApiTier::Free).await.expect("1").allowed);
        assert!(limiter.check_api_rate_limit("key", ApiTier::Free).await.expect("2").allowed);
        assert!(!limiter.check_api_rate_limit("key", ApiTier::Free).await.expect("3").allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_api_calls_cannot_overrun_the_budget() {
        let mut policies = RateLimitConfig::default();
        policies.set(RateLimitAction::ApiFree, RateLimitPolicy::new(60, 2, 300));
        let limiter = RateLimiter::new(Arc::new(YieldingStore(InMemoryStore::new())), policies);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .check_api_rate_limit("key", ApiTier::Free)
                        .await
                        .expect("check")
                        .allowed
                })
            })
            .collect();
        let mut allowed = 0;
        for handle in handles {
            if handle.await.expect("join") {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guards_admit_at_most_max_attempts() {
        let limiter = RateLimiter::new(
            Arc::new(YieldingStore(InMemoryStore::new())),
            RateLimitConfig::default(),
        );
        let user_id = UserId::new();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter
                        .enforce(&user_id.to_string(), RateLimitAction::BiometricVerification)
                        .await
                        .is_ok()
                })
            })
            .collect();
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("join") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn registration_counts_phone_as_well_as_email() {
        let limiter = limiter();
        assert!(limiter
            .check_registration_rate_limit("a@x.com", "+2348000000001", None)
            .await
            .expect("first")
            .allowed);

        let same_phone = limiter
            .check_registration_rate_limit("b@x.com", "+234 800 000 0001", None)
            .await
            .expect("second");
        assert!(!same_phone.allowed);

        // The denied request handed back the slot it took for b@x.com.
        assert!(limiter
            .check_registration_rate_limit("b@x.com", "+2348000000002", None)
            .await
            .expect("third")
            .allowed);
    }

    #[tokio::test]
    async fn release_returns_a_reserved_attempt() {
        let limiter = limiter();
        for _ in 0..3 {
            limiter
                .consume("+2348000000000", RateLimitAction::OtpSend)
                .await
                .expect("consume");
        }
        limiter
            .release("+2348000000000", RateLimitAction::OtpSend)
            .await
            .expect("release");
        limiter
            .enforce("+2348000000000", RateLimitAction::OtpSend)
            .await
            .expect("slot handed back");
        assert!(matches!(
            limiter
                .enforce("+2348000000000", RateLimitAction::OtpSend)
                .await,
            Err(AppError::RateLimited { .. })
        ));
    }

    #[test]
    fn ensure_allowed_prefers_block_deadline() {
        let until = Utc::now() + chrono::Duration::minutes(30);
        let err = ensure_allowed(&RateLimitDecision {
            allowed: false,
            remaining_attempts: 0,
            reset_time: Utc::now(),
            blocked_until: Some(until),
        })
        .expect_err("denied");
        match err {
            AppError::RateLimited { reset_at, .. } => assert_eq!(reset_at, until),
            other => panic!("unexpected {other:?}"),
        }
    }
}
