use std::sync::Arc;

use gatekeeper_backend::{
    config::RateLimitConfig,
    error::AppError,
    models::rate_limit::{rate_limit_key, ApiTier, RateLimitAction, RateLimitPolicy},
    repositories::{InMemoryStore, RateLimitStore},
    services::RateLimiter,
    types::UserId,
};

mod support;

fn limiter() -> RateLimiter {
    RateLimiter::new(Arc::new(InMemoryStore::new()), RateLimitConfig::default())
}

#[tokio::test]
async fn five_failed_logins_block_the_email() {
    let limiter = limiter();
    for _ in 0..5 {
        limiter
            .record("ada@example.com", RateLimitAction::LoginEmail, false)
            .await
            .expect("record");
    }
    let decision = limiter
        .check_login_rate_limit("ADA@example.com", None)
        .await
        .expect("check");
    assert!(!decision.allowed);
    let until = decision.blocked_until.expect("blocked");
    assert!(until > chrono::Utc::now() + chrono::Duration::minutes(29));
}

#[tokio::test]
async fn success_resets_the_counter() {
    let limiter = limiter();
    for _ in 0..4 {
        limiter
            .record("ada@example.com", RateLimitAction::LoginEmail, false)
            .await
            .expect("record");
    }
    limiter
        .record("ada@example.com", RateLimitAction::LoginEmail, true)
        .await
        .expect("record");
    let decision = limiter
        .check("ada@example.com", RateLimitAction::LoginEmail)
        .await
        .expect("check");
    assert!(decision.allowed);
    assert_eq!(decision.remaining_attempts, 5);
}

#[tokio::test]
async fn ip_block_applies_across_emails() {
    let limiter = limiter();
    for _ in 0..10 {
        limiter
            .record("203.0.113.5", RateLimitAction::LoginIp, false)
            .await
            .expect("record");
    }
    let decision = limiter
        .check_login_rate_limit("fresh@example.com", Some("203.0.113.5"))
        .await
        .expect("check");
    assert!(!decision.allowed);
}

#[tokio::test]
async fn concurrent_failures_are_all_counted() {
    let store = Arc::new(InMemoryStore::new());
    let mut policies = RateLimitConfig::default();
    policies.set(
        RateLimitAction::BiometricVerification,
        RateLimitPolicy::new(300, 50, 600),
    );
    let limiter = RateLimiter::new(store, policies);
    let user_id = UserId::new();

    let mut handles = Vec::new();
    for _ in 0..40 {
        let limiter = limiter.clone();
        let identifier = user_id.to_string();
        handles.push(tokio::spawn(async move {
            limiter
                .record(&identifier, RateLimitAction::BiometricVerification, false)
                .await
                .expect("record")
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let status = limiter
        .status(&user_id.to_string(), RateLimitAction::BiometricVerification)
        .await
        .expect("status");
    assert_eq!(status.remaining_attempts, 10);
}

#[tokio::test]
async fn api_tiers_count_every_request() {
    let store = Arc::new(InMemoryStore::new());
    let mut policies = RateLimitConfig::default();
    policies.set(RateLimitAction::ApiFree, RateLimitPolicy::new(60, 3, 300));
    let limiter = RateLimiter::new(store, policies);

    for expected_remaining in [2, 1, 0] {
        let decision = limiter
            .check_api_rate_limit("client-1", ApiTier::Free)
            .await
            .expect("api");
        assert!(decision.allowed);
        assert_eq!(decision.remaining_attempts, expected_remaining);
    }
    let denied = limiter
        .check_api_rate_limit("client-1", ApiTier::Free)
        .await
        .expect("api");
    assert!(!denied.allowed);

    let premium = limiter
        .check_api_rate_limit("client-1", ApiTier::Premium)
        .await
        .expect("api");
    assert!(premium.allowed);
    assert_eq!(premium.remaining_attempts, 499);
}

#[tokio::test]
async fn reset_lifts_a_block() {
    let limiter = limiter();
    for _ in 0..3 {
        limiter
            .record("+2348012345678", RateLimitAction::OtpSend, false)
            .await
            .expect("record");
    }
    let err = limiter
        .enforce("+2348012345678", RateLimitAction::OtpSend)
        .await
        .expect_err("blocked");
    assert!(matches!(err, AppError::RateLimited { .. }));

    assert!(limiter
        .reset("+2348012345678", RateLimitAction::OtpSend)
        .await
        .expect("reset"));
    limiter
        .enforce("+2348012345678", RateLimitAction::OtpSend)
        .await
        .expect("allowed again");
}

#[tokio::test]
async fn status_never_starts_a_block() {
    let store = Arc::new(InMemoryStore::new());
    let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());
    for _ in 0..5 {
        limiter
            .record("ada@example.com", RateLimitAction::LoginEmail, false)
            .await
            .expect("record");
    }
    let status = limiter
        .status("ada@example.com", RateLimitAction::LoginEmail)
        .await
        .expect("status");
    assert!(!status.allowed);

    let key = rate_limit_key("ada@example.com", RateLimitAction::LoginEmail);
    let stored = RateLimitStore::find(&*store, &key)
        .await
        .expect("find")
        .expect("record");
    assert_eq!(stored.attempts, 5);
    assert!(stored.blocked_until.is_none());
}

#[tokio::test]
async fn login_through_auth_service_locks_after_failures() {
    let (state, _) = support::memory_state();
    let email = support::unique_email("locked");
    for _ in 0..5 {
        let _ = state
            .auth
            .login(gatekeeper_backend::models::user::LoginRequest {
                email: email.clone(),
                password: "wrong".into(),
                device: Some(support::device("198.51.100.99")),
            })
            .await;
    }
    let err = state
        .auth
        .login(gatekeeper_backend::models::user::LoginRequest {
            email,
            password: "wrong".into(),
            device: None,
        })
        .await
        .expect_err("locked");
    assert!(matches!(err, AppError::RateLimited { .. }));
}
