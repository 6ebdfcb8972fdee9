use chrono::{Duration, Utc};

use gatekeeper_backend::{
    error::AppError,
    models::signing_key::SigningKey,
    services::KeyManager,
    types::UserId,
    utils::jwt::{encode_token, AccessClaims, RefreshClaims},
};

mod support;

const LEGACY_ACCESS: &str = "legacy-access-secret-with-plenty-of-length-2026";

fn active_key() -> SigningKey {
    SigningKey {
        is_active: true,
        ..KeyManager::generate()
    }
}

fn access_claims() -> AccessClaims {
    AccessClaims::new(UserId::new(), None, "user", Duration::minutes(15))
}

#[test]
fn tokens_signed_before_rotation_still_verify() {
    let manager = KeyManager::new(vec![active_key()], None, None);
    let before = manager.sign_access(&access_claims()).expect("sign");
    let old_kid = KeyManager::kid_of(&before).expect("kid");

    let rotated = manager.rotate(KeyManager::generate()).expect("rotate");
    assert_ne!(rotated.kid, old_kid);
    assert_eq!(manager.active_key().expect("active").kid, rotated.kid);

    manager.verify_access(&before).expect("old token verifies");
    let after = manager.sign_access(&access_claims()).expect("sign");
    assert_eq!(KeyManager::kid_of(&after).as_deref(), Some(rotated.kid.as_str()));

    assert!(manager.retire(&old_kid).expect("retire"));
    assert!(matches!(
        manager.verify_access(&before),
        Err(AppError::Unauthorized(_))
    ));
    manager.verify_access(&after).expect("new token verifies");
}

#[test]
fn active_key_cannot_be_retired() {
    let key = active_key();
    let manager = KeyManager::new(vec![key.clone()], None, None);
    assert!(matches!(manager.retire(&key.kid), Err(AppError::Conflict(_))));
    assert!(!manager.retire("unknown").expect("unknown kid"));
}

#[test]
fn tokens_without_kid_fall_back_to_legacy_secret() {
    let manager = KeyManager::new(vec![active_key()], Some(LEGACY_ACCESS.into()), None);
    let claims = access_claims();
    let legacy_token = encode_token(&claims, None, LEGACY_ACCESS).expect("encode");
    let decoded = manager.verify_access(&legacy_token).expect("legacy verifies");
    assert_eq!(decoded, claims);

    // Refresh tokens fall back to the access secret when no refresh legacy secret exists.
    let refresh = RefreshClaims::new(UserId::new(), None, Duration::days(1));
    let legacy_refresh = encode_token(&refresh, None, LEGACY_ACCESS).expect("encode");
    manager
        .verify_refresh(&legacy_refresh)
        .expect("refresh falls back");
}

#[test]
fn legacy_only_configuration_signs_without_kid() {
    let manager = KeyManager::new(Vec::new(), Some(LEGACY_ACCESS.into()), None);
    let token = manager.sign_access(&access_claims()).expect("sign");
    assert!(KeyManager::kid_of(&token).is_none());
    manager.verify_access(&token).expect("verify");
}

#[test]
fn expired_tokens_are_rejected() {
    let manager = KeyManager::new(vec![active_key()], None, None);
    let mut claims = access_claims();
    claims.iat = (Utc::now() - Duration::hours(2)).timestamp();
    claims.exp = (Utc::now() - Duration::hours(1)).timestamp();
    let token = manager.sign_access(&claims).expect("sign");
    assert!(matches!(
        manager.verify_access(&token),
        Err(AppError::Unauthorized(_))
    ));
}

#[test]
fn validation_flags_weak_and_duplicate_material() {
    let weak = SigningKey {
        kid: "weak".into(),
        access_secret: "secret".into(),
        refresh_secret: "secret".into(),
        created_at: Utc::now(),
        is_active: true,
    };
    let report = KeyManager::new(vec![weak.clone(), active_key()], None, None).validate();
    assert!(!report.valid);
    assert!(report.errors.len() >= 3);

    assert!(matches!(
        KeyManager::new(vec![active_key()], None, None).rotate(weak),
        Err(AppError::Validation(_))
    ));
    assert!(KeyManager::new(vec![active_key()], None, None).validate().valid);
}

#[tokio::test]
async fn rotation_does_not_break_live_sessions() {
    let (state, _) = support::memory_state();
    let issued = state
        .sessions
        .create_session(UserId::new(), &support::device("203.0.113.77"), None)
        .await
        .expect("create");

    state.keys.rotate(KeyManager::generate()).expect("rotate");
    let rotated = state
        .sessions
        .refresh_session(&issued.refresh_token)
        .await
        .expect("refresh after rotation");
    assert_eq!(
        KeyManager::kid_of(&rotated.refresh_token),
        state.keys.active_key().map(|k| k.kid)
    );
}
