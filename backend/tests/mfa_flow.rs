use chrono::{Duration, Utc};

use gatekeeper_backend::{
    error::AppError,
    models::biometric::{BiometricType, EnrollBiometricRequest, VerifyBiometricRequest},
    models::two_factor::{SetupTwoFactorRequest, TwoFactorMethod},
    types::UserId,
    utils::mfa::totp_code_at,
};

mod support;

use support::Sent;

fn template(seed: char) -> String {
    std::iter::repeat(seed).take(160).collect()
}

fn enroll(user_id: UserId, kind: BiometricType, sample: String) -> EnrollBiometricRequest {
    EnrollBiometricRequest {
        user_id,
        biometric_type: kind,
        template: sample,
        quality_score: 88,
        device_fingerprint: Some("device-1".into()),
    }
}

fn verify(user_id: UserId, kind: BiometricType, sample: String) -> VerifyBiometricRequest {
    VerifyBiometricRequest {
        user_id,
        biometric_type: kind,
        template: sample,
        device_fingerprint: Some("device-1".into()),
    }
}

fn totp_now(secret: &str) -> String {
    totp_code_at(secret, Utc::now().timestamp() as u64).expect("totp")
}

fn other_code(code: &str) -> &'static str {
    if code == "000000" {
        "111111"
    } else {
        "000000"
    }
}

#[tokio::test]
async fn iris_enrollment_then_verification() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    let summary = state
        .biometrics
        .enroll(enroll(user_id, BiometricType::Iris, template('q')))
        .await
        .expect("enroll");
    assert_eq!(summary.biometric_type, BiometricType::Iris);
    assert!(summary.expires_at > Utc::now() + Duration::days(364));

    let result = state
        .biometrics
        .verify(verify(user_id, BiometricType::Iris, template('q')))
        .await
        .expect("verify");
    // Identical iris samples score 98: past "good" (95), short of "excellent" (99).
    assert!(result.success);
    assert_eq!(result.confidence, 85);
    assert_eq!(result.template_id, Some(summary.id));
}

#[tokio::test]
async fn templates_are_matched_per_modality() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    state
        .biometrics
        .enroll(enroll(user_id, BiometricType::Face, template('f')))
        .await
        .expect("enroll");

    let result = state
        .biometrics
        .verify(verify(user_id, BiometricType::Voice, template('f')))
        .await
        .expect("verify");
    assert!(!result.success);
    assert_eq!(result.template_id, None);
}

#[tokio::test]
async fn best_template_wins() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    state
        .biometrics
        .enroll(enroll(user_id, BiometricType::Face, template('x')))
        .await
        .expect("enroll");
    let matching = state
        .biometrics
        .enroll(enroll(user_id, BiometricType::Face, template('y')))
        .await
        .expect("enroll");

    let result = state
        .biometrics
        .verify(verify(user_id, BiometricType::Face, template('y')))
        .await
        .expect("verify");
    assert!(result.success);
    assert_eq!(result.template_id, Some(matching.id));
}

#[tokio::test]
async fn attempt_history_records_every_verification() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    state
        .biometrics
        .enroll(enroll(user_id, BiometricType::Fingerprint, template('a')))
        .await
        .expect("enroll");
    state
        .biometrics
        .verify(verify(user_id, BiometricType::Fingerprint, template('a')))
        .await
        .expect("verify");
    state
        .biometrics
        .verify(verify(user_id, BiometricType::Fingerprint, template('b')))
        .await
        .expect("verify");

    let history = state
        .biometrics
        .attempt_history(user_id, Utc::now() - Duration::hours(1))
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|a| a.success).count(), 1);
}

#[tokio::test]
async fn totp_setup_verify_and_disable() {
    let (state, dispatcher) = support::memory_state();
    let user_id = UserId::new();
    let setup = state
        .two_factor
        .setup_two_factor(SetupTwoFactorRequest {
            user_id,
            method: TwoFactorMethod::Totp,
            destination: None,
            account_name: Some("ada@example.com".into()),
        })
        .await
        .expect("setup");
    let secret = setup.secret.clone().expect("secret");
    assert!(setup
        .qr_payload
        .as_deref()
        .expect("qr")
        .contains("issuer=Gatekeeper"));
    assert_eq!(setup.backup_codes.len(), 10);

    assert!(state
        .two_factor
        .verify_two_factor(user_id, &totp_now(&secret), Some("device-1".into()))
        .await
        .expect("verify"));

    let backup = state
        .two_factor
        .verify_backup_code(user_id, &setup.backup_codes[3])
        .await
        .expect("backup");
    assert!(backup.success);
    assert_eq!(backup.remaining_codes, 9);

    state
        .two_factor
        .disable_two_factor(user_id, &totp_now(&secret))
        .await
        .expect("disable");
    assert!(dispatcher
        .sent()
        .iter()
        .any(|sent| matches!(sent, Sent::Notification { user_id: id, .. } if *id == user_id)));
    assert!(matches!(
        state
            .two_factor
            .verify_two_factor(user_id, &totp_now(&secret), None)
            .await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn email_codes_can_be_reissued() {
    let (state, dispatcher) = support::memory_state();
    let user_id = UserId::new();
    let email = support::unique_email("mfa");
    state
        .two_factor
        .setup_two_factor(SetupTwoFactorRequest {
            user_id,
            method: TwoFactorMethod::Email,
            destination: Some(email.clone()),
            account_name: None,
        })
        .await
        .expect("setup");
    let first = dispatcher.last_code_for(&email).expect("first code");

    let expires_at = state
        .two_factor
        .issue_two_factor_code(user_id)
        .await
        .expect("reissue");
    assert!(expires_at > Utc::now());
    let second = dispatcher.last_code_for(&email).expect("second code");

    if first != second {
        assert!(!state
            .two_factor
            .verify_two_factor(user_id, &first, None)
            .await
            .expect("stale code"));
    }
    assert!(state
        .two_factor
        .verify_two_factor(user_id, &second, None)
        .await
        .expect("fresh code"));
}

#[tokio::test]
async fn totp_credentials_do_not_issue_codes() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    state
        .two_factor
        .setup_two_factor(SetupTwoFactorRequest {
            user_id,
            method: TwoFactorMethod::Totp,
            destination: None,
            account_name: None,
        })
        .await
        .expect("setup");
    assert!(matches!(
        state.two_factor.issue_two_factor_code(user_id).await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn wrong_codes_eventually_lock_out() {
    let (state, _) = support::memory_state();
    let user_id = UserId::new();
    let setup = state
        .two_factor
        .setup_two_factor(SetupTwoFactorRequest {
            user_id,
            method: TwoFactorMethod::Totp,
            destination: None,
            account_name: None,
        })
        .await
        .expect("setup");
    let secret = setup.secret.expect("secret");
    let wrong = other_code(&totp_now(&secret));

    for _ in 0..5 {
        assert!(!state
            .two_factor
            .verify_two_factor(user_id, wrong, None)
            .await
            .expect("verify"));
    }
    assert!(matches!(
        state
            .two_factor
            .verify_two_factor(user_id, &totp_now(&secret), None)
            .await,
        Err(AppError::RateLimited { .. })
    ));
}
