use anyhow::{anyhow, Result};
use base32::Alphabet::RFC4648;
use rand::{rngs::OsRng, RngCore};
use totp_rs::{Algorithm, TOTP};

use crate::validation::rules::{is_six_digit_code, CODE_DIGITS};

const SECRET_BYTE_LENGTH: usize = 20;
const STEP_SECONDS: u64 = 30;
/// Two steps either side of the current window are accepted.
pub const ALLOWED_SKEW: u8 = 2;

/// Generates a random base32-encoded secret suitable for RFC6238 TOTP.
pub fn generate_totp_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    base32::encode(RFC4648 { padding: false }, &bytes)
}

/// Produces an `otpauth://` URI that authenticator apps can import from a QR code.
pub fn generate_otpauth_uri(issuer: &str, account_name: &str, secret: &str) -> Result<String> {
    if issuer.contains(':') {
        return Err(anyhow!("Issuer must not contain ':'"));
    }
    let sanitized_account = account_name.trim();
    if sanitized_account.contains(':') {
        return Err(anyhow!("Account name must not contain ':'"));
    }
    let totp = build_totp_with_labels(secret, Some(issuer), sanitized_account)?;
    Ok(totp.get_url())
}

/// Validates the submitted TOTP code against the current time.
pub fn verify_totp_code(secret: &str, code: &str) -> Result<bool> {
    let sanitized_code = code.trim();
    if !is_six_digit_code(sanitized_code) {
        return Ok(false);
    }
    let totp = build_totp(secret)?;
    totp.check_current(sanitized_code)
        .map_err(|e| anyhow!("Failed to verify TOTP code: {}", e))
}

/// Validates the submitted TOTP code as of `unix_seconds`.
pub fn verify_totp_code_at(secret: &str, code: &str, unix_seconds: u64) -> Result<bool> {
    let sanitized_code = code.trim();
    if !is_six_digit_code(sanitized_code) {
        return Ok(false);
    }
    Ok(build_totp(secret)?.check(sanitized_code, unix_seconds))
}

/// Current code for `secret` as of `unix_seconds`.
pub fn totp_code_at(secret: &str, unix_seconds: u64) -> Result<String> {
    Ok(build_totp(secret)?.generate(unix_seconds))
}

fn build_totp(secret: &str) -> Result<TOTP> {
    build_totp_with_labels(secret, None, "")
}

fn build_totp_with_labels(secret: &str, issuer: Option<&str>, account_name: &str) -> Result<TOTP> {
    let secret_bytes = decode_secret(secret)?;
    TOTP::new(
        Algorithm::SHA1,
        CODE_DIGITS,
        ALLOWED_SKEW,
        STEP_SECONDS,
        secret_bytes,
        issuer.map(|value| value.to_string()),
        account_name.to_string(),
    )
    .map_err(|e| anyhow!("Failed to configure TOTP: {}", e))
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let cleaned = secret.trim().replace(' ', "").to_uppercase();
    base32::decode(RFC4648 { padding: false }, cleaned.as_str())
        .ok_or_else(|| anyhow!("Invalid base32 secret"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_secs()
    }

    #[test]
    fn secret_round_trip_verification() {
        let secret = generate_totp_secret();
        let current = totp_code_at(&secret, now()).expect("code");
        assert!(verify_totp_code(&secret, &current).expect("verify"));
    }

    #[test]
    fn codes_within_two_steps_are_accepted() {
        let secret = generate_totp_secret();
        let t = 1_700_000_000;
        let early = totp_code_at(&secret, t - 2 * STEP_SECONDS).expect("code");
        let late = totp_code_at(&secret, t + 2 * STEP_SECONDS).expect("code");
        assert!(verify_totp_code_at(&secret, &early, t).expect("verify"));
        assert!(verify_totp_code_at(&secret, &late, t).expect("verify"));
    }

    #[test]
    fn codes_outside_the_skew_are_rejected() {
        let secret = generate_totp_secret();
        let t = 1_700_000_000;
        let stale = totp_code_at(&secret, t - 4 * STEP_SECONDS).expect("code");
        let current = totp_code_at(&secret, t).expect("code");
        if stale != current {
            assert!(!verify_totp_code_at(&secret, &stale, t).expect("verify"));
        }
    }

    #[test]
    fn malformed_codes_are_rejected_without_error() {
        let secret = generate_totp_secret();
        assert!(!verify_totp_code(&secret, "12ab56").expect("verify"));
        assert!(!verify_totp_code(&secret, "12345").expect("verify"));
    }

    #[test]
    fn otpauth_uri_contains_issuer_and_account() {
        let secret = generate_totp_secret();
        let uri = generate_otpauth_uri("Gatekeeper", "alice@example.com", &secret).expect("uri");
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains("issuer=Gatekeeper"));
        assert!(uri.contains(&secret));
    }

    #[test]
    fn otpauth_uri_rejects_colons() {
        let secret = generate_totp_secret();
        assert!(generate_otpauth_uri("Gate:keeper", "alice", &secret).is_err());
        assert!(generate_otpauth_uri("Gatekeeper", "al:ice", &secret).is_err());
    }
}
