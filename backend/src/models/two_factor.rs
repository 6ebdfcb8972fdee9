//! Two-factor credentials and backup codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{CredentialId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorMethod {
    Totp,
    Sms,
    Email,
}

impl TwoFactorMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            TwoFactorMethod::Totp => "totp",
            TwoFactorMethod::Sms => "sms",
            TwoFactorMethod::Email => "email",
        }
    }

    /// SMS and e-mail credentials hold a one-time code instead of a TOTP seed.
    pub fn is_code_based(self) -> bool {
        matches!(self, TwoFactorMethod::Sms | TwoFactorMethod::Email)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TwoFactorCredential {
    pub id: CredentialId,
    pub user_id: UserId,
    pub method: TwoFactorMethod,
    /// Encrypted TOTP seed or encrypted pending code.
    pub secret: String,
    /// Delivery address for SMS/e-mail methods.
    pub destination: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct BackupCode {
    pub user_id: UserId,
    /// SHA-256 of the normalized code.
    pub code_hash: String,
    pub is_used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
/// Append-only audit row for a 2FA verification.
pub struct TwoFactorAttempt {
    pub user_id: UserId,
    pub method: TwoFactorMethod,
    pub success: bool,
    pub device_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTwoFactorRequest {
    pub user_id: UserId,
    pub method: TwoFactorMethod,
    /// Phone number or e-mail for code-based methods.
    #[serde(default)]
    pub destination: Option<String>,
    /// Label shown in authenticator apps.
    #[serde(default)]
    pub account_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorSetup {
    pub method: TwoFactorMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// `otpauth://` URI to render as a QR code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupCodeVerification {
    pub success: bool,
    pub remaining_codes: i64,
}
