//! Login one-time passcodes delivered over SMS or e-mail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpChannel {
    Sms,
    Email,
}

#[derive(Debug, Clone, FromRow)]
/// Pending code for a contact. One row per contact; re-sending overwrites it.
pub struct OtpRecord {
    pub contact: String,
    /// SHA-256 of the issued code.
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl OtpRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOtpRequest {
    pub contact: String,
    pub channel: OtpChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub contact: String,
    pub code: String,
    #[serde(default)]
    pub device: Option<crate::models::session::DeviceInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// Acknowledgement for a dispatched code. The code itself is never echoed.
pub struct OtpDispatch {
    pub contact: String,
    pub channel: OtpChannel,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn record_expires_exactly_at_deadline() {
        let now = Utc::now();
        let record = OtpRecord {
            contact: "+2348000000000".into(),
            code_hash: "hash".into(),
            expires_at: now + Duration::minutes(15),
            attempts: 0,
            created_at: now,
        };
        assert!(!record.is_expired_at(now + Duration::minutes(15) - Duration::seconds(1)));
        assert!(record.is_expired_at(now + Duration::minutes(15)));
    }
}
