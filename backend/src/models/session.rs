//! Models for tracking login sessions and the devices behind them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::types::{SessionId, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Client metadata reported at login.
pub struct DeviceInfo {
    pub user_agent: String,
    pub ip: String,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    /// Pre-computed fingerprint supplied by the client, if any.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
/// Database representation of a login session.
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub device_fingerprint: String,
    pub device_info: Json<DeviceInfo>,
    pub location: Option<Json<Location>>,
    /// Identifier of the only refresh token currently accepted for this session.
    #[serde(skip_serializing)]
    pub refresh_jti: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Session {
    /// A session is usable while active and not yet expired.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    DeniedCountry,
    AutomatedUserAgent,
    UnusualHour,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// Advisory finding; never blocks a request on its own.
pub struct SuspiciousSession {
    pub session_id: SessionId,
    pub reasons: Vec<SuspicionReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(is_active: bool, expires_at: DateTime<Utc>) -> Session {
        Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            device_fingerprint: "fp".into(),
            device_info: Json(DeviceInfo::default()),
            location: None,
            refresh_jti: "jti".into(),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            expires_at,
            is_active,
        }
    }

    #[test]
    fn usable_requires_active_and_unexpired() {
        let now = Utc::now();
        assert!(session(true, now + Duration::hours(1)).is_usable_at(now));
        assert!(!session(false, now + Duration::hours(1)).is_usable_at(now));
        assert!(!session(true, now - Duration::seconds(1)).is_usable_at(now));
    }

    #[test]
    fn refresh_jti_is_not_serialized() {
        let json = serde_json::to_value(session(true, Utc::now())).expect("json");
        assert!(json.get("refreshJti").is_none());
        assert!(json.get("deviceFingerprint").is_some());
    }
}
