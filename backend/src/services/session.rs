//! Session lifecycle: capped creation, bound refresh tokens, revocation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use chrono_tz::Tz;
use sqlx::types::Json;

use crate::config::Config;
use crate::error::AppError;
use crate::models::session::{DeviceInfo, Location, Session, SuspicionReason, SuspiciousSession};
use crate::repositories::SessionStore;
use crate::services::key_manager::KeyManager;
use crate::types::{SessionId, UserId};
use crate::utils::fingerprint::device_fingerprint;
use crate::utils::jwt::RefreshClaims;
use crate::utils::time::local_hour;

const AUTOMATION_MARKERS: [&str; 5] = ["bot", "crawler", "headless", "selenium", "puppeteer"];
const UNUSUAL_HOURS: std::ops::RangeInclusive<u32> = 2..=5;

/// A session together with the refresh token currently accepted for it.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub refresh_token: String,
    /// Sessions revoked to stay under the per-user cap.
    pub evicted: Vec<SessionId>,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    keys: Arc<KeyManager>,
    max_active: usize,
    session_ttl: Duration,
    refresh_ttl: Duration,
    time_zone: Tz,
    suspicious_countries: Vec<String>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, keys: Arc<KeyManager>, config: &Config) -> Self {
        Self {
            store,
            keys,
            max_active: config.max_active_sessions,
            session_ttl: Duration::days(config.session_ttl_days),
            refresh_ttl: Duration::days(config.refresh_token_ttl_days),
            time_zone: config.time_zone,
            suspicious_countries: config.suspicious_countries.clone(),
        }
    }

    pub async fn create_session(
        &self,
        user_id: UserId,
        device: &DeviceInfo,
        location: Option<Location>,
    ) -> Result<IssuedSession, AppError> {
        let now = Utc::now();
        let session_id = SessionId::new();
        let claims = RefreshClaims::new(user_id, Some(session_id), self.refresh_ttl);
        let refresh_token = self.keys.sign_refresh(&claims)?;

        let session = Session {
            id: session_id,
            user_id,
            device_fingerprint: device_fingerprint(device),
            device_info: Json(device.clone()),
            location: location.map(Json),
            refresh_jti: claims.jti,
            created_at: now,
            last_active_at: now,
            expires_at: now + self.session_ttl,
            is_active: true,
        };

        let evicted = self.store.insert_capped(&session, self.max_active).await?;
        for id in &evicted {
            tracing::info!(%user_id, session_id = %id, "evicted oldest session over the cap");
        }
        tracing::info!(%user_id, session_id = %session.id, "session created");

        Ok(IssuedSession {
            session,
            refresh_token,
            evicted,
        })
    }

    /// Verifies a session-bound refresh token and rotates it.
    pub async fn refresh_session(&self, token: &str) -> Result<IssuedSession, AppError> {
        let claims = self.keys.verify_refresh(token)?;
        self.rotate(&claims).await
    }

    /// Accepts `claims` once: the session's expected `jti` is swapped for a new
    /// one. Presenting an already-rotated token revokes the session.
    pub async fn rotate(&self, claims: &RefreshClaims) -> Result<IssuedSession, AppError> {
        let session_id = claims
            .session_id()?
            .ok_or_else(|| AppError::Unauthorized("Token is not bound to a session".into()))?;
        let user_id = claims.user_id()?;

        let session = self
            .store
            .find(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".into()))?;
        if session.user_id != user_id {
            return Err(AppError::Unauthorized("Invalid refresh token".into()));
        }
        if !session.is_active {
            return Err(AppError::Unauthorized("Session has been revoked".into()));
        }
        let now = Utc::now();
        if session.expires_at <= now {
            return Err(AppError::Expired("Session has expired".into()));
        }

        let next = RefreshClaims::new(user_id, Some(session_id), self.refresh_ttl);
        let refresh_token = self.keys.sign_refresh(&next)?;
        let swapped = self
            .store
            .rotate_refresh_jti(session_id, &claims.jti, &next.jti, now)
            .await?;
        if !swapped {
            self.store.revoke(session_id).await?;
            tracing::warn!(%user_id, %session_id, "refresh token reuse detected; session revoked");
            return Err(AppError::Unauthorized(
                "Refresh token has already been used".into(),
            ));
        }

        Ok(IssuedSession {
            session: Session {
                refresh_jti: next.jti,
                last_active_at: now,
                ..session
            },
            refresh_token,
            evicted: Vec::new(),
        })
    }

    pub async fn revoke_session(&self, id: SessionId) -> Result<bool, AppError> {
        let revoked = self.store.revoke(id).await?;
        if revoked {
            tracing::info!(session_id = %id, "session revoked");
        }
        Ok(revoked)
    }

    pub async fn revoke_all_other_sessions(
        &self,
        user_id: UserId,
        except: SessionId,
    ) -> Result<u64, AppError> {
        let revoked = self.store.revoke_all_except(user_id, except).await?;
        tracing::info!(%user_id, revoked, "other sessions revoked");
        Ok(revoked)
    }

    pub async fn revoke_all_sessions(&self, user_id: UserId) -> Result<u64, AppError> {
        let revoked = self.store.revoke_all(user_id).await?;
        tracing::info!(%user_id, revoked, "all sessions revoked");
        Ok(revoked)
    }

    pub async fn get_active_sessions(&self, user_id: UserId) -> Result<Vec<Session>, AppError> {
        self.store.list_active(user_id, Utc::now()).await
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<u64, AppError> {
        self.store.delete_expired(Utc::now()).await
    }

    /// Advisory report; nothing here blocks a request.
    pub async fn find_suspicious_sessions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SuspiciousSession>, AppError> {
        let sessions = self.get_active_sessions(user_id).await?;
        Ok(sessions
            .iter()
            .filter_map(|session| {
                let reasons = self.assess(session);
                (!reasons.is_empty()).then(|| SuspiciousSession {
                    session_id: session.id,
                    reasons,
                })
            })
            .collect())
    }

    pub fn assess(&self, session: &Session) -> Vec<SuspicionReason> {
        let mut reasons = Vec::new();
        if let Some(location) = &session.location {
            let country = location.country.trim().to_ascii_uppercase();
            if self.suspicious_countries.iter().any(|c| *c == country) {
                reasons.push(SuspicionReason::DeniedCountry);
            }
        }
        let agent = session.device_info.user_agent.to_ascii_lowercase();
        if AUTOMATION_MARKERS.iter().any(|marker| agent.contains(marker)) {
            reasons.push(SuspicionReason::AutomatedUserAgent);
        }
        if UNUSUAL_HOURS.contains(&local_hour(session.created_at, &self.time_zone)) {
            reasons.push(SuspicionReason::UnusualHour);
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemoryStore;
    use crate::models::signing_key::SigningKey;
    use chrono::{TimeZone, Timelike};

    fn manager_with(config: Config) -> SessionManager {
        let mut key: SigningKey = KeyManager::generate();
        key.is_active = true;
        let keys = Arc::new(KeyManager::new(vec![key], None, None));
        SessionManager::new(Arc::new(InMemoryStore::new()), keys, &config)
    }

    fn manager() -> SessionManager {
        manager_with(Config::default())
    }

    fn device(agent: &str) -> DeviceInfo {
        DeviceInfo {
            user_agent: agent.into(),
            ip: "203.0.113.9".into(),
            ..DeviceInfo::default()
        }
    }

    #[tokio::test]
    async fn created_session_is_bound_to_refresh_token() {
        let manager = manager();
        let user_id = UserId::new();
        let issued = manager
            .create_session(user_id, &device("Mozilla/5.0"), None)
            .await
            .expect("create");

        let claims = manager.keys.verify_refresh(&issued.refresh_token).expect("verify");
        assert_eq!(claims.session_id().expect("sid"), Some(issued.session.id));
        assert_eq!(claims.jti, issued.session.refresh_jti);
        assert_eq!(
            issued.session.expires_at - issued.session.created_at,
            Duration::days(7)
        );
        assert_eq!(
            issued.session.device_fingerprint,
            device_fingerprint(&device("Mozilla/5.0"))
        );
    }

    #[tokio::test]
    async fn sixth_session_evicts_the_oldest() {
        let manager = manager();
        let user_id = UserId::new();
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(
                manager
                    .create_session(user_id, &device("ua"), None)
                    .await
                    .expect("create"),
            );
        }
        let sixth = manager
            .create_session(user_id, &device("ua"), None)
            .await
            .expect("create");
        assert_eq!(sixth.evicted, vec![created[0].session.id]);

        let active = manager.get_active_sessions(user_id).await.expect("list");
        assert_eq!(active.len(), 5);
        assert!(active.iter().all(|s| s.id != created[0].session.id));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_reuse() {
        let manager = manager();
        let issued = manager
            .create_session(UserId::new(), &device("ua"), None)
            .await
            .expect("create");

        let rotated = manager
            .refresh_session(&issued.refresh_token)
            .await
            .expect("refresh");
        assert_eq!(rotated.session.id, issued.session.id);
        assert_ne!(rotated.refresh_token, issued.refresh_token);

        let reuse = manager.refresh_session(&issued.refresh_token).await;
        assert!(matches!(reuse, Err(AppError::Unauthorized(_))));

        // Reuse revokes the session, so even the latest token is dead now.
        let after = manager.refresh_session(&rotated.refresh_token).await;
        assert!(matches!(after, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn revoked_session_cannot_refresh() {
        let manager = manager();
        let issued = manager
            .create_session(UserId::new(), &device("ua"), None)
            .await
            .expect("create");
        assert!(manager.revoke_session(issued.session.id).await.expect("revoke"));
        assert!(manager.revoke_session(issued.session.id).await.expect("idempotent"));
        assert!(manager.refresh_session(&issued.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn revoke_all_other_sessions_keeps_current() {
        let manager = manager();
        let user_id = UserId::new();
        let current = manager
            .create_session(user_id, &device("ua"), None)
            .await
            .expect("create");
        for _ in 0..2 {
            manager
                .create_session(user_id, &device("ua"), None)
                .await
                .expect("create");
        }
        let revoked = manager
            .revoke_all_other_sessions(user_id, current.session.id)
            .await
            .expect("revoke");
        assert_eq!(revoked, 2);
        let active = manager.get_active_sessions(user_id).await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, current.session.id);

        assert_eq!(manager.revoke_all_sessions(user_id).await.expect("revoke"), 1);
        assert_eq!(manager.cleanup_expired_sessions().await.expect("cleanup"), 3);
    }

    #[tokio::test]
    async fn unbound_refresh_token_is_rejected() {
        let manager = manager();
        let claims = RefreshClaims::new(UserId::new(), None, Duration::days(1));
        let token = manager.keys.sign_refresh(&claims).expect("sign");
        assert!(matches!(
            manager.refresh_session(&token).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn suspicious_sessions_report_reasons() {
        let config = Config {
            suspicious_countries: vec!["KP".into()],
            ..Config::default()
        };
        let manager = manager_with(config);
        let issued = manager
            .create_session(
                UserId::new(),
                &device("HeadlessChrome/120"),
                Some(Location {
                    country: "kp".into(),
                    ..Location::default()
                }),
            )
            .await
            .expect("create");

        let reasons = manager.assess(&issued.session);
        assert!(reasons.contains(&SuspicionReason::DeniedCountry));
        assert!(reasons.contains(&SuspicionReason::AutomatedUserAgent));

        let report = manager
            .find_suspicious_sessions(issued.session.user_id)
            .await
            .expect("report");
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].session_id, issued.session.id);
    }

    #[test]
    fn unusual_hour_uses_local_time() {
        let manager = manager_with(Config {
            time_zone: chrono_tz::Asia::Tokyo,
            ..Config::default()
        });
        let mut session = Session {
            id: SessionId::new(),
            user_id: UserId::new(),
            device_fingerprint: "fp".into(),
            device_info: Json(device("Mozilla/5.0")),
            location: None,
            refresh_jti: "jti".into(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap(),
            last_active_at: Utc::now(),
            expires_at: Utc::now(),
            is_active: true,
        };
        // 18:00 UTC is 03:00 in Tokyo.
        assert_eq!(manager.assess(&session), vec![SuspicionReason::UnusualHour]);

        session.created_at = session.created_at.with_hour(3).unwrap();
        assert!(manager.assess(&session).is_empty());
    }
}
