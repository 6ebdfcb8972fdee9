use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String, // user_id
    pub email: Option<String>,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Single-use token identifier.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn new(user_id: UserId, email: Option<String>, role: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            email,
            role: role.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }
}

impl RefreshClaims {
    pub fn new(user_id: UserId, session_id: Option<SessionId>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            session_id: session_id.map(|id| id.to_string()),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }

    pub fn user_id(&self) -> anyhow::Result<UserId> {
        self.sub
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid subject in refresh token: {}", e))
    }

    pub fn session_id(&self) -> anyhow::Result<Option<SessionId>> {
        self.session_id
            .as_deref()
            .map(|raw| raw.parse::<SessionId>())
            .transpose()
            .map_err(|e| anyhow::anyhow!("Invalid session id in refresh token: {}", e))
    }
}

/// Signs `claims` with HS256, embedding `kid` in the header when given.
pub fn encode_token<T: Serialize>(claims: &T, kid: Option<&str>, secret: &str) -> anyhow::Result<String> {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = kid.map(str::to_string);
    let token = encode(&header, claims, &EncodingKey::from_secret(secret.as_ref()))?;
    Ok(token)
}

/// Verifies signature and expiry and returns the claims.
pub fn decode_token<T: DeserializeOwned>(token: &str, secret: &str) -> anyhow::Result<T> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let token_data = decode::<T>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &validation,
    )?;

    Ok(token_data.claims)
}

/// Reads the `kid` header without verifying the token.
pub fn token_kid(token: &str) -> Option<String> {
    decode_header(token).ok().and_then(|header| header.kid)
}
