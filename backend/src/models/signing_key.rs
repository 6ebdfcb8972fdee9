//! JWT signing material identified by `kid`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::mask_secret;

/// Which half of a key pair a token is signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Access,
    Refresh,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A pair of HMAC secrets published under a single key identifier.
pub struct SigningKey {
    /// Key identifier carried in the JWT header.
    pub kid: String,
    /// Secret for access tokens.
    pub access_secret: String,
    /// Secret for refresh tokens. Must differ from `access_secret`.
    pub refresh_secret: String,
    /// When the key was minted.
    pub created_at: DateTime<Utc>,
    /// Whether new tokens are signed with this key.
    #[serde(default)]
    pub is_active: bool,
}

impl SigningKey {
    pub fn secret(&self, purpose: KeyPurpose) -> &str {
        match purpose {
            KeyPurpose::Access => &self.access_secret,
            KeyPurpose::Refresh => &self.refresh_secret,
        }
    }

    /// Returns a copy of this key that is kept for verification only.
    pub fn demoted(&self) -> Self {
        Self {
            is_active: false,
            ..self.clone()
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("access_secret", &mask_secret(&self.access_secret))
            .field("refresh_secret", &mask_secret(&self.refresh_secret))
            .field("created_at", &self.created_at)
            .field("is_active", &self.is_active)
            .finish()
    }
}
