pub mod encryption;
pub mod fingerprint;
pub mod jwt;
pub mod matcher;
pub mod mfa;
pub mod password;
pub mod security;
pub mod time;

pub use encryption::{AesGcmCipher, SecretCipher};
pub use fingerprint::device_fingerprint;
pub use jwt::*;
pub use matcher::{BiometricMatcher, EditDistanceMatcher};
pub use password::*;
pub use time::*;
