use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::Config;

const NONCE_LENGTH: usize = 12;
const ENVELOPE_PREFIX: &str = "enc:v1";

/// Authenticated encryption for material stored at rest (biometric templates, 2FA seeds).
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, stored: &str) -> Result<String>;
}

/// AES-256-GCM with a random 96-bit nonce per message.
#[derive(Clone)]
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl AesGcmCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Uses `TEMPLATE_ENCRYPTION_KEY` when configured, otherwise derives a key
    /// from the legacy or first configured signing secret.
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Some(hex_key) = &config.template_encryption_key {
            let bytes = hex::decode(hex_key).map_err(|_| anyhow!("Invalid encryption key"))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow!("Encryption key must be 32 bytes"))?;
            return Ok(Self::new(key));
        }

        let seed = config
            .legacy_access_secret
            .as_deref()
            .or_else(|| config.signing_keys.first().map(|k| k.access_secret.as_str()))
            .ok_or_else(|| anyhow!("No key material available for at-rest encryption"))?;
        Ok(Self::new(derive_key(seed)))
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| anyhow!("Invalid encryption key"))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| anyhow!("Encryption failed"))?;

        Ok(format!(
            "{}:{}:{}",
            ENVELOPE_PREFIX,
            STANDARD_NO_PAD.encode(nonce_bytes),
            STANDARD_NO_PAD.encode(ciphertext)
        ))
    }

    fn decrypt(&self, stored: &str) -> Result<String> {
        let mut parts = stored.splitn(4, ':');
        let prefix = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        if prefix != "enc" || version != "v1" {
            return Err(anyhow!("Unsupported ciphertext envelope"));
        }
        let nonce_part = parts.next().ok_or_else(|| anyhow!("Missing nonce"))?;
        let cipher_part = parts
            .next()
            .ok_or_else(|| anyhow!("Missing ciphertext payload"))?;

        let nonce_bytes = STANDARD_NO_PAD
            .decode(nonce_part)
            .map_err(|_| anyhow!("Invalid nonce encoding"))?;
        if nonce_bytes.len() != NONCE_LENGTH {
            return Err(anyhow!("Invalid nonce length"));
        }
        let ciphertext = STANDARD_NO_PAD
            .decode(cipher_part)
            .map_err(|_| anyhow!("Invalid ciphertext encoding"))?;

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| anyhow!("Invalid decryption key"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| anyhow!("Decryption failed"))?;
        String::from_utf8(plaintext).map_err(|_| anyhow!("Decrypted data is not UTF-8"))
    }
}

fn derive_key(seed: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"gatekeeper|at-rest|");
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new(derive_key("a_secure_token_that_is_long_enough_123"))
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("template-bytes").expect("encrypt");
        assert!(encrypted.starts_with("enc:v1:"));
        assert_eq!(cipher.decrypt(&encrypted).expect("decrypt"), "template-bytes");
    }

    #[test]
    fn nonces_make_ciphertexts_distinct() {
        let cipher = cipher();
        let a = cipher.encrypt("same").expect("encrypt");
        let b = cipher.encrypt("same").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = cipher();
        let encrypted = cipher.encrypt("payload").expect("encrypt");
        let mut tampered = encrypted.clone();
        let last = tampered.pop().expect("char");
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn plaintext_is_not_accepted() {
        assert!(cipher().decrypt("legacy").is_err());
    }

    #[test]
    fn from_config_prefers_explicit_key() {
        let config = Config {
            template_encryption_key: Some("11".repeat(32)),
            ..Config::default()
        };
        let cipher = AesGcmCipher::from_config(&config).expect("cipher");
        assert_eq!(cipher.key, [0x11u8; 32]);
    }

    #[test]
    fn from_config_requires_key_material() {
        assert!(AesGcmCipher::from_config(&Config::default()).is_err());
    }
}
