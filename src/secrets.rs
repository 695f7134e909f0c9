//! Decryption of sensitive deployment-config fields.
//!
//! Stored values are `base64(IV || TAG || CIPHERTEXT)` under keys prefixed
//! `encrypted_`. The AES-256-GCM key is the SHA-256 digest of the
//! configured 64-hex secret. Decryption happens once, on the resolver's
//! cache-fill path; everything downstream sees plaintext under the
//! unprefixed key.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Storage prefix marking a config field as encrypted.
pub const ENCRYPTED_PREFIX: &str = "encrypted_";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("Decryption failed")]
    Decrypt,

    #[error("Decrypted value is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Derive the AES key from the configured hex secret.
    pub fn new(encryption_key: &str) -> Self {
        let digest = Sha256::digest(encryption_key.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Decrypt one `base64(IV || TAG || CIPHERTEXT)` value.
    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretsError> {
        let raw = BASE64.decode(encoded)?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(SecretsError::TooShort(raw.len()));
        }
        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        // aes-gcm wants ciphertext || tag
        let mut payload = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        payload.extend_from_slice(ciphertext);
        payload.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(iv), payload.as_ref())
            .map_err(|_| SecretsError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }

    /// Walk a deployment config map, decrypting every `encrypted_*` string
    /// field and re-keying it without the prefix. Non-string or
    /// undecryptable values are dropped with a warning rather than
    /// poisoning the whole deployment.
    pub fn decrypt_config(
        &self,
        config: serde_json::Map<String, Value>,
    ) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::with_capacity(config.len());
        for (key, value) in config {
            match key.strip_prefix(ENCRYPTED_PREFIX) {
                Some(plain_key) => match value.as_str().map(|v| self.decrypt(v)) {
                    Some(Ok(plaintext)) => {
                        out.insert(plain_key.to_string(), Value::String(plaintext));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(field = %key, error = %e, "Dropping undecryptable config field");
                    }
                    None => {
                        tracing::warn!(field = %key, "Dropping non-string encrypted config field");
                    }
                },
                None => {
                    out.insert(key, value);
                }
            }
        }
        out
    }
}
