//! Cryptographic utilities: API key generation and secret envelope encryption.
//!
//! API keys are issued as `sk-<prefix>.<secret>` where the prefix is a
//! 10-character public identifier used for lookup and the secret carries 256
//! bits of entropy. Only the Argon2id hash of the secret is persisted.
//!
//! Catalog entries store upstream provider credentials encrypted with
//! AES-256-GCM under a key derived from the configured `secret_key`.

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use base64::{Engine as _, engine::general_purpose};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

use crate::errors::Error;

/// Length of the public key prefix.
pub const KEY_PREFIX_LEN: usize = 10;

const NONCE_LEN: usize = 12;

/// A freshly generated API key: the full token is shown to the caller once,
/// the prefix is persisted for lookup, and the secret is hashed.
pub struct GeneratedKey {
    pub token: String,
    pub prefix: String,
    pub secret: String,
}

/// Generates an API key with a 10-character prefix and 256 bits of secret
/// entropy, formatted as `sk-<prefix>.<secret>`.
pub fn generate_api_key() -> GeneratedKey {
    let prefix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_PREFIX_LEN)
        .map(char::from)
        .collect();

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    let secret = general_purpose::URL_SAFE_NO_PAD.encode(secret_bytes);

    GeneratedKey {
        token: format!("sk-{prefix}.{secret}"),
        prefix,
        secret,
    }
}

/// Splits a bearer credential of the form `sk-<prefix>.<secret>`.
///
/// Returns `None` when the shape is wrong (missing scheme, short prefix,
/// empty secret) so callers can fail with a uniform `unauthorized`.
pub fn split_api_key(token: &str) -> Option<(&str, &str)> {
    let rest = token.strip_prefix("sk-")?;
    let (prefix, secret) = rest.split_once('.')?;
    if prefix.len() != KEY_PREFIX_LEN || secret.is_empty() {
        return None;
    }
    Some((prefix, secret))
}

/// AES-256-GCM envelope for provider credentials at rest.
///
/// The wire form is `base64(nonce || ciphertext)`; the key is
/// `SHA-256(secret_key)` so operators can supply passphrases of any length.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn new(secret_key: &str) -> Self {
        let digest = Sha256::digest(secret_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest).expect("SHA-256 digest is a valid AES-256 key");
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload::from(plaintext.as_bytes()))
            .map_err(|_| Error::Internal {
                operation: "encrypt secret".to_string(),
            })?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, Error> {
        let payload = general_purpose::STANDARD.decode(encoded).map_err(|_| Error::Internal {
            operation: "decode secret ciphertext".to_string(),
        })?;
        if payload.len() < NONCE_LEN {
            return Err(Error::Internal {
                operation: "decrypt secret: payload too short".to_string(),
            });
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self.cipher.decrypt(nonce, ciphertext).map_err(|_| Error::Internal {
            operation: "decrypt secret".to_string(),
        })?;

        String::from_utf8(plaintext).map_err(|_| Error::Internal {
            operation: "decode secret plaintext".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_api_key_format() {
        let key = generate_api_key();

        assert!(key.token.starts_with("sk-"));
        // "sk-" + prefix (10) + "." + base64url(32 bytes) (43)
        assert_eq!(key.token.len(), 3 + KEY_PREFIX_LEN + 1 + 43);
        assert_eq!(key.prefix.len(), KEY_PREFIX_LEN);
        assert!(key.prefix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!key.secret.contains('='));
    }

    #[test]
    fn test_generated_key_round_trips_through_split() {
        let key = generate_api_key();
        let (prefix, secret) = split_api_key(&key.token).unwrap();
        assert_eq!(prefix, key.prefix);
        assert_eq!(secret, key.secret);
    }

    #[test]
    fn test_split_rejects_malformed_tokens() {
        assert!(split_api_key("").is_none());
        assert!(split_api_key("sk-short.secret").is_none());
        assert!(split_api_key("sk-abcdefghij").is_none());
        assert!(split_api_key("sk-abcdefghij.").is_none());
        assert!(split_api_key("pk-abcdefghij.secret").is_none());
    }

    #[test]
    fn test_generate_api_key_uniqueness() {
        let mut prefixes = HashSet::new();
        for _ in 0..100 {
            let key = generate_api_key();
            assert!(prefixes.insert(key.token), "Generated duplicate API key");
        }
    }

    #[test]
    fn test_secret_box_round_trip() {
        let secret_box = SecretBox::new("unit-test-master-key");
        let ciphertext = secret_box.encrypt("upstream-provider-credential").unwrap();
        assert_ne!(ciphertext, "upstream-provider-credential");
        assert_eq!(secret_box.decrypt(&ciphertext).unwrap(), "upstream-provider-credential");
    }

    #[test]
    fn test_secret_box_nonces_differ() {
        let secret_box = SecretBox::new("unit-test-master-key");
        let a = secret_box.encrypt("same").unwrap();
        let b = secret_box.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_secret_box_rejects_wrong_key() {
        let ciphertext = SecretBox::new("key-a").encrypt("payload").unwrap();
        assert!(SecretBox::new("key-b").decrypt(&ciphertext).is_err());
    }
}
