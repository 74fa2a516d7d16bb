//! AES-GCM envelope encryption for blobs.
//!
//! On put, the plaintext is sealed with a random 12-byte nonce and stored
//! as `nonce || ciphertext`; metadata gains `blob-encryption=aes-gcm` and
//! `blob-nonce=<base64>`. On get, the metadata marker selects decryption,
//! so a store can hold a mix of encrypted and plain objects.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::aead::consts::U12;
use aes_gcm::{Aes128Gcm, AesGcm, Aes256Gcm, KeyInit, Nonce};

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::sync::Arc;

use super::{BlobStore, ObjectInfo, ObjectMeta};
use crate::db::errors::{DbError, Result};

pub const ENCRYPTION_META_KEY: &str = "blob-encryption";
pub const ENCRYPTION_META_VALUE: &str = "aes-gcm";
pub const NONCE_META_KEY: &str = "blob-nonce";

const NONCE_LEN: usize = 12;

/// Cipher over the three AES-GCM key sizes.
#[derive(Clone)]
pub enum EnvelopeCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl EnvelopeCipher {
    pub fn new(key: &[u8]) -> anyhow::Result<Self> {
        match key.len() {
            16 => Ok(EnvelopeCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).expect("length checked"),
            ))),
            24 => Ok(EnvelopeCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).expect("length checked"),
            ))),
            32 => Ok(EnvelopeCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).expect("length checked"),
            ))),
            other => anyhow::bail!("AES key must be 16, 24, or 32 bytes, got {other}"),
        }
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload::from(plaintext);
        let sealed = match self {
            EnvelopeCipher::Aes128(cipher) => cipher.encrypt(nonce, payload),
            EnvelopeCipher::Aes192(cipher) => cipher.encrypt(nonce, payload),
            EnvelopeCipher::Aes256(cipher) => cipher.encrypt(nonce, payload),
        };
        sealed.map_err(|_| anyhow::anyhow!("AES-GCM encryption failed"))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let payload = Payload::from(ciphertext);
        let opened = match self {
            EnvelopeCipher::Aes128(cipher) => cipher.decrypt(nonce, payload),
            EnvelopeCipher::Aes192(cipher) => cipher.decrypt(nonce, payload),
            EnvelopeCipher::Aes256(cipher) => cipher.decrypt(nonce, payload),
        };
        opened.map_err(|_| anyhow::anyhow!("AES-GCM decryption failed (wrong key or corrupt blob)"))
    }
}

pub struct EncryptedStore {
    inner: Arc<dyn BlobStore>,
    cipher: EnvelopeCipher,
}

impl EncryptedStore {
    pub fn new(inner: Arc<dyn BlobStore>, cipher: EnvelopeCipher) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl BlobStore for EncryptedStore {
    async fn put(&self, key: &str, data: Bytes, mut meta: ObjectMeta) -> Result<ObjectInfo> {
        let mut nonce = [0u8; NONCE_LEN];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self.cipher.seal(&nonce, &data).map_err(DbError::Other)?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);

        meta.metadata
            .insert(ENCRYPTION_META_KEY.to_string(), ENCRYPTION_META_VALUE.to_string());
        meta.metadata.insert(NONCE_META_KEY.to_string(), BASE64.encode(nonce));

        self.inner.put(key, Bytes::from(payload), meta).await
    }

    async fn get(&self, key: &str) -> Result<(Bytes, ObjectMeta)> {
        let (payload, meta) = self.inner.get(key).await?;

        // Plain objects pass through untouched
        if meta.metadata.get(ENCRYPTION_META_KEY).map(String::as_str) != Some(ENCRYPTION_META_VALUE) {
            return Ok((payload, meta));
        }
        if payload.len() < NONCE_LEN {
            return Err(DbError::Other(anyhow::anyhow!("encrypted blob shorter than its nonce")));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self.cipher.open(nonce, ciphertext).map_err(DbError::Other)?;
        Ok((Bytes::from(plaintext), meta))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStore;

    fn encrypted_store(key_len: usize) -> (tempfile::TempDir, EncryptedStore) {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(LocalStore::new(dir.path().to_path_buf()));
        let cipher = EnvelopeCipher::new(&vec![7u8; key_len]).unwrap();
        (dir, EncryptedStore::new(inner, cipher))
    }

    #[tokio::test]
    async fn test_round_trip_all_key_sizes() {
        for key_len in [16, 24, 32] {
            let (_dir, store) = encrypted_store(key_len);
            let body = Bytes::from_static(b"sensitive payload bytes");
            store.put("ab/secret.dat", body.clone(), ObjectMeta::default()).await.unwrap();
            let (read, meta) = store.get("ab/secret.dat").await.unwrap();
            assert_eq!(read, body, "key size {key_len}");
            assert_eq!(
                meta.metadata.get(ENCRYPTION_META_KEY).map(String::as_str),
                Some(ENCRYPTION_META_VALUE)
            );
            assert!(meta.metadata.contains_key(NONCE_META_KEY));
        }
    }

    #[tokio::test]
    async fn test_stored_payload_is_nonce_prefixed_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(LocalStore::new(dir.path().to_path_buf()));
        let store = EncryptedStore::new(inner.clone(), EnvelopeCipher::new(&[7u8; 32]).unwrap());

        let body = Bytes::from_static(b"plaintext");
        store.put("ab/secret.dat", body.clone(), ObjectMeta::default()).await.unwrap();

        // Reading through the raw inner store must NOT yield plaintext
        let (raw, meta) = inner.get("ab/secret.dat").await.unwrap();
        assert_ne!(raw, body);
        // nonce (12) + ciphertext (len + 16-byte tag)
        assert_eq!(raw.len(), 12 + body.len() + 16);
        let nonce_b64 = meta.metadata.get(NONCE_META_KEY).unwrap();
        assert_eq!(BASE64.decode(nonce_b64).unwrap(), raw[..12].to_vec());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(LocalStore::new(dir.path().to_path_buf()));
        let writer = EncryptedStore::new(inner.clone(), EnvelopeCipher::new(&[1u8; 32]).unwrap());
        let reader = EncryptedStore::new(inner, EnvelopeCipher::new(&[2u8; 32]).unwrap());

        writer.put("ab/secret.dat", Bytes::from_static(b"x"), ObjectMeta::default()).await.unwrap();
        assert!(reader.get("ab/secret.dat").await.is_err());
    }

    #[tokio::test]
    async fn test_bad_key_length_rejected() {
        assert!(EnvelopeCipher::new(&[0u8; 20]).is_err());
    }
}
