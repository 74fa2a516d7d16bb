//! Blob storage backends behind a common `BlobStore` trait.
//!
//! Two backends ship: a local filesystem store (temp-file + rename for
//! atomicity, `.meta` sidecars) and S3 (metadata via object metadata).
//! Either can be wrapped in the AES-GCM envelope from [`envelope`], which
//! encrypts on put and transparently decrypts on get.
//!
//! Keys are caller-chosen relative paths; every backend rejects traversal.

pub mod envelope;
pub mod local;
pub mod s3;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;

use crate::config::{FileStorageConfig, StorageBackendConfig};
use crate::db::errors::{DbError, Result};

/// User-visible object attributes stored alongside the blob.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// Outcome of a put: the key as stored and the stored (possibly padded or
/// encrypted) byte length.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub stored_bytes: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<ObjectInfo>;
    async fn get(&self, key: &str) -> Result<(Bytes, ObjectMeta)>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Reject keys that could escape the store's root.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && !key.contains('\\')
        && !key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if valid {
        Ok(())
    } else {
        Err(DbError::Other(anyhow::anyhow!("invalid storage key: {key:?}")))
    }
}

/// Fresh storage key for a blob: two-character fan-out directory plus uuid,
/// mirroring how content-addressed stores avoid giant flat directories.
pub fn fresh_key() -> String {
    let id = uuid::Uuid::new_v4();
    let hex = id.simple().to_string();
    format!("{}/{id}.dat", &hex[..2])
}

/// Build the configured backend, wrapping it in the encryption envelope
/// when a key is configured.
pub async fn create_blob_store(config: &FileStorageConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    let inner: Arc<dyn BlobStore> = match &config.backend {
        StorageBackendConfig::Local { path } => {
            tracing::info!("creating local blob store (path: {path:?})");
            tokio::fs::create_dir_all(path).await?;
            Arc::new(local::LocalStore::new(path.clone()))
        }
        StorageBackendConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => {
            tracing::info!("creating s3 blob store (bucket: {bucket})");
            Arc::new(s3::S3Store::connect(bucket.clone(), prefix.clone(), region.clone(), endpoint.clone()).await)
        }
    };

    match &config.encryption_key {
        Some(encoded) => {
            let key_bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| anyhow::anyhow!("file_storage.encryption_key is not valid base64"))?;
            let cipher = envelope::EnvelopeCipher::new(&key_bytes)?;
            tracing::info!("blob envelope encryption enabled ({} bit key)", key_bytes.len() * 8);
            Ok(Arc::new(envelope::EncryptedStore::new(inner, cipher)))
        }
        None => Ok(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_rejects_traversal() {
        assert!(validate_key("ab/file.dat").is_ok());
        assert!(validate_key("deep/nested/key.bin").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("ok/../escape").is_err());
        assert!(validate_key("trailing/").is_err());
        assert!(validate_key("back\\slash").is_err());
        assert!(validate_key("dot/./segment").is_err());
    }

    #[test]
    fn test_fresh_key_shape() {
        let key = fresh_key();
        assert!(validate_key(&key).is_ok());
        let (dir, rest) = key.split_once('/').unwrap();
        assert_eq!(dir.len(), 2);
        assert!(rest.ends_with(".dat"));
    }
}
