//! Local filesystem backend.
//!
//! Blobs are written to a temp file and renamed into place so readers never
//! observe a partial object. A `.meta` sidecar carries the content type and
//! user metadata.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BlobStore, ObjectInfo, ObjectMeta, validate_key};
use crate::db::errors::{DbError, Result};

#[derive(Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
    metadata: HashMap<String, String>,
}

pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.meta"))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<ObjectInfo> {
        validate_key(key)?;
        let final_path = self.blob_path(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await.map_err(anyhow::Error::from)?;
        }

        // temp + rename keeps concurrent readers off partial writes;
        // concurrent puts to the same key are last-writer-wins
        let temp_path = self.base_path.join(format!("{key}.tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path).await.map_err(anyhow::Error::from)?;
        file.write_all(&data).await.map_err(anyhow::Error::from)?;
        file.sync_all().await.map_err(anyhow::Error::from)?;
        drop(file);

        let sidecar = Sidecar {
            content_type: meta.content_type,
            size: data.len() as u64,
            metadata: meta.metadata,
        };
        let sidecar_json = serde_json::to_vec(&sidecar).map_err(anyhow::Error::from)?;
        fs::write(self.meta_path(key), sidecar_json).await.map_err(anyhow::Error::from)?;

        fs::rename(&temp_path, &final_path).await.map_err(anyhow::Error::from)?;

        Ok(ObjectInfo {
            key: key.to_string(),
            stored_bytes: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<(Bytes, ObjectMeta)> {
        validate_key(key)?;
        let data = match fs::read(self.blob_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(DbError::NotFound),
            Err(e) => return Err(DbError::Other(e.into())),
        };

        let meta = match fs::read(self.meta_path(key)).await {
            Ok(raw) => {
                let sidecar: Sidecar = serde_json::from_slice(&raw).map_err(anyhow::Error::from)?;
                ObjectMeta {
                    content_type: sidecar.content_type,
                    metadata: sidecar.metadata,
                }
            }
            // A blob without a sidecar is readable, just untyped
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectMeta::default(),
            Err(e) => return Err(DbError::Other(e.into())),
        };

        Ok((Bytes::from(data), meta))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        for path in [self.blob_path(key), self.meta_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DbError::Other(e.into())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    fn meta(content_type: &str) -> ObjectMeta {
        ObjectMeta {
            content_type: content_type.to_string(),
            metadata: HashMap::from([("origin".to_string(), "test".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store();
        let body = Bytes::from_static(b"line one\nline two\n");

        let info = store.put("ab/blob.dat", body.clone(), meta("application/jsonl")).await.unwrap();
        assert_eq!(info.stored_bytes, body.len() as u64);

        let (read, read_meta) = store.get("ab/blob.dat").await.unwrap();
        assert_eq!(read, body);
        assert_eq!(read_meta.content_type, "application/jsonl");
        assert_eq!(read_meta.metadata.get("origin").map(String::as_str), Some("test"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.get("ab/missing.dat").await, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store.put("ab/blob.dat", Bytes::from_static(b"x"), ObjectMeta::default()).await.unwrap();
        store.delete("ab/blob.dat").await.unwrap();
        // Re-running on an already-deleted key must be safe
        store.delete("ab/blob.dat").await.unwrap();
        assert!(matches!(store.get("ab/blob.dat").await, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn test_overwrite_is_last_writer_wins() {
        let (_dir, store) = store();
        store.put("ab/blob.dat", Bytes::from_static(b"first"), ObjectMeta::default()).await.unwrap();
        store.put("ab/blob.dat", Bytes::from_static(b"second"), ObjectMeta::default()).await.unwrap();
        let (read, _) = store.get("ab/blob.dat").await.unwrap();
        assert_eq!(read, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_traversal_key_rejected() {
        let (_dir, store) = store();
        assert!(store.put("../escape.dat", Bytes::new(), ObjectMeta::default()).await.is_err());
    }
}
