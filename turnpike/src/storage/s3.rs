//! S3 backend (and S3-compatible stores via endpoint override).
//!
//! User metadata rides on S3 object metadata, so the envelope markers
//! survive without sidecar objects. Puts are single PUTs and therefore
//! atomic; concurrent writers to one key are last-writer-wins.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::collections::HashMap;

use super::{BlobStore, ObjectInfo, ObjectMeta, validate_key};
use crate::db::errors::{DbError, Result};

pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    pub async fn connect(bucket: String, prefix: Option<String>, region: Option<String>, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            // S3-compatible stores (MinIO, localstack) need path-style keys
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix,
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{key}", prefix.trim_end_matches('/')),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> Result<ObjectInfo> {
        validate_key(key)?;
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .content_type(&meta.content_type)
            .set_metadata(if meta.metadata.is_empty() {
                None
            } else {
                Some(meta.metadata)
            })
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("s3 put_object: {e}")))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            stored_bytes: size,
        })
    }

    async fn get(&self, key: &str) -> Result<(Bytes, ObjectMeta)> {
        validate_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    DbError::NotFound
                } else {
                    DbError::Other(anyhow::anyhow!("s3 get_object: {service_err}"))
                }
            })?;

        let content_type = output.content_type().unwrap_or("application/octet-stream").to_string();
        let metadata: HashMap<String, String> = output.metadata().cloned().unwrap_or_default();

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("s3 body read: {e}")))?
            .into_bytes();

        Ok((
            data,
            ObjectMeta {
                content_type,
                metadata,
            },
        ))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        // DeleteObject on a missing key succeeds, which keeps the TTL
        // sweeper idempotent for free
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| DbError::Other(anyhow::anyhow!("s3 delete_object: {e}")))?;
        Ok(())
    }
}
