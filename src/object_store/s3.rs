//! S3-compatible object store (S3, R2, MinIO)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use super::{validate_key, ObjectMeta, ObjectStore};
use crate::error::{BundlecastError, Result};

pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Create from an `s3://bucket[/prefix]` URI
    pub async fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| BundlecastError::Config("URI must start with s3://".to_string()))?;

        let mut parts = rest.splitn(2, '/');
        let bucket = parts.next().unwrap_or_default().to_string();
        if bucket.is_empty() {
            return Err(BundlecastError::Config(
                "URI must be s3://bucket[/prefix]".to_string(),
            ));
        }
        let prefix = parts
            .next()
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_default();

        // Credentials and region come from the environment
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = S3Client::new(&config);

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn full_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        if self.prefix.is_empty() {
            Ok(key.to_string())
        } else {
            Ok(format!("{}/{}", self.prefix, key))
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>, meta: ObjectMeta) -> Result<()> {
        let full_key = self.full_key(key)?;
        let size = data.len();

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data));
        if !meta.content_type.is_empty() {
            request = request.content_type(meta.content_type);
        }
        for (k, v) in meta.metadata {
            request = request.metadata(k, v);
        }

        request
            .send()
            .await
            .map_err(|e| BundlecastError::ObjectStore(e.to_string()))?;

        tracing::info!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, full_key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key)?;
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(BundlecastError::not_found("object", key));
                }
                return Err(BundlecastError::ObjectStore(service_error.to_string()));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BundlecastError::ObjectStore(e.to_string()))?
            .into_bytes();

        Ok(data.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| BundlecastError::ObjectStore(e.to_string()))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(BundlecastError::ObjectStore(service_error.to_string()))
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}
