//! Object store backends for chunk payloads and manifests
//!
//! Keys are `/`-separated paths such as `bundles/<id>/chunks/00003.gz`.
//! `put` is a single atomic write: a reader sees either the whole object or
//! nothing. `delete` of a missing key succeeds.

mod local;
mod memory;
#[cfg(feature = "cloud")]
mod s3;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "cloud")]
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{BundlecastError, Result};

pub const CONTENT_TYPE_CHUNK: &str = "application/gzip";
pub const CONTENT_TYPE_MANIFEST: &str = "application/json";

/// Attributes stored alongside an object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(content_type: &str) -> Self {
        Self {
            content_type: content_type.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, meta: ObjectMeta) -> Result<()>;

    /// Fetch an object; `NotFound` when absent
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// Open a backend from a location string.
///
/// `memory://` gives an in-process store, `s3://bucket/prefix` the S3 backend
/// (with the `cloud` feature), anything else is treated as a local directory.
pub async fn open(location: &str) -> Result<SharedObjectStore> {
    if location == "memory://" {
        return Ok(Arc::new(MemoryObjectStore::new()));
    }

    if location.starts_with("s3://") {
        #[cfg(feature = "cloud")]
        {
            return Ok(Arc::new(S3ObjectStore::from_uri(location).await?));
        }
        #[cfg(not(feature = "cloud"))]
        {
            return Err(BundlecastError::Config(
                "s3:// object stores require the `cloud` feature".to_string(),
            ));
        }
    }

    let root = shellexpand::tilde(location).to_string();
    Ok(Arc::new(LocalObjectStore::new(root).await?))
}

/// Reject keys that could escape a directory-backed store
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(BundlecastError::InvalidInput(format!(
            "Invalid object key: {:?}",
            key
        )));
    }
    Ok(())
}

/// Key of a chunk payload
pub fn chunk_key(bundle_id: &str, index: u32) -> String {
    format!("bundles/{}/chunks/{:05}.gz", bundle_id, index)
}

/// Key of a published manifest
pub fn manifest_key(bundle_id: &str) -> String {
    format!("bundles/{}/manifest.json", bundle_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("bundles/b1/chunks/00000.gz").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("bundles/../etc").is_err());
        assert!(validate_key("a//b").is_err());
    }

    #[test]
    fn test_keys() {
        assert_eq!(chunk_key("b1", 3), "bundles/b1/chunks/00003.gz");
        assert_eq!(manifest_key("b1"), "bundles/b1/manifest.json");
    }

    #[tokio::test]
    async fn test_open_memory() {
        let store = open("memory://").await.unwrap();
        assert_eq!(store.name(), "memory");
        assert!(!store.exists("a/b").await.unwrap());
    }
}
