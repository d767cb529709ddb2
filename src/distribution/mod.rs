//! Distribution layer
//!
//! Publishes READY bundles behind the delivery boundary: public and signed
//! URLs with cache policy, origin reads, and edge invalidation. Chunk URLs
//! are cacheable forever (a chunk's bytes never change under its bundle);
//! manifest URLs get a short TTL and are purged when a bundle is superseded
//! or retired.

mod edge;
mod signing;

#[cfg(feature = "cdn")]
pub use edge::HttpEdgeCache;
pub use edge::{edge_cache_for, EdgeCache, NoopEdgeCache};
pub use signing::{generate_secret, UrlSigner};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DistributionConfig;
use crate::error::{BundlecastError, Result};
use crate::object_store::{manifest_key, SharedObjectStore};
use crate::retry::with_retry;
use crate::storage::invalidations::{self, InvalidationRecord};
use crate::storage::{bundles, Storage};
use crate::sync::ChunkSource;
use crate::types::*;

const PURGE_ATTEMPTS: u32 = 3;
const PURGE_BACKOFF_MS: u64 = 500;

/// A delivery URL with the cache policy the origin serves it under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedUrl {
    pub url: String,
    pub path: String,
    pub cache_control: String,
    /// Set for signed URLs
    pub expires_at: Option<DateTime<Utc>>,
}

/// Origin path of a manifest
pub fn manifest_path(bundle_id: &str) -> String {
    format!("/bundles/{}/manifest.json", bundle_id)
}

/// Origin path of a chunk
pub fn chunk_path(bundle_id: &str, index: u32) -> String {
    format!("/bundles/{}/chunks/{}", bundle_id, index)
}

/// Prefix purge covering everything published for a bundle
pub fn bundle_prefix(bundle_id: &str) -> String {
    format!("/bundles/{}/*", bundle_id)
}

pub struct Distributor {
    storage: Storage,
    objects: SharedObjectStore,
    edge: Arc<dyn EdgeCache>,
    signer: UrlSigner,
    config: DistributionConfig,
}

impl Distributor {
    pub fn new(
        storage: Storage,
        objects: SharedObjectStore,
        edge: Arc<dyn EdgeCache>,
        config: DistributionConfig,
    ) -> Self {
        Self {
            signer: UrlSigner::new(&config.signing_secret),
            storage,
            objects,
            edge,
            config,
        }
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// `Cache-Control` for chunk responses
    pub fn chunk_cache_control(&self) -> String {
        format!(
            "public, max-age={}, immutable",
            self.config.chunk_max_age_secs
        )
    }

    /// `Cache-Control` for manifest responses
    pub fn manifest_cache_control(&self) -> String {
        format!(
            "public, max-age={}, must-revalidate",
            self.config.manifest_max_age_secs
        )
    }

    fn ready_bundle(&self, bundle_id: &str) -> Result<Bundle> {
        let bundle = self
            .storage
            .with_connection(|conn| bundles::get_bundle(conn, bundle_id))?;
        if !bundle.is_ready() {
            return Err(BundlecastError::not_found("bundle", bundle_id));
        }
        Ok(bundle)
    }

    fn resolve(&self, bundle_id: &str, chunk_index: Option<u32>) -> Result<(String, String)> {
        let bundle = self.ready_bundle(bundle_id)?;
        match chunk_index {
            None => Ok((manifest_path(bundle_id), self.manifest_cache_control())),
            Some(index) if (index as usize) < bundle.chunks.len() => {
                Ok((chunk_path(bundle_id, index), self.chunk_cache_control()))
            }
            Some(index) => Err(BundlecastError::not_found(
                "chunk",
                format!("{}/{}", bundle_id, index),
            )),
        }
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Public URL of a manifest (`chunk_index = None`) or chunk
    pub fn url_for(&self, bundle_id: &str, chunk_index: Option<u32>) -> Result<PublishedUrl> {
        let (path, cache_control) = self.resolve(bundle_id, chunk_index)?;
        Ok(PublishedUrl {
            url: self.absolute(&path),
            path,
            cache_control,
            expires_at: None,
        })
    }

    /// Time-limited URL; `expires_in` defaults to the configured TTL
    pub fn signed_url_for(
        &self,
        bundle_id: &str,
        chunk_index: Option<u32>,
        expires_in: Option<Duration>,
    ) -> Result<PublishedUrl> {
        let (path, cache_control) = self.resolve(bundle_id, chunk_index)?;
        let ttl = expires_in.unwrap_or(Duration::from_secs(self.config.signed_url_ttl_secs));
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| BundlecastError::InvalidInput(format!("Invalid expiry: {}", e)))?;
        let expires = expires_at.timestamp();
        let signature = self.signer.sign(&path, expires)?;

        Ok(PublishedUrl {
            url: format!(
                "{}?expires={}&signature={}",
                self.absolute(&path),
                expires,
                signature
            ),
            path,
            cache_control,
            expires_at: Some(expires_at),
        })
    }

    pub fn verify_signature(&self, path: &str, expires: i64, signature: &str) -> Result<()> {
        self.signer.verify(path, expires, signature)
    }

    /// Manifest bytes of a READY bundle, as stored at publication
    pub async fn manifest_bytes(&self, bundle_id: &str) -> Result<Vec<u8>> {
        self.ready_bundle(bundle_id)?;
        self.objects.get(&manifest_key(bundle_id)).await
    }

    /// Compressed chunk bytes of a READY bundle with the chunk's checksum
    pub async fn chunk_bytes(&self, bundle_id: &str, index: u32) -> Result<(Vec<u8>, String)> {
        let bundle = self.ready_bundle(bundle_id)?;
        let chunk = bundle
            .chunks
            .get(index as usize)
            .ok_or_else(|| BundlecastError::not_found("chunk", format!("{}/{}", bundle_id, index)))?;
        let bytes = self.objects.get(&chunk.storage_key).await?;
        Ok((bytes, chunk.checksum.clone()))
    }

    /// Purge everything published for a bundle
    pub async fn invalidate(&self, bundle_id: &str) -> Result<InvalidationRecord> {
        self.purge(bundle_id, vec![bundle_prefix(bundle_id)]).await
    }

    /// Purge only the manifest of a bundle
    pub async fn invalidate_manifest(&self, bundle_id: &str) -> Result<InvalidationRecord> {
        self.purge(bundle_id, vec![manifest_path(bundle_id)]).await
    }

    async fn purge(&self, bundle_id: &str, paths: Vec<String>) -> Result<InvalidationRecord> {
        self.storage
            .with_connection(|conn| bundles::get_bundle(conn, bundle_id))?;

        let provider_ref = with_retry("Edge purge", PURGE_ATTEMPTS, PURGE_BACKOFF_MS, || {
            self.edge.purge(&paths)
        })
        .await?;

        let record = InvalidationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            bundle_id: bundle_id.to_string(),
            paths,
            provider_ref,
            requested_at: Utc::now(),
        };
        self.storage
            .with_connection(|conn| invalidations::record_invalidation(conn, &record))?;

        tracing::info!(
            bundle_id,
            edge = self.edge.name(),
            paths = ?record.paths,
            "Edge invalidation requested"
        );
        Ok(record)
    }

    pub fn invalidations(&self, bundle_id: &str) -> Result<Vec<InvalidationRecord>> {
        self.storage
            .with_connection(|conn| invalidations::list_invalidations(conn, bundle_id))
    }
}

#[async_trait]
impl ChunkSource for Distributor {
    async fn fetch_chunk(&self, _bundle_id: &str, chunk: &ChunkRef) -> Result<Vec<u8>> {
        self.objects.get(&chunk.storage_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MemoryObjectStore, ObjectMeta, ObjectStore};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEdge {
        purged: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl EdgeCache for RecordingEdge {
        async fn purge(&self, paths: &[String]) -> Result<Option<String>> {
            self.purged.lock().push(paths.to_vec());
            Ok(Some("ref-1".into()))
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    async fn setup() -> (Distributor, Arc<RecordingEdge>, MemoryObjectStore) {
        let storage = Storage::open_in_memory().unwrap();
        let objects = MemoryObjectStore::new();
        storage
            .with_connection(|conn| {
                bundles::insert_generating_bundle(conn, "b1", "doc", "1.0.0", None)?;
                let chunk = ChunkRef {
                    index: 0,
                    storage_key: "bundles/b1/chunks/00000.gz".into(),
                    checksum: "c0".into(),
                    size: 10,
                    compressed_size: 4,
                };
                bundles::record_chunk(conn, "b1", &chunk)?;
                bundles::mark_ready(
                    conn,
                    "b1",
                    "m",
                    &manifest_key("b1"),
                    &BundleMetadata::from_chunks(&[chunk]),
                )?;
                bundles::insert_generating_bundle(conn, "b2", "doc", "1.0.1", None)?;
                Ok(())
            })
            .unwrap();
        objects
            .put("bundles/b1/chunks/00000.gz", vec![9, 9], ObjectMeta::default())
            .await
            .unwrap();
        objects
            .put(&manifest_key("b1"), b"{}".to_vec(), ObjectMeta::default())
            .await
            .unwrap();

        let edge = Arc::new(RecordingEdge::default());
        let distributor = Distributor::new(
            storage,
            Arc::new(objects.clone()),
            edge.clone(),
            DistributionConfig {
                base_url: "https://cdn.example.com/".into(),
                ..Default::default()
            },
        );
        (distributor, edge, objects)
    }

    #[tokio::test]
    async fn test_url_cache_policy() {
        let (distributor, _, _) = setup().await;

        let chunk = distributor.url_for("b1", Some(0)).unwrap();
        assert_eq!(chunk.url, "https://cdn.example.com/bundles/b1/chunks/0");
        assert!(chunk.cache_control.contains("immutable"));
        assert!(chunk.cache_control.contains("max-age=31536000"));

        let manifest = distributor.url_for("b1", None).unwrap();
        assert_eq!(manifest.path, "/bundles/b1/manifest.json");
        assert!(manifest.cache_control.contains("max-age=60"));
        assert!(!manifest.cache_control.contains("immutable"));

        assert!(distributor.url_for("b1", Some(1)).unwrap_err().is_not_found());
        // GENERATING bundles are never published
        assert!(distributor.url_for("b2", None).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_signed_url_verifies() {
        let (distributor, _, _) = setup().await;
        let signed = distributor
            .signed_url_for("b1", Some(0), Some(Duration::from_secs(60)))
            .unwrap();
        let expires = signed.expires_at.unwrap().timestamp();
        let signature = signed.url.rsplit("signature=").next().unwrap();

        distributor
            .verify_signature(&signed.path, expires, signature)
            .unwrap();
        assert!(distributor
            .verify_signature("/bundles/b1/manifest.json", expires, signature)
            .is_err());
    }

    #[tokio::test]
    async fn test_invalidate_records_ledger() {
        let (distributor, edge, _) = setup().await;

        distributor.invalidate("b1").await.unwrap();
        distributor.invalidate_manifest("b1").await.unwrap();

        let purged = edge.purged.lock().clone();
        assert_eq!(purged[0], vec!["/bundles/b1/*".to_string()]);
        assert_eq!(purged[1], vec!["/bundles/b1/manifest.json".to_string()]);

        let ledger = distributor.invalidations("b1").unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].provider_ref.as_deref(), Some("ref-1"));

        assert!(distributor.invalidate("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_origin_reads() {
        let (distributor, _, _) = setup().await;
        let (bytes, checksum) = distributor.chunk_bytes("b1", 0).await.unwrap();
        assert_eq!(bytes, vec![9, 9]);
        assert_eq!(checksum, "c0");
        assert_eq!(distributor.manifest_bytes("b1").await.unwrap(), b"{}");
        assert!(distributor.manifest_bytes("b2").await.unwrap_err().is_not_found());
    }
}
