//! Destinations for chunks fetched by the sync executor

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{BundlecastError, Result};
use crate::types::CacheManifest;

/// Where verified chunk bytes land for a device
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Store one verified chunk. Chunks are addressed by checksum, so
    /// storing the same chunk twice is harmless.
    async fn store_chunk(
        &self,
        device_id: &str,
        document_id: &str,
        checksum: &str,
        bytes: &[u8],
    ) -> Result<()>;

    /// Make `manifest` the device's current view of the document
    async fn commit(&self, manifest: &CacheManifest) -> Result<()>;

    async fn has_chunk(&self, device_id: &str, document_id: &str, checksum: &str) -> Result<bool>;
}

/// Verifies and drops chunk bytes. Used when the server only tracks what a
/// device should hold.
#[derive(Debug, Clone, Default)]
pub struct DiscardChunkSink;

#[async_trait]
impl ChunkSink for DiscardChunkSink {
    async fn store_chunk(&self, _: &str, _: &str, _: &str, _: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, _manifest: &CacheManifest) -> Result<()> {
        Ok(())
    }

    async fn has_chunk(&self, _: &str, _: &str, _: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Device cache mirrored on a local filesystem:
///
/// ```text
/// <root>/<device>/<document>/<checksum>.gz
/// <root>/<device>/<document>/manifest.json
/// ```
///
/// Committing a manifest prunes chunk files it no longer references.
#[derive(Debug, Clone)]
pub struct FsChunkSink {
    root: PathBuf,
}

fn segment(value: &str) -> Result<&str> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
    {
        return Err(BundlecastError::InvalidInput(format!(
            "Unsafe path segment: {:?}",
            value
        )));
    }
    Ok(value)
}

impl FsChunkSink {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let expanded = shellexpand::tilde(&root.as_ref().to_string_lossy()).to_string();
        let root = PathBuf::from(expanded);
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, device_id: &str, document_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(segment(device_id)?).join(segment(document_id)?))
    }

    fn chunk_path(&self, device_id: &str, document_id: &str, checksum: &str) -> Result<PathBuf> {
        Ok(self
            .document_dir(device_id, document_id)?
            .join(format!("{}.gz", segment(checksum)?)))
    }

    /// Read back a stored chunk
    pub async fn read_chunk(
        &self,
        device_id: &str,
        document_id: &str,
        checksum: &str,
    ) -> Result<Vec<u8>> {
        let path = self.chunk_path(device_id, document_id, checksum)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BundlecastError::not_found("chunk", checksum))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Last committed manifest for a device's document
    pub async fn read_manifest(
        &self,
        device_id: &str,
        document_id: &str,
    ) -> Result<Option<CacheManifest>> {
        let path = self
            .document_dir(device_id, document_id)?
            .join("manifest.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl ChunkSink for FsChunkSink {
    async fn store_chunk(
        &self,
        device_id: &str,
        document_id: &str,
        checksum: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let path = self.chunk_path(device_id, document_id, checksum)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, bytes).await
    }

    async fn commit(&self, manifest: &CacheManifest) -> Result<()> {
        let dir = self.document_dir(&manifest.device_id, &manifest.document_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join("manifest.json"), &serde_json::to_vec_pretty(manifest)?).await?;

        let mut pruned = 0usize;
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(checksum) = name.strip_suffix(".gz") {
                if !manifest.chunk_checksums.iter().any(|c| c == checksum) {
                    tokio::fs::remove_file(entry.path()).await?;
                    pruned += 1;
                }
            }
        }

        tracing::debug!(
            device_id = %manifest.device_id,
            document_id = %manifest.document_id,
            chunks = manifest.chunk_checksums.len(),
            pruned,
            "Committed device cache"
        );
        Ok(())
    }

    async fn has_chunk(&self, device_id: &str, document_id: &str, checksum: &str) -> Result<bool> {
        let path = self.chunk_path(device_id, document_id, checksum)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::cache_manifest_for;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_commit_prunes_unreferenced_chunks() {
        let dir = TempDir::new().unwrap();
        let sink = FsChunkSink::new(dir.path()).await.unwrap();

        sink.store_chunk("dev", "doc", "aaa", b"one").await.unwrap();
        sink.store_chunk("dev", "doc", "bbb", b"two").await.unwrap();
        assert!(sink.has_chunk("dev", "doc", "aaa").await.unwrap());

        let manifest = cache_manifest_for("dev", "doc", "b2", "1.0.1", vec!["bbb".into()]);
        sink.commit(&manifest).await.unwrap();

        assert!(!sink.has_chunk("dev", "doc", "aaa").await.unwrap());
        assert_eq!(sink.read_chunk("dev", "doc", "bbb").await.unwrap(), b"two");
        let stored = sink.read_manifest("dev", "doc").await.unwrap().unwrap();
        assert_eq!(stored.bundle_id, "b2");
        assert!(sink.read_manifest("dev", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let sink = FsChunkSink::new(dir.path()).await.unwrap();
        assert!(sink.store_chunk("..", "doc", "aaa", b"x").await.is_err());
        assert!(sink.store_chunk("dev", "a/b", "aaa", b"x").await.is_err());
    }
}
