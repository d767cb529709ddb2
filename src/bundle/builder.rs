//! Bundle builder
//!
//! Turns a document snapshot into a READY bundle:
//!
//! 1. insert a GENERATING row (the partial unique index allows one per
//!    document; a concurrent request waits for the in-flight build instead)
//! 2. snapshot → chunk codec
//! 3. upload chunks with bounded parallelism, recording each acknowledged one
//! 4. write the manifest object once every upload is acknowledged
//! 5. GENERATING → READY in the database
//!
//! Devices only ever learn about a bundle through a READY row, so a failure
//! anywhere before step 5 leaves nothing observable. Failed builds are marked
//! ERROR and their objects deleted on a best-effort basis; `reclaim` finishes
//! the job for anything left behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;

use super::version::next_version;
use crate::codec::{self, ChunkCodec, EncodedChunk};
use crate::config::BuildConfig;
use crate::error::{BundlecastError, Result};
use crate::object_store::{
    chunk_key, manifest_key, ObjectMeta, SharedObjectStore, CONTENT_TYPE_CHUNK,
    CONTENT_TYPE_MANIFEST,
};
use crate::retry::with_retry;
use crate::snapshot::SnapshotSource;
use crate::storage::{bundles, log_audit, AuditAction, Storage};
use crate::types::*;

const COALESCE_POLL: Duration = Duration::from_millis(100);
const BEGIN_ATTEMPTS: u32 = 3;

/// Per-build overrides
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Explicit version; otherwise the previous version is bumped
    pub version: Option<String>,
    pub chunk_threshold_bytes: Option<usize>,
}

/// Outcome of [`BundleBuilder::reclaim`]
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    /// Stale GENERATING bundles that were marked ERROR
    pub abandoned: Vec<BundleId>,
    /// ERROR bundles whose objects were deleted
    pub reclaimed: Vec<BundleId>,
    pub deleted_objects: u64,
}

enum Begin {
    Started(Bundle),
    InFlight(BundleId),
}

pub struct BundleBuilder {
    storage: Storage,
    objects: SharedObjectStore,
    snapshots: Arc<dyn SnapshotSource>,
    config: BuildConfig,
}

impl BundleBuilder {
    pub fn new(
        storage: Storage,
        objects: SharedObjectStore,
        snapshots: Arc<dyn SnapshotSource>,
        config: BuildConfig,
    ) -> Self {
        Self {
            storage,
            objects,
            snapshots,
            config,
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build and publish a new bundle of `document_id`.
    ///
    /// If a build of the same document is already running, waits for it and
    /// returns its result instead of starting a second one.
    pub async fn build(&self, document_id: &str, options: BuildOptions) -> Result<Bundle> {
        if document_id.trim().is_empty() {
            return Err(BundlecastError::InvalidInput(
                "Document id must not be empty".to_string(),
            ));
        }

        let mut attempt = 0;
        let bundle = loop {
            attempt += 1;
            match self.begin(document_id, &options) {
                Ok(Begin::Started(bundle)) => break bundle,
                Ok(Begin::InFlight(bundle_id)) => return self.await_in_flight(&bundle_id).await,
                // The in-flight build finished between our insert and lookup
                Err(BundlecastError::BuildInProgress(_)) if attempt < BEGIN_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        };

        tracing::info!(
            bundle_id = %bundle.id,
            document_id,
            version = %bundle.version,
            "Building bundle"
        );
        let started = Instant::now();

        match self.run(&bundle, &options).await {
            Ok(ready) => {
                tracing::info!(
                    bundle_id = %ready.id,
                    chunks = ready.metadata.chunk_count,
                    compressed_size = ready.metadata.compressed_size,
                    "Bundle ready in {:?}",
                    started.elapsed()
                );
                Ok(ready)
            }
            Err(e) => Err(self.fail(&bundle, e).await),
        }
    }

    fn begin(&self, document_id: &str, options: &BuildOptions) -> Result<Begin> {
        let id = uuid::Uuid::new_v4().to_string();
        let expires_at = (self.config.bundle_ttl_days > 0)
            .then(|| Utc::now() + chrono::Duration::days(self.config.bundle_ttl_days));

        let inserted = self.storage.with_transaction(|conn| {
            let version = match &options.version {
                Some(v) => {
                    if bundles::ready_bundle_by_version(conn, document_id, v)?.is_some() {
                        return Err(BundlecastError::Conflict(format!(
                            "Document {} already has a READY bundle at version {}",
                            document_id, v
                        )));
                    }
                    v.clone()
                }
                None => {
                    let latest = bundles::latest_bundle(conn, document_id)?;
                    next_version(latest.as_ref().map(|b| b.version.as_str()))
                }
            };
            bundles::insert_generating_bundle(conn, &id, document_id, &version, expires_at)
        });

        match inserted {
            Ok(bundle) => Ok(Begin::Started(bundle)),
            Err(BundlecastError::BuildInProgress(doc)) => {
                let in_flight = self
                    .storage
                    .with_connection(|conn| bundles::generating_bundle_for(conn, document_id))?;
                match in_flight {
                    Some(bundle) => Ok(Begin::InFlight(bundle.id)),
                    None => Err(BundlecastError::BuildInProgress(doc)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn await_in_flight(&self, bundle_id: &str) -> Result<Bundle> {
        tracing::info!(bundle_id, "Build already in progress, waiting for it");
        let deadline = Instant::now() + Duration::from_secs(self.config.coalesce_wait_secs);

        loop {
            let bundle = self
                .storage
                .with_connection(|conn| bundles::get_bundle(conn, bundle_id))?;
            match bundle.status {
                BundleStatus::Ready => return Ok(bundle),
                BundleStatus::Generating => {}
                BundleStatus::Error | BundleStatus::Retired => {
                    return Err(BundlecastError::Build {
                        bundle_id: bundle.id,
                        message: bundle
                            .error
                            .unwrap_or_else(|| format!("bundle is {}", bundle.status.as_str())),
                    })
                }
            }
            if Instant::now() >= deadline {
                return Err(BundlecastError::BuildInProgress(bundle.document_id));
            }
            tokio::time::sleep(COALESCE_POLL).await;
        }
    }

    async fn run(&self, bundle: &Bundle, options: &BuildOptions) -> Result<Bundle> {
        let snapshot = self.snapshots.snapshot(&bundle.document_id).await?;

        let codec = ChunkCodec::new(
            options
                .chunk_threshold_bytes
                .unwrap_or(self.config.chunk_threshold_bytes),
            self.config.compression_level,
        );
        let encoded = tokio::task::spawn_blocking(move || codec.encode(&snapshot))
            .await
            .map_err(|e| BundlecastError::Internal(format!("Chunk encoding panicked: {}", e)))??;

        let count = encoded.len() as u32;
        self.storage
            .with_connection(|conn| bundles::set_chunk_count(conn, &bundle.id, count))?;

        let mut chunks = self.upload_chunks(&bundle.id, encoded).await?;
        chunks.sort_by_key(|c| c.index);

        let checksums: Vec<&str> = chunks.iter().map(|c| c.checksum.as_str()).collect();
        let manifest = Manifest {
            bundle_id: bundle.id.clone(),
            document_id: bundle.document_id.clone(),
            version: bundle.version.clone(),
            checksum: codec::manifest_checksum(&checksums),
            metadata: BundleMetadata::from_chunks(&chunks),
            chunks,
            created_at: bundle.created_at,
            expires_at: bundle.expires_at,
        };

        // Every chunk is acknowledged; the manifest is one atomic write
        let key = manifest_key(&bundle.id);
        let body = serde_json::to_vec_pretty(&manifest)?;
        let meta = ObjectMeta::new(CONTENT_TYPE_MANIFEST).with("checksum", &manifest.checksum);
        with_retry(
            "Manifest upload",
            self.config.upload_attempts,
            self.config.retry_backoff_ms,
            || self.objects.put(&key, body.clone(), meta.clone()),
        )
        .await?;

        self.storage.with_transaction(|conn| {
            bundles::mark_ready(conn, &bundle.id, &manifest.checksum, &key, &manifest.metadata)?;
            log_audit(
                conn,
                AuditAction::BundleBuilt,
                None,
                Some(&bundle.id),
                Some(&json!({
                    "documentId": bundle.document_id,
                    "version": bundle.version,
                    "chunkCount": manifest.metadata.chunk_count,
                    "compressedSize": manifest.metadata.compressed_size,
                    "manifestChecksum": manifest.checksum,
                })),
            )?;
            bundles::get_bundle(conn, &bundle.id)
        })
    }

    async fn upload_chunks(
        &self,
        bundle_id: &str,
        encoded: Vec<EncodedChunk>,
    ) -> Result<Vec<ChunkRef>> {
        let mut uploads = stream::iter(
            encoded
                .into_iter()
                .map(|chunk| self.upload_chunk(bundle_id, chunk)),
        )
        .buffer_unordered(self.config.upload_concurrency.max(1));

        let mut chunks = Vec::new();
        while let Some(result) = uploads.next().await {
            // Dropping the stream on error cancels the uploads still in flight
            chunks.push(result?);
        }
        Ok(chunks)
    }

    async fn upload_chunk(&self, bundle_id: &str, chunk: EncodedChunk) -> Result<ChunkRef> {
        let key = chunk_key(bundle_id, chunk.index);
        let meta = ObjectMeta::new(CONTENT_TYPE_CHUNK)
            .with("checksum", chunk.checksum.clone())
            .with("bundle-id", bundle_id);

        with_retry(
            "Chunk upload",
            self.config.upload_attempts,
            self.config.retry_backoff_ms,
            || self.objects.put(&key, chunk.payload.clone(), meta.clone()),
        )
        .await?;

        let chunk_ref = ChunkRef {
            index: chunk.index,
            storage_key: key,
            checksum: chunk.checksum,
            size: chunk.size,
            compressed_size: chunk.compressed_size,
        };
        self.storage
            .with_connection(|conn| bundles::record_chunk(conn, bundle_id, &chunk_ref))?;
        Ok(chunk_ref)
    }

    /// Mark a failed build ERROR and delete whatever it uploaded
    async fn fail(&self, bundle: &Bundle, error: BundlecastError) -> BundlecastError {
        tracing::error!(bundle_id = %bundle.id, "Bundle build failed: {}", error);

        let message = error.to_string();
        let marked = self.storage.with_transaction(|conn| {
            let marked = bundles::mark_error(conn, &bundle.id, &message)?;
            if marked {
                log_audit(
                    conn,
                    AuditAction::BundleFailed,
                    None,
                    Some(&bundle.id),
                    Some(&json!({ "error": message })),
                )?;
            }
            Ok(marked)
        });
        if let Err(e) = marked {
            tracing::error!(bundle_id = %bundle.id, "Could not mark bundle as failed: {}", e);
        }

        match self.cleanup_objects(&bundle.id).await {
            Ok(deleted) => {
                tracing::debug!(bundle_id = %bundle.id, deleted, "Removed objects of failed build")
            }
            Err(e) => tracing::warn!(
                bundle_id = %bundle.id,
                "Cleanup of failed build incomplete, left for reclaim: {}",
                e
            ),
        }

        match error {
            e @ (BundlecastError::NotFound { .. } | BundlecastError::InvalidInput(_)) => e,
            e => BundlecastError::Build {
                bundle_id: bundle.id.clone(),
                message: e.to_string(),
            },
        }
    }

    /// Delete chunk and manifest objects of a non-READY bundle.
    ///
    /// Object deletes come first; chunk rows and the planned chunk count are
    /// cleared only once every object is gone, so an interrupted cleanup is
    /// retried by the next `reclaim`.
    async fn cleanup_objects(&self, bundle_id: &str) -> Result<u64> {
        let (bundle, rows) = self.storage.with_connection(|conn| {
            Ok((
                bundles::get_bundle(conn, bundle_id)?,
                bundles::load_chunks(conn, bundle_id)?,
            ))
        })?;

        let keys = object_keys(&bundle, &rows);
        let deleted = self.delete_objects(&keys).await?;

        self.storage.with_transaction(|conn| {
            bundles::delete_chunk_rows(conn, bundle_id)?;
            bundles::set_chunk_count(conn, bundle_id, 0)
        })?;
        Ok(deleted)
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<u64> {
        let results: Vec<Result<()>> = stream::iter(keys.iter().cloned().map(|key| async move {
            with_retry(
                "Object delete",
                self.config.upload_attempts,
                self.config.retry_backoff_ms,
                || self.objects.delete(&key),
            )
            .await
        }))
        .buffer_unordered(self.config.upload_concurrency.max(1))
        .collect()
        .await;

        let mut deleted = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Published manifest of a READY bundle
    pub fn manifest(&self, bundle_id: &str) -> Result<Manifest> {
        let bundle = self
            .storage
            .with_connection(|conn| bundles::get_bundle(conn, bundle_id))?;
        manifest_of(bundle)
    }

    pub fn status(&self, bundle_id: &str) -> Result<Bundle> {
        self.storage
            .with_connection(|conn| bundles::get_bundle(conn, bundle_id))
    }

    /// Newest READY bundle of a document
    pub fn latest_ready(&self, document_id: &str) -> Result<Option<Bundle>> {
        self.storage
            .with_connection(|conn| bundles::latest_ready_bundle(conn, document_id))
    }

    pub fn list(&self, document_id: &str) -> Result<Vec<Bundle>> {
        self.storage
            .with_connection(|conn| bundles::list_bundles(conn, document_id))
    }

    /// Cancel an in-flight build. The running build notices at publication
    /// and cleans up; returns false when the bundle was not GENERATING.
    pub fn abandon(&self, bundle_id: &str) -> Result<bool> {
        self.storage.with_transaction(|conn| {
            bundles::get_bundle(conn, bundle_id)?;
            let marked = bundles::mark_error(conn, bundle_id, "abandoned")?;
            if marked {
                log_audit(conn, AuditAction::BundleAbandoned, None, Some(bundle_id), None)?;
                tracing::info!(bundle_id, "Bundle build abandoned");
            }
            Ok(marked)
        })
    }

    /// Retire a bundle: its chunks and manifest are deleted and it is never
    /// served again. Retiring twice is a no-op; returns whether this call
    /// changed the bundle's status.
    pub async fn retire(&self, bundle_id: &str) -> Result<bool> {
        let (bundle, rows, changed) = self.storage.with_transaction(|conn| {
            let bundle = bundles::get_bundle(conn, bundle_id)?;
            let rows = bundles::load_chunks(conn, bundle_id)?;
            if bundle.status == BundleStatus::Retired {
                return Ok((bundle, rows, false));
            }
            bundles::mark_retired(conn, bundle_id)?;
            log_audit(
                conn,
                AuditAction::BundleRetired,
                None,
                Some(bundle_id),
                Some(&json!({
                    "documentId": bundle.document_id,
                    "version": bundle.version,
                    "previousStatus": bundle.status.as_str(),
                })),
            )?;
            Ok((bundle, rows, true))
        })?;

        // The tombstone keeps the chunk count, so a repeated retire re-issues
        // the same idempotent deletes and finishes an interrupted one.
        let keys = object_keys(&bundle, &rows);
        let deleted = self.delete_objects(&keys).await?;
        self.storage
            .with_connection(|conn| bundles::delete_chunk_rows(conn, bundle_id))?;

        if changed {
            tracing::info!(bundle_id, deleted, "Bundle retired");
        }
        Ok(changed)
    }

    /// Abandon GENERATING bundles older than the build timeout and delete the
    /// objects of ERROR bundles.
    pub async fn reclaim(&self) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.build_timeout_secs as i64);

        let stale = self
            .storage
            .with_connection(|conn| bundles::stale_generating(conn, cutoff))?;
        for bundle in stale {
            let marked = self.storage.with_transaction(|conn| {
                let marked = bundles::mark_error(conn, &bundle.id, "build timed out")?;
                if marked {
                    log_audit(
                        conn,
                        AuditAction::BundleAbandoned,
                        None,
                        Some(&bundle.id),
                        Some(&json!({ "reason": "timeout" })),
                    )?;
                }
                Ok(marked)
            })?;
            if marked {
                tracing::warn!(bundle_id = %bundle.id, "Abandoned stale build");
                report.abandoned.push(bundle.id);
            }
        }

        let failed = self
            .storage
            .with_connection(|conn| bundles::list_bundles_by_status(conn, BundleStatus::Error))?;
        for bundle in failed {
            let has_rows = self
                .storage
                .with_connection(|conn| Ok(!bundles::load_chunks(conn, &bundle.id)?.is_empty()))?;
            if bundle.metadata.chunk_count == 0 && !has_rows {
                continue;
            }
            match self.cleanup_objects(&bundle.id).await {
                Ok(deleted) => {
                    report.deleted_objects += deleted;
                    report.reclaimed.push(bundle.id);
                }
                Err(e) => {
                    tracing::warn!(bundle_id = %bundle.id, "Reclaim failed: {}", e);
                }
            }
        }

        if !report.abandoned.is_empty() || !report.reclaimed.is_empty() {
            tracing::info!(
                abandoned = report.abandoned.len(),
                reclaimed = report.reclaimed.len(),
                deleted_objects = report.deleted_objects,
                "Reclaim finished"
            );
        }
        Ok(report)
    }

    /// Retire READY bundles past their expiry that have been superseded
    pub async fn retire_expired(&self) -> Result<Vec<BundleId>> {
        let expired = self
            .storage
            .with_connection(|conn| bundles::expired_superseded(conn, Utc::now()))?;

        let mut retired = Vec::with_capacity(expired.len());
        for bundle in expired {
            if self.retire(&bundle.id).await? {
                retired.push(bundle.id);
            }
        }
        Ok(retired)
    }
}

/// Manifest view of a bundle; `NotFound` unless READY
pub fn manifest_of(bundle: Bundle) -> Result<Manifest> {
    if !bundle.is_ready() {
        return Err(BundlecastError::not_found("manifest", bundle.id));
    }
    Ok(Manifest {
        checksum: bundle.manifest_checksum.unwrap_or_default(),
        bundle_id: bundle.id,
        document_id: bundle.document_id,
        version: bundle.version,
        chunks: bundle.chunks,
        metadata: bundle.metadata,
        created_at: bundle.created_at,
        expires_at: bundle.expires_at,
    })
}

/// Every object key a bundle may own: recorded chunks, planned chunk
/// indices and the manifest.
fn object_keys(bundle: &Bundle, rows: &[ChunkRef]) -> Vec<String> {
    let mut keys: Vec<String> = rows.iter().map(|c| c.storage_key.clone()).collect();
    for index in 0..bundle.metadata.chunk_count {
        let key = chunk_key(&bundle.id, index);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.push(manifest_key(&bundle.id));
    keys
}
