//! Service facade wiring storage, builder, distribution and sync together
//!
//! The HTTP API, the binaries and the integration tests all go through
//! [`Platform`], so cross-component rules live in one place: a newly
//! published bundle purges its predecessor's manifest from the edge, a
//! retired bundle is purged entirely, and cache invalidation cancels jobs
//! planned against the invalidated cache.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::bundle::{BuildOptions, BundleBuilder, ReclaimReport};
use crate::config::AppConfig;
use crate::distribution::{Distributor, EdgeCache};
use crate::error::{BundlecastError, Result};
use crate::object_store::SharedObjectStore;
use crate::snapshot::SnapshotSource;
use crate::storage::jobs;
use crate::storage::{
    bundles, cache, devices, log_audit, query_audit_log, AuditAction, AuditEntry, AuditFilter,
    Storage,
};
use crate::sync::{ChunkSink, SyncCoordinator, SyncExecutor};
use crate::types::*;

/// Outcome of a maintenance pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub reclaim: ReclaimReport,
    pub retired: Vec<BundleId>,
    /// RUNNING jobs whose worker never finished them
    pub timed_out_jobs: Vec<JobId>,
}

#[derive(Clone)]
pub struct Platform {
    storage: Storage,
    objects: SharedObjectStore,
    builder: Arc<BundleBuilder>,
    distributor: Arc<Distributor>,
    coordinator: Arc<SyncCoordinator>,
    executor: Arc<SyncExecutor>,
    config: AppConfig,
}

impl Platform {
    /// Open the database named in `config` and wire the components
    pub fn open(
        config: AppConfig,
        objects: SharedObjectStore,
        snapshots: Arc<dyn SnapshotSource>,
        edge: Arc<dyn EdgeCache>,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(config.storage.clone())?;
        Ok(Self::from_parts(storage, config, objects, snapshots, edge, sink))
    }

    pub fn from_parts(
        storage: Storage,
        config: AppConfig,
        objects: SharedObjectStore,
        snapshots: Arc<dyn SnapshotSource>,
        edge: Arc<dyn EdgeCache>,
        sink: Arc<dyn ChunkSink>,
    ) -> Self {
        let builder = Arc::new(BundleBuilder::new(
            storage.clone(),
            objects.clone(),
            snapshots,
            config.build.clone(),
        ));
        let distributor = Arc::new(Distributor::new(
            storage.clone(),
            objects.clone(),
            edge,
            config.distribution.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            storage.clone(),
            config.sync.clone(),
            config.distribution.signed_url_ttl_secs,
        ));
        let executor = Arc::new(SyncExecutor::new(
            storage.clone(),
            distributor.clone(),
            sink,
            config.sync.clone(),
        ));

        Self {
            storage,
            objects,
            builder,
            distributor,
            coordinator,
            executor,
            config,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn objects(&self) -> &SharedObjectStore {
        &self.objects
    }

    pub fn builder(&self) -> &BundleBuilder {
        &self.builder
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn executor(&self) -> Arc<SyncExecutor> {
        self.executor.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Bundles
    // ------------------------------------------------------------------------

    /// Build a bundle and purge the superseded manifest from the edge
    pub async fn build_and_publish(
        &self,
        document_id: &str,
        options: BuildOptions,
    ) -> Result<Bundle> {
        let previous = self.builder.latest_ready(document_id)?;
        let bundle = self.builder.build(document_id, options).await?;

        if let Some(previous) = previous.filter(|p| p.id != bundle.id) {
            if let Err(e) = self.distributor.invalidate_manifest(&previous.id).await {
                tracing::warn!(
                    bundle_id = %previous.id,
                    "Failed to purge superseded manifest: {}",
                    e
                );
            }
        }
        Ok(bundle)
    }

    /// Retire a bundle and purge everything published for it
    pub async fn retire(&self, bundle_id: &str) -> Result<bool> {
        let changed = self.builder.retire(bundle_id).await?;
        if let Err(e) = self.distributor.invalidate(bundle_id).await {
            tracing::warn!(bundle_id, "Failed to purge retired bundle: {}", e);
        }
        Ok(changed)
    }

    pub fn manifest(&self, bundle_id: &str) -> Result<Manifest> {
        self.builder.manifest(bundle_id)
    }

    /// Reclaim failed builds, retire expired bundles and fail sync jobs
    /// stuck in RUNNING
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        let timed_out_jobs = self.fail_stale_jobs()?;
        let reclaim = self.builder.reclaim().await?;
        let retired = self.builder.retire_expired().await?;
        for bundle_id in &retired {
            if let Err(e) = self.distributor.invalidate(bundle_id).await {
                tracing::warn!(bundle_id = %bundle_id, "Failed to purge expired bundle: {}", e);
            }
        }
        Ok(MaintenanceReport {
            reclaim,
            retired,
            timed_out_jobs,
        })
    }

    fn fail_stale_jobs(&self) -> Result<Vec<JobId>> {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::seconds(self.config.sync.job_timeout_secs as i64);
        self.storage.with_transaction(|conn| {
            let failed = jobs::fail_stale_running(conn, cutoff)?;
            for job in &failed {
                log_audit(
                    conn,
                    AuditAction::JobFailed,
                    Some(&job.device_id),
                    Some(&job.bundle_id),
                    Some(&json!({ "jobId": job.id, "reason": "timeout" })),
                )?;
                tracing::warn!(
                    job_id = %job.id,
                    device_id = %job.device_id,
                    "Sync job timed out while running"
                );
            }
            Ok(failed.into_iter().map(|job| job.id).collect())
        })
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub fn sync_check(&self, request: &SyncCheckRequest) -> Result<SyncCheckResponse> {
        self.coordinator.check(request)
    }

    pub fn enroll_device(&self, device_id: &str) -> Result<Device> {
        self.storage.with_transaction(|conn| {
            let existed = devices::find_device(conn, device_id)?.is_some();
            let device = devices::enroll_device(conn, device_id)?;
            if !existed {
                log_audit(conn, AuditAction::DeviceEnrolled, Some(device_id), None, None)?;
                tracing::info!(device_id, "Device enrolled");
            }
            Ok(device)
        })
    }

    /// Remove a device together with its cache records and jobs
    pub fn unenroll_device(&self, device_id: &str) -> Result<DeviceInvalidationResult> {
        self.storage.with_transaction(|conn| {
            let result = devices::unenroll_device(conn, device_id)?;
            log_audit(
                conn,
                AuditAction::DeviceUnenrolled,
                Some(device_id),
                None,
                Some(&json!({ "deletedCaches": result.deleted_caches })),
            )?;
            tracing::info!(device_id, "Device unenrolled");
            Ok(result)
        })
    }

    pub fn device(&self, device_id: &str) -> Result<Device> {
        self.storage
            .with_connection(|conn| devices::get_device(conn, device_id))
    }

    pub fn entitle(
        &self,
        device_id: &str,
        document_id: &str,
        pinned_version: Option<&str>,
    ) -> Result<Entitlement> {
        self.storage
            .with_connection(|conn| devices::entitle(conn, device_id, document_id, pinned_version))
    }

    pub fn revoke(&self, device_id: &str, document_id: &str) -> Result<bool> {
        self.storage
            .with_connection(|conn| devices::revoke(conn, device_id, document_id))
    }

    pub fn entitlements(&self, device_id: &str) -> Result<Vec<Entitlement>> {
        self.storage.with_connection(|conn| {
            devices::get_device(conn, device_id)?;
            devices::list_entitlements(conn, device_id)
        })
    }

    /// Server-side cache record of a device's document
    pub fn cache_manifest(&self, device_id: &str, document_id: &str) -> Result<Option<CacheManifest>> {
        self.storage
            .with_connection(|conn| cache::get_cache_manifest(conn, device_id, document_id))
    }

    /// All cache records of a device, by document
    pub fn cache_manifests(&self, device_id: &str) -> Result<Vec<CacheManifest>> {
        self.storage.with_connection(|conn| {
            devices::get_device(conn, device_id)?;
            cache::list_cache_manifests(conn, device_id)
        })
    }

    /// Clear cache records of several devices. PENDING jobs planned against
    /// the cleared records are cancelled.
    pub fn invalidate_caches(
        &self,
        request: &CacheInvalidationRequest,
    ) -> Result<Vec<DeviceInvalidationResult>> {
        self.storage.with_transaction(|conn| {
            let scoped_document = match &request.scope {
                InvalidationScope::All => None,
                InvalidationScope::Document { document_id } => Some(document_id.clone()),
                InvalidationScope::Bundle { bundle_id } => Some(
                    bundles::find_bundle(conn, bundle_id)?
                        .map(|b| b.document_id)
                        .ok_or_else(|| BundlecastError::not_found("bundle", bundle_id))?,
                ),
            };

            let mut results = Vec::with_capacity(request.device_ids.len());
            for device_id in &request.device_ids {
                devices::get_device(conn, device_id)?;
                let result = cache::delete_cache_manifests(conn, device_id, &request.scope)?;
                let cancelled =
                    jobs::cancel_pending_jobs(conn, device_id, scoped_document.as_deref())?;
                log_audit(
                    conn,
                    AuditAction::CacheInvalidated,
                    Some(device_id),
                    None,
                    Some(&json!({
                        "scope": request.scope,
                        "deletedCaches": result.deleted_caches,
                        "deletedManifests": result.deleted_manifests,
                        "deletedChunks": result.deleted_chunks,
                        "cancelledJobs": cancelled,
                    })),
                )?;
                results.push(result);
            }

            tracing::info!(
                devices = results.len(),
                scope = ?request.scope,
                "Device caches invalidated"
            );
            Ok(results)
        })
    }

    // ------------------------------------------------------------------------
    // Jobs, audit, stats
    // ------------------------------------------------------------------------

    pub fn jobs(&self, device_id: &str) -> Result<Vec<SyncJob>> {
        self.storage
            .with_connection(|conn| jobs::list_jobs(conn, device_id))
    }

    pub fn job(&self, job_id: &str) -> Result<SyncJob> {
        self.storage.with_connection(|conn| jobs::get_job(conn, job_id))
    }

    /// Put a FAILED job back in the queue
    pub fn retry_job(&self, job_id: &str) -> Result<SyncJob> {
        self.storage
            .with_transaction(|conn| jobs::retry_job(conn, job_id))
    }

    pub fn audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.storage
            .with_connection(|conn| query_audit_log(conn, filter))
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.with_connection(bundles::get_stats)
    }
}
