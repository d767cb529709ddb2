//! Device sync coordinator
//!
//! For every document a device is entitled to, compares the cache the
//! device reports against the authoritative READY manifest (latest, or the
//! pinned version) and classifies the work:
//!
//! - no report for the document: FULL, every index
//! - same manifest checksum and chunk count: NONE
//! - same manifest checksum, different chunk count: FULL, and the anomaly is
//!   written to the audit log
//! - otherwise an index-by-index diff; an authoritative chunk the device
//!   already holds at another index is reused instead of fetched
//!
//! Reports are mapped to documents through the bundle table, tombstones
//! included, so a device still holding a retired bundle is upgraded.

use std::collections::HashMap;

use serde_json::json;

use crate::config::SyncPolicy;
use crate::error::Result;
use crate::storage::jobs::{self, JobInsert};
use crate::storage::{bundles, devices, log_audit, AuditAction, Storage};
use crate::types::*;

/// Work needed to bring one device cache in line with a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub kind: SyncKind,
    /// Indices to download, ascending
    pub fetch: Vec<u32>,
    /// Indices satisfied by a chunk the device already holds elsewhere
    pub reuse: Vec<ChunkReuse>,
    /// The report claimed the current manifest but its chunk list disagrees
    pub inconsistent: bool,
}

impl SyncPlan {
    fn full(count: usize, inconsistent: bool) -> Self {
        Self {
            kind: SyncKind::Full,
            fetch: (0..count as u32).collect(),
            reuse: vec![],
            inconsistent,
        }
    }
}

/// Diff a device's cache against the authoritative chunk list
pub fn plan_sync(
    manifest_checksum: &str,
    authoritative: &[String],
    reported: Option<&CachedManifestReport>,
) -> SyncPlan {
    let report = match reported {
        Some(report) => report,
        None => return SyncPlan::full(authoritative.len(), false),
    };
    let local = &report.chunk_checksums;

    if report.manifest_checksum == manifest_checksum {
        if local.len() == authoritative.len() {
            return SyncPlan {
                kind: SyncKind::None,
                fetch: vec![],
                reuse: vec![],
                inconsistent: false,
            };
        }
        return SyncPlan::full(authoritative.len(), true);
    }

    // First local position of every checksum the device holds
    let mut held: HashMap<&str, u32> = HashMap::with_capacity(local.len());
    for (i, checksum) in local.iter().enumerate() {
        held.entry(checksum.as_str()).or_insert(i as u32);
    }

    let mut fetch = Vec::new();
    let mut reuse = Vec::new();
    for (i, checksum) in authoritative.iter().enumerate() {
        if local.get(i) == Some(checksum) {
            continue;
        }
        match held.get(checksum.as_str()) {
            Some(&source_index) => reuse.push(ChunkReuse {
                target_index: i as u32,
                source_index,
            }),
            None => fetch.push(i as u32),
        }
    }

    // Nothing the device holds is usable: a full refresh
    if !authoritative.is_empty() && fetch.len() == authoritative.len() {
        return SyncPlan::full(authoritative.len(), false);
    }

    SyncPlan {
        kind: SyncKind::Incremental,
        fetch,
        reuse,
        inconsistent: false,
    }
}

pub struct SyncCoordinator {
    storage: Storage,
    policy: SyncPolicy,
    signed_url_ttl_secs: u64,
}

impl SyncCoordinator {
    pub fn new(storage: Storage, policy: SyncPolicy, signed_url_ttl_secs: u64) -> Self {
        Self {
            storage,
            policy,
            signed_url_ttl_secs,
        }
    }

    pub fn policies(&self) -> ClientPolicies {
        ClientPolicies {
            sync_interval_secs: self.policy.sync_interval_secs,
            max_cache_bytes: self.policy.max_cache_bytes,
            cellular_max_bytes: self.policy.cellular_max_bytes,
            signed_url_ttl_secs: self.signed_url_ttl_secs,
        }
    }

    /// Handle a device's sync check
    pub fn check(&self, request: &SyncCheckRequest) -> Result<SyncCheckResponse> {
        let status = &request.device_status;

        let summaries = self.storage.with_transaction(|conn| {
            devices::touch_device(conn, &request.device_id, status)?;

            // Attribute each report to its document
            let mut reports: HashMap<DocumentId, &CachedManifestReport> = HashMap::new();
            for report in &request.cached_manifests {
                match bundles::find_bundle(conn, &report.bundle_id)? {
                    Some(bundle) => {
                        let newer = reports
                            .get(&bundle.document_id)
                            .map_or(true, |existing| existing.last_modified < report.last_modified);
                        if newer {
                            reports.insert(bundle.document_id, report);
                        }
                    }
                    None => tracing::debug!(
                        device_id = %request.device_id,
                        bundle_id = %report.bundle_id,
                        "Ignoring report for unknown bundle"
                    ),
                }
            }

            let mut summaries = Vec::new();
            for entitlement in devices::list_entitlements(conn, &request.device_id)? {
                let document_id = &entitlement.document_id;
                let target = match &entitlement.pinned_version {
                    Some(version) => bundles::ready_bundle_by_version(conn, document_id, version)?,
                    None => bundles::latest_ready_bundle(conn, document_id)?,
                };
                let target = match target {
                    Some(bundle) => bundle,
                    None => {
                        if let Some(version) = &entitlement.pinned_version {
                            tracing::warn!(
                                device_id = %request.device_id,
                                document_id = %document_id,
                                version = %version,
                                "Pinned version has no READY bundle"
                            );
                        }
                        continue;
                    }
                };

                let checksums: Vec<String> =
                    target.chunks.iter().map(|c| c.checksum.clone()).collect();
                let manifest_checksum = target.manifest_checksum.clone().unwrap_or_default();
                let report = reports.get(document_id).copied();
                let plan = plan_sync(&manifest_checksum, &checksums, report);

                if plan.inconsistent {
                    let reported = report.map(|r| r.chunk_checksums.len()).unwrap_or(0);
                    tracing::warn!(
                        device_id = %request.device_id,
                        bundle_id = %target.id,
                        reported,
                        expected = checksums.len(),
                        "Device manifest checksum matches but chunk list does not, forcing full sync"
                    );
                    log_audit(
                        conn,
                        AuditAction::InconsistentManifest,
                        Some(&request.device_id),
                        Some(&target.id),
                        Some(&json!({
                            "manifestChecksum": manifest_checksum,
                            "reportedChunks": reported,
                            "expectedChunks": checksums.len(),
                        })),
                    )?;
                }

                if plan.kind == SyncKind::None {
                    continue;
                }

                let estimated_bytes: u64 = plan
                    .fetch
                    .iter()
                    .filter_map(|&i| target.chunks.get(i as usize))
                    .map(|c| c.compressed_size)
                    .sum();
                let deferred = self.should_defer(status, estimated_bytes);

                let mut summary = SyncJobSummary {
                    job_id: None,
                    bundle_id: target.id.clone(),
                    document_id: document_id.clone(),
                    version: target.version.clone(),
                    kind: plan.kind,
                    chunk_indices: plan.fetch.clone(),
                    reuse: plan.reuse.clone(),
                    estimated_bytes,
                    deferred,
                };

                if !deferred {
                    let job = SyncJob {
                        id: uuid::Uuid::new_v4().to_string(),
                        device_id: request.device_id.clone(),
                        document_id: document_id.clone(),
                        bundle_id: target.id.clone(),
                        bundle_version: target.version.clone(),
                        kind: plan.kind,
                        status: JobStatus::Pending,
                        chunk_indices: plan.fetch,
                        reuse: plan.reuse,
                        base_checksums: report
                            .map(|r| r.chunk_checksums.clone())
                            .unwrap_or_default(),
                        attempts: 0,
                        last_error: None,
                        created_at: chrono::Utc::now(),
                        started_at: None,
                        completed_at: None,
                    };
                    match jobs::insert_job(conn, &job)? {
                        JobInsert::Created(created) => {
                            tracing::info!(
                                job_id = %created.id,
                                device_id = %created.device_id,
                                bundle_id = %created.bundle_id,
                                kind = created.kind.as_str(),
                                chunks = created.chunk_indices.len(),
                                "Sync job created"
                            );
                            summary.job_id = Some(created.id);
                        }
                        JobInsert::Existing(existing) => {
                            // The device already has work in flight for this document
                            summary.bundle_id = existing.bundle_id;
                            summary.version = existing.bundle_version;
                            summary.kind = existing.kind;
                            summary.chunk_indices = existing.chunk_indices;
                            summary.reuse = existing.reuse;
                            summary.job_id = Some(existing.id);
                        }
                    }
                }

                summaries.push(summary);
            }

            Ok(summaries)
        })?;

        Ok(SyncCheckResponse {
            needs_sync: !summaries.is_empty(),
            sync_jobs: summaries,
            policies: self.policies(),
            feature_flags: self.policy.feature_flags.clone(),
        })
    }

    fn should_defer(&self, status: &DeviceStatus, estimated_bytes: u64) -> bool {
        if status.network == NetworkClass::Cellular && estimated_bytes > self.policy.cellular_max_bytes
        {
            return true;
        }
        matches!(status.available_storage_bytes, Some(free) if estimated_bytes > free)
    }
}
