//! Core types for Bundlecast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque bundle identifier
pub type BundleId = String;
/// Identifier of the source document a bundle is built from
pub type DocumentId = String;
/// Identifier of an enrolled device
pub type DeviceId = String;
/// Identifier of a sync job
pub type JobId = String;

/// Lifecycle state of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleStatus {
    Generating,
    Ready,
    Error,
    /// Tombstone left after retirement; chunks and manifest are gone
    Retired,
}

impl BundleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::Generating => "generating",
            BundleStatus::Ready => "ready",
            BundleStatus::Error => "error",
            BundleStatus::Retired => "retired",
        }
    }
}

impl std::str::FromStr for BundleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "generating" => Ok(BundleStatus::Generating),
            "ready" => Ok(BundleStatus::Ready),
            "error" => Ok(BundleStatus::Error),
            "retired" => Ok(BundleStatus::Retired),
            _ => Err(format!("Unknown bundle status: {}", s)),
        }
    }
}

/// Reference to one stored chunk of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    /// Position within the bundle, starting at 0
    pub index: u32,
    /// Object store key
    pub storage_key: String,
    /// Hex SHA-256 of the compressed bytes
    pub checksum: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
}

/// Aggregate size information for a bundle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub total_size: u64,
    pub compressed_size: u64,
    /// `compressed_size / total_size`, 0 for empty bundles
    pub compression_ratio: f64,
    pub chunk_count: u32,
}

impl BundleMetadata {
    pub fn from_chunks(chunks: &[ChunkRef]) -> Self {
        let total_size: u64 = chunks.iter().map(|c| c.size).sum();
        let compressed_size: u64 = chunks.iter().map(|c| c.compressed_size).sum();
        let compression_ratio = if total_size == 0 {
            0.0
        } else {
            compressed_size as f64 / total_size as f64
        };
        Self {
            total_size,
            compressed_size,
            compression_ratio,
            chunk_count: chunks.len() as u32,
        }
    }
}

/// An immutable, versioned, chunked artifact of one document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub id: BundleId,
    pub document_id: DocumentId,
    pub version: String,
    pub status: BundleStatus,
    /// Chunk list; empty until the bundle is READY
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub metadata: BundleMetadata,
    /// Digest over the ordered chunk checksums, set once READY
    pub manifest_checksum: Option<String>,
    /// Failure reason for ERROR bundles
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Bundle {
    pub fn is_ready(&self) -> bool {
        self.status == BundleStatus::Ready
    }
}

/// Published chunk list of a READY bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub bundle_id: BundleId,
    pub document_id: DocumentId,
    pub version: String,
    pub checksum: String,
    pub chunks: Vec<ChunkRef>,
    pub metadata: BundleMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Manifest {
    /// Ordered chunk checksums
    pub fn checksums(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.checksum.clone()).collect()
    }

    pub fn chunk(&self, index: u32) -> Option<&ChunkRef> {
        self.chunks.get(index as usize)
    }
}

/// A device's last-confirmed view of one document's bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub device_id: DeviceId,
    pub document_id: DocumentId,
    pub bundle_id: BundleId,
    pub bundle_version: String,
    pub manifest_checksum: String,
    pub chunk_checksums: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

impl CacheManifest {
    /// The report a device holding this cache sends with a sync check
    pub fn to_report(&self) -> CachedManifestReport {
        CachedManifestReport {
            bundle_id: self.bundle_id.clone(),
            version: self.bundle_version.clone(),
            manifest_checksum: self.manifest_checksum.clone(),
            chunk_checksums: self.chunk_checksums.clone(),
            last_modified: Some(self.last_modified),
        }
    }
}

/// Classification of the work a device needs for one bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    Full,
    Incremental,
    None,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
            SyncKind::None => "none",
        }
    }
}

impl std::str::FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncKind::Full),
            "incremental" => Ok(SyncKind::Incremental),
            "none" => Ok(SyncKind::None),
            _ => Err(format!("Unknown sync kind: {}", s)),
        }
    }
}

/// Sync job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Instruction to reuse a chunk the device already holds at another index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReuse {
    pub target_index: u32,
    pub source_index: u32,
}

/// A unit of work bringing one device's cache of one bundle up to date
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: JobId,
    pub device_id: DeviceId,
    pub document_id: DocumentId,
    pub bundle_id: BundleId,
    pub bundle_version: String,
    pub kind: SyncKind,
    pub status: JobStatus,
    pub chunk_indices: Vec<u32>,
    #[serde(default)]
    pub reuse: Vec<ChunkReuse>,
    /// Chunk checksums the device reported when the job was planned
    #[serde(default)]
    pub base_checksums: Vec<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Device-facing wire types
// ============================================================================

/// Connectivity class reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Wifi,
    Ethernet,
    Cellular,
    Offline,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Device conditions attached to a sync check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub network: NetworkClass,
    pub available_storage_bytes: Option<u64>,
    pub app_version: Option<String>,
}

/// One cached bundle as reported by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedManifestReport {
    pub bundle_id: BundleId,
    pub version: String,
    pub manifest_checksum: String,
    #[serde(default)]
    pub chunk_checksums: Vec<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckRequest {
    pub device_id: DeviceId,
    #[serde(default)]
    pub cached_manifests: Vec<CachedManifestReport>,
    #[serde(default)]
    pub device_status: DeviceStatus,
}

/// Job as returned to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobSummary {
    /// Persisted job id; absent for deferred jobs
    pub job_id: Option<JobId>,
    pub bundle_id: BundleId,
    pub document_id: DocumentId,
    pub version: String,
    pub kind: SyncKind,
    pub chunk_indices: Vec<u32>,
    #[serde(default)]
    pub reuse: Vec<ChunkReuse>,
    /// Compressed bytes the device will download
    pub estimated_bytes: u64,
    /// Held back because of the device's network or storage conditions
    pub deferred: bool,
}

/// Client-side policies pushed with every sync check response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPolicies {
    pub sync_interval_secs: u64,
    pub max_cache_bytes: u64,
    pub cellular_max_bytes: u64,
    pub signed_url_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckResponse {
    pub needs_sync: bool,
    pub sync_jobs: Vec<SyncJobSummary>,
    pub policies: ClientPolicies,
    pub feature_flags: BTreeMap<String, bool>,
}

/// Which part of a device's cache an invalidation covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationScope {
    All,
    Document {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
    Bundle {
        #[serde(rename = "bundleId")]
        bundle_id: BundleId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInvalidationRequest {
    pub device_ids: Vec<DeviceId>,
    pub scope: InvalidationScope,
}

/// Per-device outcome of a cache invalidation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInvalidationResult {
    pub device_id: DeviceId,
    /// Documents whose cache was cleared
    pub deleted_caches: u64,
    /// Cache manifest records removed
    pub deleted_manifests: u64,
    /// Chunk checksum entries removed
    pub deleted_chunks: u64,
}

/// Entitlement of a device to read a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub device_id: DeviceId,
    pub document_id: DocumentId,
    /// Serve this version instead of the latest READY one
    pub pinned_version: Option<String>,
}

/// Enrolled device record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub network: NetworkClass,
    pub available_storage_bytes: Option<u64>,
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub bundles_ready: i64,
    pub bundles_generating: i64,
    pub bundles_error: i64,
    pub bundles_retired: i64,
    pub chunks: i64,
    pub devices: i64,
    pub cache_manifests: i64,
    pub jobs_pending: i64,
    pub jobs_running: i64,
    pub jobs_failed: i64,
    pub db_size_bytes: i64,
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_optional_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_db_strings() {
        for status in [
            BundleStatus::Generating,
            BundleStatus::Ready,
            BundleStatus::Error,
            BundleStatus::Retired,
        ] {
            assert_eq!(status.as_str().parse::<BundleStatus>(), Ok(status));
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_metadata_from_chunks() {
        let chunks = vec![
            ChunkRef {
                index: 0,
                storage_key: "a".into(),
                checksum: "x".into(),
                size: 100,
                compressed_size: 40,
            },
            ChunkRef {
                index: 1,
                storage_key: "b".into(),
                checksum: "y".into(),
                size: 100,
                compressed_size: 10,
            },
        ];
        let meta = BundleMetadata::from_chunks(&chunks);
        assert_eq!(meta.total_size, 200);
        assert_eq!(meta.compressed_size, 50);
        assert_eq!(meta.chunk_count, 2);
        assert!((meta.compression_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(BundleMetadata::from_chunks(&[]).compression_ratio, 0.0);
    }

    #[test]
    fn test_sync_check_request_wire_format() {
        let json = r#"{
            "deviceId": "dev-1",
            "cachedManifests": [{
                "bundleId": "b1",
                "version": "1.0.0",
                "manifestChecksum": "abc",
                "chunkChecksums": ["a", "b"],
                "lastModified": "2024-01-01T00:00:00Z"
            }],
            "deviceStatus": {"network": "satellite", "availableStorageBytes": 1024}
        }"#;
        let request: SyncCheckRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.cached_manifests[0].chunk_checksums.len(), 2);
        assert_eq!(request.device_status.network, NetworkClass::Unknown);
        assert_eq!(request.device_status.available_storage_bytes, Some(1024));
    }

    #[test]
    fn test_invalidation_scope_wire_format() {
        let scope: InvalidationScope =
            serde_json::from_str(r#"{"type": "document", "documentId": "manual-7"}"#).unwrap();
        assert_eq!(
            scope,
            InvalidationScope::Document {
                document_id: "manual-7".into()
            }
        );
        let all: InvalidationScope = serde_json::from_str(r#"{"type": "all"}"#).unwrap();
        assert_eq!(all, InvalidationScope::All);
    }
}
