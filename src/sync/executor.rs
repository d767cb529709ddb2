//! Sync job executor
//!
//! Runs one claimed job: fetches the job's divergent chunks from the chunk
//! source, verifies each against the manifest checksum before handing it to
//! the sink, and records the device's new cache manifest. Chunks the device
//! already holds are never downloaded.
//!
//! A job with failed chunks still records what was verified, so the next
//! sync check only asks for the remainder.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;

use super::sink::ChunkSink;
use crate::codec;
use crate::config::SyncPolicy;
use crate::error::{BundlecastError, Result};
use crate::retry::with_retry;
use crate::storage::cache::{cache_manifest_for, put_cache_manifest};
use crate::storage::jobs;
use crate::storage::{bundles, log_audit, AuditAction, Storage};
use crate::types::*;

/// Where the executor downloads chunk bytes from
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn fetch_chunk(&self, bundle_id: &str, chunk: &ChunkRef) -> Result<Vec<u8>>;
}

/// Outcome of one executed job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: JobId,
    pub device_id: DeviceId,
    pub bundle_id: BundleId,
    pub status: JobStatus,
    pub fetched: Vec<u32>,
    pub reused: Vec<u32>,
    pub failed: Vec<u32>,
    pub bytes_fetched: u64,
    pub error: Option<String>,
}

impl JobReport {
    fn new(job: &SyncJob) -> Self {
        Self {
            job_id: job.id.clone(),
            device_id: job.device_id.clone(),
            bundle_id: job.bundle_id.clone(),
            status: JobStatus::Running,
            fetched: vec![],
            reused: vec![],
            failed: vec![],
            bytes_fetched: 0,
            error: None,
        }
    }
}

pub struct SyncExecutor {
    storage: Storage,
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
    policy: SyncPolicy,
}

impl SyncExecutor {
    pub fn new(
        storage: Storage,
        source: Arc<dyn ChunkSource>,
        sink: Arc<dyn ChunkSink>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            storage,
            source,
            sink,
            policy,
        }
    }

    /// Claim and run a job. Returns `None` if the job was not PENDING.
    pub async fn run_job(&self, job_id: &str) -> Result<Option<JobReport>> {
        let job = match self
            .storage
            .with_connection(|conn| jobs::claim_job(conn, job_id))?
        {
            Some(job) => job,
            None => {
                tracing::debug!(job_id, "Job not pending, skipping");
                return Ok(None);
            }
        };

        let mut report = JobReport::new(&job);
        let outcome = self.execute(&job, &mut report).await;

        let error = match outcome {
            Ok(()) if report.failed.is_empty() => None,
            Ok(()) => Some(format!(
                "{} of {} chunks failed: {}",
                report.failed.len(),
                report.failed.len() + report.fetched.len(),
                report.error.clone().unwrap_or_default()
            )),
            Err(e) => {
                if report.failed.is_empty() {
                    report.failed = job.chunk_indices.clone();
                }
                Some(e.to_string())
            }
        };

        match error {
            None => {
                self.storage
                    .with_connection(|conn| jobs::complete_job(conn, &job.id))?;
                report.status = JobStatus::Completed;
                tracing::info!(
                    job_id = %job.id,
                    device_id = %job.device_id,
                    bundle_id = %job.bundle_id,
                    fetched = report.fetched.len(),
                    reused = report.reused.len(),
                    bytes = report.bytes_fetched,
                    "Sync job completed"
                );
            }
            Some(message) => {
                self.storage.with_transaction(|conn| {
                    jobs::fail_job(conn, &job.id, &message)?;
                    log_audit(
                        conn,
                        AuditAction::JobFailed,
                        Some(&job.device_id),
                        Some(&job.bundle_id),
                        Some(&json!({
                            "jobId": job.id,
                            "failedChunks": report.failed,
                            "error": message,
                        })),
                    )?;
                    Ok(())
                })?;
                tracing::warn!(
                    job_id = %job.id,
                    device_id = %job.device_id,
                    bundle_id = %job.bundle_id,
                    "Sync job failed: {}",
                    message
                );
                report.status = JobStatus::Failed;
                report.error = Some(message);
            }
        }

        Ok(Some(report))
    }

    async fn execute(&self, job: &SyncJob, report: &mut JobReport) -> Result<()> {
        let bundle = self
            .storage
            .with_connection(|conn| bundles::find_bundle(conn, &job.bundle_id))?
            .ok_or_else(|| BundlecastError::not_found("bundle", &job.bundle_id))?;
        if !bundle.is_ready() {
            return Err(BundlecastError::Sync(format!(
                "Bundle {} is {}",
                bundle.id,
                bundle.status.as_str()
            )));
        }

        let authoritative: Vec<&str> = bundle.chunks.iter().map(|c| c.checksum.as_str()).collect();
        let base = &job.base_checksums;
        let holds = |index: usize, checksum: &str| base.get(index).map(String::as_str) == Some(checksum);

        // Device view after the job: unchanged positions keep what the device had
        let mut working: Vec<String> = authoritative
            .iter()
            .enumerate()
            .map(|(i, auth)| {
                if holds(i, auth) {
                    auth.to_string()
                } else {
                    base.get(i).cloned().unwrap_or_default()
                }
            })
            .collect();

        let mut fetch: Vec<u32> = job
            .chunk_indices
            .iter()
            .copied()
            .filter(|&i| (i as usize) < authoritative.len())
            .collect();

        for reuse in &job.reuse {
            let target = reuse.target_index as usize;
            let Some(wanted) = authoritative.get(target) else {
                continue;
            };
            if holds(reuse.source_index as usize, wanted) {
                working[target] = wanted.to_string();
                report.reused.push(reuse.target_index);
            } else {
                fetch.push(reuse.target_index);
            }
        }
        fetch.sort_unstable();
        fetch.dedup();

        let results: Vec<(u32, Result<u64>)> = stream::iter(fetch)
            .map(|index| {
                let chunk = &bundle.chunks[index as usize];
                async move { (index, self.fetch_and_store(job, chunk).await) }
            })
            .buffer_unordered(self.policy.fetch_concurrency.max(1))
            .collect()
            .await;

        for (index, result) in results {
            match result {
                Ok(bytes) => {
                    working[index as usize] = authoritative[index as usize].to_string();
                    report.fetched.push(index);
                    report.bytes_fetched += bytes;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        bundle_id = %bundle.id,
                        index,
                        "Chunk fetch failed: {}",
                        e
                    );
                    report.failed.push(index);
                    report.error = Some(e.to_string());
                }
            }
        }
        report.fetched.sort_unstable();
        report.failed.sort_unstable();

        let manifest = cache_manifest_for(
            &job.device_id,
            &job.document_id,
            &bundle.id,
            &bundle.version,
            working,
        );
        self.sink.commit(&manifest).await?;
        self.storage
            .with_transaction(|conn| put_cache_manifest(conn, &manifest))?;
        Ok(())
    }

    /// Download, verify and store one chunk; returns its compressed size
    async fn fetch_and_store(&self, job: &SyncJob, chunk: &ChunkRef) -> Result<u64> {
        let what = format!("Fetch of chunk {} of {}", chunk.index, job.bundle_id);
        let bytes = with_retry(
            &what,
            self.policy.fetch_attempts,
            self.policy.retry_backoff_ms,
            || async {
                let bytes = self.source.fetch_chunk(&job.bundle_id, chunk).await?;
                let actual = codec::checksum(&bytes);
                if actual != chunk.checksum {
                    return Err(BundlecastError::Integrity {
                        key: chunk.storage_key.clone(),
                        expected: chunk.checksum.clone(),
                        actual,
                    });
                }
                Ok(bytes)
            },
        )
        .await?;

        self.sink
            .store_chunk(&job.device_id, &job.document_id, &chunk.checksum, &bytes)
            .await?;
        Ok(bytes.len() as u64)
    }

    /// Run up to `limit` PENDING jobs, oldest first
    pub async fn run_pending(&self, limit: usize) -> Result<Vec<JobReport>> {
        let ids = self
            .storage
            .with_connection(|conn| jobs::pending_job_ids(conn, limit))?;
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(report) = self.run_job(&id).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{chunk_key, MemoryObjectStore, ObjectMeta, ObjectStore};
    use crate::storage::cache::get_cache_manifest;
    use crate::storage::devices;
    use crate::sync::{DiscardChunkSink, FsChunkSink};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// Serves chunks from memory, optionally corrupting some fetches
    #[derive(Default)]
    struct TestSource {
        objects: MemoryObjectStore,
        corrupt_left: Mutex<HashMap<u32, u32>>,
        fetches: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ChunkSource for TestSource {
        async fn fetch_chunk(&self, _bundle_id: &str, chunk: &ChunkRef) -> Result<Vec<u8>> {
            self.fetches.lock().push(chunk.index);
            let bytes = self.objects.get(&chunk.storage_key).await?;
            let mut corrupt = self.corrupt_left.lock();
            if let Some(left) = corrupt.get_mut(&chunk.index) {
                if *left > 0 {
                    *left -= 1;
                    return Ok(b"garbage".to_vec());
                }
            }
            Ok(bytes)
        }
    }

    async fn seed_bundle(
        storage: &Storage,
        source: &TestSource,
        bundle_id: &str,
        version: &str,
        payloads: &[&[u8]],
    ) -> Vec<String> {
        let mut chunks = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let key = chunk_key(bundle_id, i as u32);
            source
                .objects
                .put(&key, payload.to_vec(), ObjectMeta::new("application/gzip"))
                .await
                .unwrap();
            chunks.push(ChunkRef {
                index: i as u32,
                storage_key: key,
                checksum: codec::checksum(payload),
                size: payload.len() as u64,
                compressed_size: payload.len() as u64,
            });
        }
        let checksums: Vec<String> = chunks.iter().map(|c| c.checksum.clone()).collect();
        storage
            .with_connection(|conn| {
                bundles::insert_generating_bundle(conn, bundle_id, "doc", version, None)?;
                for chunk in &chunks {
                    bundles::record_chunk(conn, bundle_id, chunk)?;
                }
                bundles::mark_ready(
                    conn,
                    bundle_id,
                    &codec::manifest_checksum(&checksums),
                    "m",
                    &BundleMetadata::from_chunks(&chunks),
                )
            })
            .unwrap();
        checksums
    }

    fn enqueue(
        storage: &Storage,
        bundle_id: &str,
        indices: Vec<u32>,
        reuse: Vec<ChunkReuse>,
        base: Vec<String>,
    ) -> String {
        let job = SyncJob {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: "dev".into(),
            document_id: "doc".into(),
            bundle_id: bundle_id.into(),
            bundle_version: "1.0.0".into(),
            kind: SyncKind::Incremental,
            status: JobStatus::Pending,
            chunk_indices: indices,
            reuse,
            base_checksums: base,
            attempts: 0,
            last_error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        };
        storage
            .with_connection(|conn| jobs::insert_job(conn, &job))
            .unwrap()
            .into_job()
            .id
    }

    fn policy() -> SyncPolicy {
        SyncPolicy {
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn setup() -> (Storage, Arc<TestSource>) {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| devices::enroll_device(conn, "dev").map(|_| ()))
            .unwrap();
        (storage, Arc::new(TestSource::default()))
    }

    #[tokio::test]
    async fn test_incremental_job_fetches_only_divergent_chunks() {
        let (storage, source) = setup();
        let old = seed_bundle(&storage, &source, "v1", "1.0.0", &[b"a", b"b", b"c"]).await;
        let new = seed_bundle(&storage, &source, "v2", "1.0.1", &[b"a", b"x", b"c"]).await;

        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(FsChunkSink::new(dir.path()).await.unwrap());
        for checksum in &old {
            sink.store_chunk("dev", "doc", checksum, b"cached").await.unwrap();
        }

        let executor = SyncExecutor::new(storage.clone(), source.clone(), sink.clone(), policy());
        let job_id = enqueue(&storage, "v2", vec![1], vec![], old.clone());
        let report = executor.run_job(&job_id).await.unwrap().unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.fetched, vec![1]);
        assert_eq!(*source.fetches.lock(), vec![1]);

        let cached = storage
            .with_connection(|conn| get_cache_manifest(conn, "dev", "doc"))
            .unwrap()
            .unwrap();
        assert_eq!(cached.chunk_checksums, new);
        assert_eq!(cached.bundle_id, "v2");
        assert_eq!(cached.manifest_checksum, codec::manifest_checksum(&new));

        // The replaced chunk was pruned from the device cache
        assert!(!sink.has_chunk("dev", "doc", &old[1]).await.unwrap());
        assert!(sink.has_chunk("dev", "doc", &new[1]).await.unwrap());

        let job = storage.with_connection(|conn| jobs::get_job(conn, &job_id)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        // A finished job cannot be run again
        assert!(executor.run_job(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reuse_skips_download() {
        let (storage, source) = setup();
        let old = seed_bundle(&storage, &source, "v1", "1.0.0", &[b"a", b"b"]).await;
        seed_bundle(&storage, &source, "v2", "1.0.1", &[b"n", b"a", b"b"]).await;

        let executor = SyncExecutor::new(
            storage.clone(),
            source.clone(),
            Arc::new(DiscardChunkSink),
            policy(),
        );
        let reuse = vec![
            ChunkReuse { target_index: 1, source_index: 0 },
            ChunkReuse { target_index: 2, source_index: 1 },
        ];
        let job_id = enqueue(&storage, "v2", vec![0], reuse, old);
        let report = executor.run_job(&job_id).await.unwrap().unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.fetched, vec![0]);
        assert_eq!(report.reused, vec![1, 2]);
        assert_eq!(*source.fetches.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_retried() {
        let (storage, source) = setup();
        seed_bundle(&storage, &source, "v1", "1.0.0", &[b"a", b"b"]).await;
        source.corrupt_left.lock().insert(1, 2);

        let executor = SyncExecutor::new(
            storage.clone(),
            source.clone(),
            Arc::new(DiscardChunkSink),
            policy(),
        );
        let job_id = enqueue(&storage, "v1", vec![0, 1], vec![], vec![]);
        let report = executor.run_job(&job_id).await.unwrap().unwrap();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.fetched, vec![0, 1]);
        assert_eq!(source.fetches.lock().iter().filter(|&&i| i == 1).count(), 3);
    }

    #[tokio::test]
    async fn test_persistent_corruption_fails_job_and_keeps_verified_chunks() {
        let (storage, source) = setup();
        let checksums = seed_bundle(&storage, &source, "v1", "1.0.0", &[b"a", b"b"]).await;
        source.corrupt_left.lock().insert(1, u32::MAX);

        let executor = SyncExecutor::new(
            storage.clone(),
            source.clone(),
            Arc::new(DiscardChunkSink),
            policy(),
        );
        let job_id = enqueue(&storage, "v1", vec![0, 1], vec![], vec![]);
        let report = executor.run_job(&job_id).await.unwrap().unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.failed, vec![1]);

        let cached = storage
            .with_connection(|conn| get_cache_manifest(conn, "dev", "doc"))
            .unwrap()
            .unwrap();
        assert_eq!(cached.chunk_checksums, vec![checksums[0].clone(), String::new()]);

        let job = storage.with_connection(|conn| jobs::get_job(conn, &job_id)).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("1 of 2 chunks failed"));
    }

    #[tokio::test]
    async fn test_job_for_retired_bundle_fails() {
        let (storage, source) = setup();
        seed_bundle(&storage, &source, "v1", "1.0.0", &[b"a"]).await;
        storage
            .with_connection(|conn| bundles::mark_retired(conn, "v1"))
            .unwrap();

        let executor = SyncExecutor::new(
            storage.clone(),
            source.clone(),
            Arc::new(DiscardChunkSink),
            policy(),
        );
        let job_id = enqueue(&storage, "v1", vec![0], vec![], vec![]);
        let reports = executor.run_pending(10).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id, job_id);
        assert_eq!(reports[0].status, JobStatus::Failed);
        assert!(source.fetches.lock().is_empty());
    }
}
