//! Background sync worker
//!
//! Drains PENDING jobs: jobs are picked up when enqueued explicitly, on an
//! explicit poll, and on every poll interval tick.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::executor::SyncExecutor;
use crate::error::{BundlecastError, Result};
use crate::storage::{jobs, Storage};
use crate::types::JobId;

/// Jobs fetched from the database per poll
const POLL_BATCH: usize = 64;

/// Commands for the sync worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run one job now
    Enqueue(JobId),
    /// Look for PENDING jobs without waiting for the next tick
    Poll,
    /// Stop the worker
    Stop,
}

/// Handle to a running sync worker
pub struct SyncWorker {
    sender: Sender<WorkerCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Start the worker on the current runtime
    pub fn start(
        storage: Storage,
        executor: Arc<SyncExecutor>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let (sender, receiver) = bounded::<WorkerCommand>(1024);
        let handle = tokio::spawn(run(
            storage,
            executor,
            receiver,
            concurrency.max(1),
            poll_interval,
        ));
        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Run a job as soon as possible
    pub async fn enqueue(&self, job_id: impl Into<JobId>) -> Result<()> {
        self.send(WorkerCommand::Enqueue(job_id.into())).await
    }

    /// Trigger an immediate poll for PENDING jobs
    pub async fn poll_now(&self) -> Result<()> {
        self.send(WorkerCommand::Poll).await
    }

    /// Stop the worker and wait for in-flight jobs to finish. Stopping a
    /// stopped worker is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.send(WorkerCommand::Stop).await?;
        handle
            .await
            .map_err(|e| BundlecastError::Internal(format!("Sync worker panicked: {}", e)))
    }

    async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| BundlecastError::Sync("Worker channel closed".to_string()))
    }
}

async fn run(
    storage: Storage,
    executor: Arc<SyncExecutor>,
    receiver: Receiver<WorkerCommand>,
    concurrency: usize,
    poll_interval: Duration,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(concurrency, ?poll_interval, "Sync worker started");

    loop {
        tokio::select! {
            command = receiver.recv() => {
                match command {
                    Ok(WorkerCommand::Enqueue(job_id)) => {
                        run_jobs(&executor, vec![job_id], concurrency).await;
                    }
                    Ok(WorkerCommand::Poll) => poll(&storage, &executor, concurrency).await,
                    Ok(WorkerCommand::Stop) | Err(_) => break,
                }
            }
            _ = ticker.tick() => poll(&storage, &executor, concurrency).await,
        }
    }

    tracing::info!("Sync worker stopped");
}

async fn poll(storage: &Storage, executor: &SyncExecutor, concurrency: usize) {
    match storage.with_connection(|conn| jobs::pending_job_ids(conn, POLL_BATCH)) {
        Ok(ids) if ids.is_empty() => {}
        Ok(ids) => run_jobs(executor, ids, concurrency).await,
        Err(e) => tracing::error!("Failed to list pending sync jobs: {}", e),
    }
}

async fn run_jobs(executor: &SyncExecutor, ids: Vec<JobId>, concurrency: usize) {
    stream::iter(ids)
        .for_each_concurrent(concurrency, |job_id| async move {
            if let Err(e) = executor.run_job(&job_id).await {
                tracing::error!(job_id = %job_id, "Sync job errored: {}", e);
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::storage::devices;
    use crate::sync::{ChunkSource, DiscardChunkSink};
    use crate::types::*;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl ChunkSource for EmptySource {
        async fn fetch_chunk(&self, _: &str, chunk: &ChunkRef) -> Result<Vec<u8>> {
            Err(BundlecastError::not_found("object", &chunk.storage_key))
        }
    }

    #[tokio::test]
    async fn test_worker_drains_pending_jobs() {
        let storage = Storage::open_in_memory().unwrap();
        let job = SyncJob {
            id: "job-1".into(),
            device_id: "dev".into(),
            document_id: "doc".into(),
            bundle_id: "missing".into(),
            bundle_version: "1.0.0".into(),
            kind: SyncKind::Full,
            status: JobStatus::Pending,
            chunk_indices: vec![0],
            reuse: vec![],
            base_checksums: vec![],
            attempts: 0,
            last_error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        };
        storage
            .with_connection(|conn| {
                devices::enroll_device(conn, "dev")?;
                jobs::insert_job(conn, &job)?;
                Ok(())
            })
            .unwrap();

        let executor = Arc::new(SyncExecutor::new(
            storage.clone(),
            Arc::new(EmptySource),
            Arc::new(DiscardChunkSink),
            SyncPolicy::default(),
        ));
        let worker = SyncWorker::start(
            storage.clone(),
            executor,
            2,
            Duration::from_secs(3600),
        );
        worker.poll_now().await.unwrap();

        let mut status = JobStatus::Pending;
        for _ in 0..100 {
            status = storage
                .with_connection(|conn| jobs::get_job(conn, "job-1"))
                .unwrap()
                .status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The bundle does not exist, so the job fails rather than hanging
        assert_eq!(status, JobStatus::Failed);

        worker.stop().await.unwrap();
        worker.stop().await.unwrap();
    }
}
