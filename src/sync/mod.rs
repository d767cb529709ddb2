//! Device synchronization
//!
//! The coordinator diffs what a device reports holding against the
//! authoritative manifest and emits sync jobs; the executor fulfils a job by
//! fetching only the divergent chunks and recording the device's new cache
//! state; the worker drains PENDING jobs in the background.

pub mod coordinator;
pub mod executor;
mod sink;
mod worker;

pub use coordinator::{plan_sync, SyncCoordinator, SyncPlan};
pub use executor::{ChunkSource, JobReport, SyncExecutor};
pub use sink::{ChunkSink, DiscardChunkSink, FsChunkSink};
pub use worker::{SyncWorker, WorkerCommand};
