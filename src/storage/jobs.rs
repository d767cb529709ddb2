//! Sync job records
//!
//! The partial unique index `idx_sync_jobs_active` is the compare-and-swap
//! that keeps a device from having two PENDING/RUNNING jobs for the same
//! document: a losing insert reads back the job that won.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::bundles::is_constraint_violation;
use super::{json_column, parse_column};
use crate::error::{BundlecastError, Result};
use crate::types::*;

const JOB_COLUMNS: &str = "id, device_id, document_id, bundle_id, bundle_version, kind, status,
    chunk_indices, reuse, base_checksums, attempts, last_error, created_at, started_at, completed_at";

/// Outcome of [`insert_job`]
#[derive(Debug, Clone)]
pub enum JobInsert {
    Created(SyncJob),
    /// Another job was already active for the device and document
    Existing(SyncJob),
}

impl JobInsert {
    pub fn into_job(self) -> SyncJob {
        match self {
            JobInsert::Created(job) | JobInsert::Existing(job) => job,
        }
    }
}

pub fn job_from_row(row: &Row) -> rusqlite::Result<SyncJob> {
    let attempts: i64 = row.get("attempts")?;
    let created_at: String = row.get("created_at")?;

    Ok(SyncJob {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        document_id: row.get("document_id")?,
        bundle_id: row.get("bundle_id")?,
        bundle_version: row.get("bundle_version")?,
        kind: parse_column(row, "kind")?,
        status: parse_column(row, "status")?,
        chunk_indices: json_column(row, "chunk_indices")?,
        reuse: json_column(row, "reuse")?,
        base_checksums: json_column(row, "base_checksums")?,
        attempts: attempts as u32,
        last_error: row.get("last_error")?,
        created_at: parse_timestamp(&created_at),
        started_at: parse_optional_timestamp(row.get("started_at")?),
        completed_at: parse_optional_timestamp(row.get("completed_at")?),
    })
}

/// Persist a new PENDING job unless one is already active
pub fn insert_job(conn: &Connection, job: &SyncJob) -> Result<JobInsert> {
    let result = conn.execute(
        "INSERT INTO sync_jobs
            (id, device_id, document_id, bundle_id, bundle_version, kind, status,
             chunk_indices, reuse, base_checksums, created_at)
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)",
        params![
            job.id,
            job.device_id,
            job.document_id,
            job.bundle_id,
            job.bundle_version,
            job.kind.as_str(),
            serde_json::to_string(&job.chunk_indices)?,
            serde_json::to_string(&job.reuse)?,
            serde_json::to_string(&job.base_checksums)?,
            job.created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(JobInsert::Created(get_job(conn, &job.id)?)),
        Err(e) if is_constraint_violation(&e) => {
            match active_job(conn, &job.device_id, &job.document_id)? {
                Some(existing) => Ok(JobInsert::Existing(existing)),
                None => Err(BundlecastError::Conflict(format!(
                    "Job {} collided without an active job",
                    job.id
                ))),
            }
        }
        Err(e) => Err(e.into()),
    }
}

pub fn find_job(conn: &Connection, id: &str) -> Result<Option<SyncJob>> {
    let sql = format!("SELECT {} FROM sync_jobs WHERE id = ?", JOB_COLUMNS);
    Ok(conn.query_row(&sql, params![id], job_from_row).optional()?)
}

pub fn get_job(conn: &Connection, id: &str) -> Result<SyncJob> {
    find_job(conn, id)?.ok_or_else(|| BundlecastError::not_found("sync job", id))
}

/// PENDING or RUNNING job of a device for a document
pub fn active_job(
    conn: &Connection,
    device_id: &str,
    document_id: &str,
) -> Result<Option<SyncJob>> {
    let sql = format!(
        "SELECT {} FROM sync_jobs
         WHERE device_id = ? AND document_id = ? AND status IN ('pending', 'running')",
        JOB_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![device_id, document_id], job_from_row)
        .optional()?)
}

pub fn list_jobs(conn: &Connection, device_id: &str) -> Result<Vec<SyncJob>> {
    let sql = format!(
        "SELECT {} FROM sync_jobs WHERE device_id = ? ORDER BY created_at DESC",
        JOB_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params![device_id], job_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(jobs)
}

/// Oldest PENDING job ids
pub fn pending_job_ids(conn: &Connection, limit: usize) -> Result<Vec<JobId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM sync_jobs WHERE status = 'pending' ORDER BY created_at LIMIT ?",
    )?;
    let ids = stmt
        .query_map(params![limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// PENDING → RUNNING. Returns `None` when another worker claimed it first.
pub fn claim_job(conn: &Connection, id: &str) -> Result<Option<SyncJob>> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET status = 'running', started_at = ?, attempts = attempts + 1
         WHERE id = ? AND status = 'pending'",
        params![Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(get_job(conn, id)?))
}

pub fn complete_job(conn: &Connection, id: &str) -> Result<()> {
    finish_job(conn, id, JobStatus::Completed, None)
}

pub fn fail_job(conn: &Connection, id: &str, error: &str) -> Result<()> {
    finish_job(conn, id, JobStatus::Failed, Some(error))
}

fn finish_job(conn: &Connection, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE sync_jobs SET status = ?, last_error = ?, completed_at = ?
         WHERE id = ? AND status = 'running'",
        params![status.as_str(), error, Utc::now().to_rfc3339(), id],
    )?;
    if changed == 0 {
        return Err(BundlecastError::Conflict(format!(
            "Sync job {} is not running",
            id
        )));
    }
    Ok(())
}

/// FAILED → PENDING, subject to the one-active-job rule
pub fn retry_job(conn: &Connection, id: &str) -> Result<SyncJob> {
    let job = get_job(conn, id)?;
    if job.status != JobStatus::Failed {
        return Err(BundlecastError::Conflict(format!(
            "Sync job {} is {} and cannot be retried",
            id,
            job.status.as_str()
        )));
    }
    let result = conn.execute(
        "UPDATE sync_jobs SET status = 'pending', started_at = NULL, completed_at = NULL
         WHERE id = ? AND status = 'failed'",
        params![id],
    );
    match result {
        Ok(_) => get_job(conn, id),
        Err(e) if is_constraint_violation(&e) => Err(BundlecastError::Conflict(format!(
            "Device {} already has an active job for {}",
            job.device_id, job.document_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// RUNNING → FAILED for jobs claimed before `cutoff` whose worker never
/// finished them. Frees the active-job slot so the next check plans afresh.
pub fn fail_stale_running(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<SyncJob>> {
    let sql = format!(
        "SELECT {} FROM sync_jobs WHERE status = 'running' AND started_at < ?",
        JOB_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let stale = stmt
        .query_map(params![cutoff.to_rfc3339()], job_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let now = Utc::now().to_rfc3339();
    let mut failed = Vec::with_capacity(stale.len());
    for mut job in stale {
        let changed = conn.execute(
            "UPDATE sync_jobs SET status = 'failed', last_error = 'timed out', completed_at = ?
             WHERE id = ? AND status = 'running'",
            params![now, job.id],
        )?;
        if changed > 0 {
            job.status = JobStatus::Failed;
            job.last_error = Some("timed out".to_string());
            failed.push(job);
        }
    }
    Ok(failed)
}

/// Fail PENDING jobs of a device, optionally restricted to one document
pub fn cancel_pending_jobs(
    conn: &Connection,
    device_id: &str,
    document_id: Option<&str>,
) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let changed = match document_id {
        Some(doc) => conn.execute(
            "UPDATE sync_jobs SET status = 'failed', last_error = 'cancelled', completed_at = ?
             WHERE device_id = ? AND document_id = ? AND status = 'pending'",
            params![now, device_id, doc],
        )?,
        None => conn.execute(
            "UPDATE sync_jobs SET status = 'failed', last_error = 'cancelled', completed_at = ?
             WHERE device_id = ? AND status = 'pending'",
            params![now, device_id],
        )?,
    };
    Ok(changed)
}
