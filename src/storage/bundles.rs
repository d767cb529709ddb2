//! Bundle and chunk records

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::parse_column;
use crate::error::{BundlecastError, Result};
use crate::types::*;

const BUNDLE_COLUMNS: &str = "id, document_id, version, status, manifest_checksum,
    total_size, compressed_size, chunk_count, error, created_at, updated_at, expires_at";

/// Parse a bundle (without chunks) from a database row
pub fn bundle_from_row(row: &Row) -> rusqlite::Result<Bundle> {
    let total_size: i64 = row.get("total_size")?;
    let compressed_size: i64 = row.get("compressed_size")?;
    let chunk_count: i64 = row.get("chunk_count")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;

    let compression_ratio = if total_size == 0 {
        0.0
    } else {
        compressed_size as f64 / total_size as f64
    };

    Ok(Bundle {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        version: row.get("version")?,
        status: parse_column(row, "status")?,
        chunks: vec![],
        metadata: BundleMetadata {
            total_size: total_size as u64,
            compressed_size: compressed_size as u64,
            compression_ratio,
            chunk_count: chunk_count as u32,
        },
        manifest_checksum: row.get("manifest_checksum")?,
        error: row.get("error")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        expires_at: parse_optional_timestamp(expires_at),
    })
}

fn chunk_from_row(row: &Row) -> rusqlite::Result<ChunkRef> {
    let index: i64 = row.get("chunk_index")?;
    let size: i64 = row.get("size")?;
    let compressed_size: i64 = row.get("compressed_size")?;
    Ok(ChunkRef {
        index: index as u32,
        storage_key: row.get("storage_key")?,
        checksum: row.get("checksum")?,
        size: size as u64,
        compressed_size: compressed_size as u64,
    })
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Insert a new GENERATING bundle.
///
/// Fails with [`BundlecastError::BuildInProgress`] when the document already
/// has a build in flight.
pub fn insert_generating_bundle(
    conn: &Connection,
    id: &str,
    document_id: &str,
    version: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<Bundle> {
    let now = Utc::now().to_rfc3339();
    let result = conn.execute(
        "INSERT INTO bundles (id, document_id, version, status, created_at, updated_at, expires_at)
         VALUES (?, ?, ?, 'generating', ?, ?, ?)",
        params![
            id,
            document_id,
            version,
            now,
            now,
            expires_at.map(|dt| dt.to_rfc3339())
        ],
    );

    match result {
        Ok(_) => get_bundle(conn, id),
        Err(e) if is_constraint_violation(&e) => {
            Err(BundlecastError::BuildInProgress(document_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Find a bundle by id, with chunks loaded when READY
pub fn find_bundle(conn: &Connection, id: &str) -> Result<Option<Bundle>> {
    let sql = format!("SELECT {} FROM bundles WHERE id = ?", BUNDLE_COLUMNS);
    let bundle = conn
        .query_row(&sql, params![id], bundle_from_row)
        .optional()?;

    match bundle {
        Some(mut bundle) => {
            if bundle.is_ready() {
                bundle.chunks = load_chunks(conn, &bundle.id)?;
            }
            Ok(Some(bundle))
        }
        None => Ok(None),
    }
}

pub fn get_bundle(conn: &Connection, id: &str) -> Result<Bundle> {
    find_bundle(conn, id)?.ok_or_else(|| BundlecastError::not_found("bundle", id))
}

/// Most recent bundle of a document regardless of status
pub fn latest_bundle(conn: &Connection, document_id: &str) -> Result<Option<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE document_id = ? ORDER BY seq DESC LIMIT 1",
        BUNDLE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![document_id], bundle_from_row)
        .optional()?)
}

/// Newest READY bundle of a document, with chunks
pub fn latest_ready_bundle(conn: &Connection, document_id: &str) -> Result<Option<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE document_id = ? AND status = 'ready'
         ORDER BY seq DESC LIMIT 1",
        BUNDLE_COLUMNS
    );
    let bundle = conn
        .query_row(&sql, params![document_id], bundle_from_row)
        .optional()?;
    with_chunks(conn, bundle)
}

/// READY bundle of a document at an exact version, with chunks
pub fn ready_bundle_by_version(
    conn: &Connection,
    document_id: &str,
    version: &str,
) -> Result<Option<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE document_id = ? AND version = ? AND status = 'ready'
         ORDER BY seq DESC LIMIT 1",
        BUNDLE_COLUMNS
    );
    let bundle = conn
        .query_row(&sql, params![document_id, version], bundle_from_row)
        .optional()?;
    with_chunks(conn, bundle)
}

fn with_chunks(conn: &Connection, bundle: Option<Bundle>) -> Result<Option<Bundle>> {
    match bundle {
        Some(mut b) => {
            b.chunks = load_chunks(conn, &b.id)?;
            Ok(Some(b))
        }
        None => Ok(None),
    }
}

pub fn generating_bundle_for(conn: &Connection, document_id: &str) -> Result<Option<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE document_id = ? AND status = 'generating'",
        BUNDLE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![document_id], bundle_from_row)
        .optional()?)
}

/// All bundles of a document, newest first
pub fn list_bundles(conn: &Connection, document_id: &str) -> Result<Vec<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE document_id = ? ORDER BY seq DESC",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let bundles = stmt
        .query_map(params![document_id], bundle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bundles)
}

pub fn list_bundles_by_status(conn: &Connection, status: BundleStatus) -> Result<Vec<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE status = ? ORDER BY seq",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let bundles = stmt
        .query_map(params![status.as_str()], bundle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bundles)
}

/// Record a durably uploaded chunk of a GENERATING bundle
pub fn record_chunk(conn: &Connection, bundle_id: &str, chunk: &ChunkRef) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO chunks
            (bundle_id, chunk_index, storage_key, checksum, size, compressed_size)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            bundle_id,
            chunk.index,
            chunk.storage_key,
            chunk.checksum,
            chunk.size as i64,
            chunk.compressed_size as i64,
        ],
    )?;
    Ok(())
}

pub fn load_chunks(conn: &Connection, bundle_id: &str) -> Result<Vec<ChunkRef>> {
    let mut stmt = conn.prepare_cached(
        "SELECT chunk_index, storage_key, checksum, size, compressed_size
         FROM chunks WHERE bundle_id = ? ORDER BY chunk_index",
    )?;
    let chunks = stmt
        .query_map(params![bundle_id], chunk_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(chunks)
}

/// Record how many chunk objects a non-READY bundle may own, so cleanup can
/// find uploads that never got a chunk row.
pub fn set_chunk_count(conn: &Connection, bundle_id: &str, count: u32) -> Result<()> {
    conn.execute(
        "UPDATE bundles SET chunk_count = ?, updated_at = ?
         WHERE id = ? AND status IN ('generating', 'error')",
        params![count, Utc::now().to_rfc3339(), bundle_id],
    )?;
    Ok(())
}

pub fn delete_chunk_rows(conn: &Connection, bundle_id: &str) -> Result<usize> {
    Ok(conn.execute("DELETE FROM chunks WHERE bundle_id = ?", params![bundle_id])?)
}

/// GENERATING → READY. Fails with a conflict if the build was abandoned meanwhile.
pub fn mark_ready(
    conn: &Connection,
    bundle_id: &str,
    manifest_checksum: &str,
    manifest_key: &str,
    metadata: &BundleMetadata,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE bundles SET status = 'ready', manifest_checksum = ?, manifest_key = ?,
            total_size = ?, compressed_size = ?, chunk_count = ?, updated_at = ?
         WHERE id = ? AND status = 'generating'",
        params![
            manifest_checksum,
            manifest_key,
            metadata.total_size as i64,
            metadata.compressed_size as i64,
            metadata.chunk_count,
            Utc::now().to_rfc3339(),
            bundle_id,
        ],
    )?;
    if changed == 0 {
        return Err(BundlecastError::Conflict(format!(
            "Bundle {} is no longer generating",
            bundle_id
        )));
    }
    Ok(())
}

/// GENERATING → ERROR. Returns false if the bundle was not generating.
pub fn mark_error(conn: &Connection, bundle_id: &str, message: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE bundles SET status = 'error', error = ?, updated_at = ?
         WHERE id = ? AND status = 'generating'",
        params![message, Utc::now().to_rfc3339(), bundle_id],
    )?;
    Ok(changed > 0)
}

/// Any status → RETIRED tombstone
pub fn mark_retired(conn: &Connection, bundle_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE bundles SET status = 'retired', manifest_key = NULL, retired_at = ?, updated_at = ?
         WHERE id = ?",
        params![now, now, bundle_id],
    )?;
    Ok(())
}

/// GENERATING bundles whose build started before `cutoff`
pub fn stale_generating(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles WHERE status = 'generating' AND created_at < ?",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let bundles = stmt
        .query_map(params![cutoff.to_rfc3339()], bundle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bundles)
}

/// READY bundles past their expiry that are not the latest READY bundle of their document
pub fn expired_superseded(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Bundle>> {
    let sql = format!(
        "SELECT {} FROM bundles b
         WHERE b.status = 'ready' AND b.expires_at IS NOT NULL AND b.expires_at < ?
           AND b.seq < (SELECT MAX(seq) FROM bundles WHERE document_id = b.document_id AND status = 'ready')",
        BUNDLE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let bundles = stmt
        .query_map(params![now.to_rfc3339()], bundle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bundles)
}

/// Aggregate counts for the stats endpoint
pub fn get_stats(conn: &Connection) -> Result<StorageStats> {
    let count_status = |status: &str| -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM bundles WHERE status = ?",
            params![status],
            |row| row.get(0),
        )?)
    };
    let count_jobs = |status: &str| -> Result<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sync_jobs WHERE status = ?",
            params![status],
            |row| row.get(0),
        )?)
    };

    Ok(StorageStats {
        bundles_ready: count_status("ready")?,
        bundles_generating: count_status("generating")?,
        bundles_error: count_status("error")?,
        bundles_retired: count_status("retired")?,
        chunks: conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?,
        devices: conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?,
        cache_manifests: conn.query_row("SELECT COUNT(*) FROM cache_manifests", [], |row| {
            row.get(0)
        })?,
        jobs_pending: count_jobs("pending")?,
        jobs_running: count_jobs("running")?,
        jobs_failed: count_jobs("failed")?,
        db_size_bytes: conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?,
    })
}
