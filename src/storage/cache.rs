//! Cache manifest store
//!
//! Server-side record of the chunk checksums each device last confirmed
//! holding, one row per device and document. Rows are written only by the
//! sync job executor and removed by cache invalidation or de-enrollment.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::*;

fn load_chunk_checksums(
    conn: &Connection,
    device_id: &str,
    document_id: &str,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT checksum FROM cache_manifest_chunks
         WHERE device_id = ? AND document_id = ? ORDER BY chunk_index",
    )?;
    let checksums = stmt
        .query_map(params![device_id, document_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(checksums)
}

pub fn get_cache_manifest(
    conn: &Connection,
    device_id: &str,
    document_id: &str,
) -> Result<Option<CacheManifest>> {
    let row = conn
        .query_row(
            "SELECT bundle_id, bundle_version, manifest_checksum, last_modified
             FROM cache_manifests WHERE device_id = ? AND document_id = ?",
            params![device_id, document_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    match row {
        Some((bundle_id, bundle_version, manifest_checksum, last_modified)) => {
            Ok(Some(CacheManifest {
                device_id: device_id.to_string(),
                document_id: document_id.to_string(),
                bundle_id,
                bundle_version,
                manifest_checksum,
                chunk_checksums: load_chunk_checksums(conn, device_id, document_id)?,
                last_modified: parse_timestamp(&last_modified),
            }))
        }
        None => Ok(None),
    }
}

pub fn list_cache_manifests(conn: &Connection, device_id: &str) -> Result<Vec<CacheManifest>> {
    let mut stmt = conn.prepare(
        "SELECT document_id FROM cache_manifests WHERE device_id = ? ORDER BY document_id",
    )?;
    let documents = stmt
        .query_map(params![device_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut manifests = Vec::with_capacity(documents.len());
    for document_id in documents {
        if let Some(m) = get_cache_manifest(conn, device_id, &document_id)? {
            manifests.push(m);
        }
    }
    Ok(manifests)
}

/// Replace a device's manifest for one document (last writer wins).
///
/// Call inside a transaction: the header row and chunk rows are written
/// separately.
pub fn put_cache_manifest(conn: &Connection, manifest: &CacheManifest) -> Result<()> {
    conn.execute(
        "INSERT INTO cache_manifests
            (device_id, document_id, bundle_id, bundle_version, manifest_checksum, last_modified)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(device_id, document_id) DO UPDATE SET
            bundle_id = excluded.bundle_id,
            bundle_version = excluded.bundle_version,
            manifest_checksum = excluded.manifest_checksum,
            last_modified = excluded.last_modified",
        params![
            manifest.device_id,
            manifest.document_id,
            manifest.bundle_id,
            manifest.bundle_version,
            manifest.manifest_checksum,
            manifest.last_modified.to_rfc3339(),
        ],
    )?;

    conn.execute(
        "DELETE FROM cache_manifest_chunks WHERE device_id = ? AND document_id = ?",
        params![manifest.device_id, manifest.document_id],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO cache_manifest_chunks (device_id, document_id, chunk_index, checksum)
         VALUES (?, ?, ?, ?)",
    )?;
    for (index, checksum) in manifest.chunk_checksums.iter().enumerate() {
        stmt.execute(params![
            manifest.device_id,
            manifest.document_id,
            index as i64,
            checksum
        ])?;
    }

    Ok(())
}

/// Delete a device's cache records within `scope`
pub fn delete_cache_manifests(
    conn: &Connection,
    device_id: &str,
    scope: &InvalidationScope,
) -> Result<DeviceInvalidationResult> {
    let (filter, arg): (&str, Option<&str>) = match scope {
        InvalidationScope::All => ("", None),
        InvalidationScope::Document { document_id } => (" AND document_id = ?2", Some(document_id)),
        InvalidationScope::Bundle { bundle_id } => (" AND bundle_id = ?2", Some(bundle_id)),
    };

    let select = format!(
        "SELECT document_id FROM cache_manifests WHERE device_id = ?1{}",
        filter
    );
    let mut stmt = conn.prepare(&select)?;
    let documents = match arg {
        Some(arg) => stmt
            .query_map(params![device_id, arg], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?,
        None => stmt
            .query_map(params![device_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?,
    };

    let mut result = DeviceInvalidationResult {
        device_id: device_id.to_string(),
        ..Default::default()
    };

    for document_id in &documents {
        let chunks = conn.execute(
            "DELETE FROM cache_manifest_chunks WHERE device_id = ? AND document_id = ?",
            params![device_id, document_id],
        )?;
        let manifests = conn.execute(
            "DELETE FROM cache_manifests WHERE device_id = ? AND document_id = ?",
            params![device_id, document_id],
        )?;
        result.deleted_chunks += chunks as u64;
        result.deleted_manifests += manifests as u64;
        if manifests > 0 {
            result.deleted_caches += 1;
        }
    }

    Ok(result)
}

/// Build a manifest record stamped with the current time
pub fn cache_manifest_for(
    device_id: &str,
    document_id: &str,
    bundle_id: &str,
    bundle_version: &str,
    chunk_checksums: Vec<String>,
) -> CacheManifest {
    CacheManifest {
        device_id: device_id.to_string(),
        document_id: document_id.to_string(),
        bundle_id: bundle_id.to_string(),
        bundle_version: bundle_version.to_string(),
        manifest_checksum: crate::codec::manifest_checksum(&chunk_checksums),
        chunk_checksums,
        last_modified: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{devices::enroll_device, Storage};

    fn setup() -> Storage {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                enroll_device(conn, "dev-1")?;
                enroll_device(conn, "dev-2")?;
                Ok(())
            })
            .unwrap();
        storage
    }

    #[test]
    fn test_put_and_get_round_trip() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                let manifest = cache_manifest_for(
                    "dev-1",
                    "doc",
                    "b1",
                    "1.0.0",
                    vec!["a".into(), "b".into(), "c".into()],
                );
                put_cache_manifest(conn, &manifest)?;

                let loaded = get_cache_manifest(conn, "dev-1", "doc")?.unwrap();
                assert_eq!(loaded.chunk_checksums, vec!["a", "b", "c"]);
                assert_eq!(loaded.manifest_checksum, manifest.manifest_checksum);
                assert!(get_cache_manifest(conn, "dev-2", "doc")?.is_none());

                // Shrinking replaces the chunk rows entirely
                let smaller =
                    cache_manifest_for("dev-1", "doc", "b2", "1.0.1", vec!["a".into()]);
                put_cache_manifest(conn, &smaller)?;
                let loaded = get_cache_manifest(conn, "dev-1", "doc")?.unwrap();
                assert_eq!(loaded.bundle_id, "b2");
                assert_eq!(loaded.chunk_checksums, vec!["a"]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_by_scope() {
        let storage = setup();
        storage
            .with_transaction(|conn| {
                put_cache_manifest(
                    conn,
                    &cache_manifest_for("dev-1", "doc-a", "ba", "1", vec!["x".into(), "y".into()]),
                )?;
                put_cache_manifest(
                    conn,
                    &cache_manifest_for("dev-1", "doc-b", "bb", "1", vec!["z".into()]),
                )?;

                let result = delete_cache_manifests(
                    conn,
                    "dev-1",
                    &InvalidationScope::Bundle {
                        bundle_id: "bb".into(),
                    },
                )?;
                assert_eq!(result.deleted_manifests, 1);
                assert_eq!(result.deleted_chunks, 1);
                assert_eq!(list_cache_manifests(conn, "dev-1")?.len(), 1);

                let result = delete_cache_manifests(conn, "dev-1", &InvalidationScope::All)?;
                assert_eq!(result.deleted_caches, 1);
                assert_eq!(result.deleted_chunks, 2);
                assert!(list_cache_manifests(conn, "dev-1")?.is_empty());

                let nothing = delete_cache_manifests(conn, "dev-2", &InvalidationScope::All)?;
                assert_eq!(nothing.deleted_manifests, 0);
                Ok(())
            })
            .unwrap();
    }
}
