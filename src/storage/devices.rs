//! Device enrollment and document entitlements

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{BundlecastError, Result};
use crate::types::*;

fn network_as_str(network: NetworkClass) -> &'static str {
    match network {
        NetworkClass::Wifi => "wifi",
        NetworkClass::Ethernet => "ethernet",
        NetworkClass::Cellular => "cellular",
        NetworkClass::Offline => "offline",
        NetworkClass::Unknown => "unknown",
    }
}

fn network_from_str(s: &str) -> NetworkClass {
    match s {
        "wifi" => NetworkClass::Wifi,
        "ethernet" => NetworkClass::Ethernet,
        "cellular" => NetworkClass::Cellular,
        "offline" => NetworkClass::Offline,
        _ => NetworkClass::Unknown,
    }
}

fn device_from_row(row: &Row) -> rusqlite::Result<Device> {
    let enrolled_at: String = row.get("enrolled_at")?;
    let last_seen_at: Option<String> = row.get("last_seen_at")?;
    let network: String = row.get("network")?;
    let storage: Option<i64> = row.get("available_storage_bytes")?;
    Ok(Device {
        id: row.get("id")?,
        enrolled_at: parse_timestamp(&enrolled_at),
        last_seen_at: parse_optional_timestamp(last_seen_at),
        network: network_from_str(&network),
        available_storage_bytes: storage.map(|s| s as u64),
    })
}

/// Enroll a device; enrolling twice is a no-op
pub fn enroll_device(conn: &Connection, device_id: &str) -> Result<Device> {
    if device_id.trim().is_empty() {
        return Err(BundlecastError::InvalidInput(
            "Device id must not be empty".to_string(),
        ));
    }
    conn.execute(
        "INSERT OR IGNORE INTO devices (id, enrolled_at, network) VALUES (?, ?, 'unknown')",
        params![device_id, Utc::now().to_rfc3339()],
    )?;
    get_device(conn, device_id)
}

pub fn find_device(conn: &Connection, device_id: &str) -> Result<Option<Device>> {
    Ok(conn
        .query_row(
            "SELECT id, enrolled_at, last_seen_at, network, available_storage_bytes
             FROM devices WHERE id = ?",
            params![device_id],
            device_from_row,
        )
        .optional()?)
}

pub fn get_device(conn: &Connection, device_id: &str) -> Result<Device> {
    find_device(conn, device_id)?.ok_or_else(|| BundlecastError::not_found("device", device_id))
}

/// Record a sync check from the device
pub fn touch_device(conn: &Connection, device_id: &str, status: &DeviceStatus) -> Result<()> {
    let changed = conn.execute(
        "UPDATE devices SET last_seen_at = ?, network = ?, available_storage_bytes = ?
         WHERE id = ?",
        params![
            Utc::now().to_rfc3339(),
            network_as_str(status.network),
            status.available_storage_bytes.map(|b| b as i64),
            device_id,
        ],
    )?;
    if changed == 0 {
        return Err(BundlecastError::not_found("device", device_id));
    }
    Ok(())
}

/// Remove a device with its cache records, jobs and entitlements
pub fn unenroll_device(conn: &Connection, device_id: &str) -> Result<DeviceInvalidationResult> {
    get_device(conn, device_id)?;
    let result =
        super::cache::delete_cache_manifests(conn, device_id, &InvalidationScope::All)?;
    conn.execute(
        "DELETE FROM sync_jobs WHERE device_id = ?",
        params![device_id],
    )?;
    conn.execute("DELETE FROM devices WHERE id = ?", params![device_id])?;
    Ok(result)
}

/// Grant (or update) read access to a document
pub fn entitle(
    conn: &Connection,
    device_id: &str,
    document_id: &str,
    pinned_version: Option<&str>,
) -> Result<Entitlement> {
    get_device(conn, device_id)?;
    conn.execute(
        "INSERT INTO entitlements (device_id, document_id, pinned_version, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(device_id, document_id) DO UPDATE SET pinned_version = excluded.pinned_version",
        params![
            device_id,
            document_id,
            pinned_version,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(Entitlement {
        device_id: device_id.to_string(),
        document_id: document_id.to_string(),
        pinned_version: pinned_version.map(String::from),
    })
}

pub fn revoke(conn: &Connection, device_id: &str, document_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM entitlements WHERE device_id = ? AND document_id = ?",
        params![device_id, document_id],
    )?;
    Ok(changed > 0)
}

pub fn list_entitlements(conn: &Connection, device_id: &str) -> Result<Vec<Entitlement>> {
    let mut stmt = conn.prepare_cached(
        "SELECT device_id, document_id, pinned_version FROM entitlements
         WHERE device_id = ? ORDER BY document_id",
    )?;
    let entitlements = stmt
        .query_map(params![device_id], |row| {
            Ok(Entitlement {
                device_id: row.get(0)?,
                document_id: row.get(1)?,
                pinned_version: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entitlements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_enroll_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let first = enroll_device(conn, "dev-1")?;
                let second = enroll_device(conn, "dev-1")?;
                assert_eq!(first.enrolled_at, second.enrolled_at);
                assert!(enroll_device(conn, "  ").is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_entitlements_and_pinning() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                assert!(entitle(conn, "ghost", "doc", None)
                    .unwrap_err()
                    .is_not_found());

                enroll_device(conn, "dev-1")?;
                entitle(conn, "dev-1", "doc-b", None)?;
                entitle(conn, "dev-1", "doc-a", None)?;
                entitle(conn, "dev-1", "doc-a", Some("1.0.0"))?;

                let list = list_entitlements(conn, "dev-1")?;
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].document_id, "doc-a");
                assert_eq!(list[0].pinned_version.as_deref(), Some("1.0.0"));

                assert!(revoke(conn, "dev-1", "doc-b")?);
                assert!(!revoke(conn, "dev-1", "doc-b")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_touch_records_status() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                enroll_device(conn, "dev-1")?;
                touch_device(
                    conn,
                    "dev-1",
                    &DeviceStatus {
                        network: NetworkClass::Cellular,
                        available_storage_bytes: Some(512),
                        app_version: None,
                    },
                )?;
                let device = get_device(conn, "dev-1")?;
                assert_eq!(device.network, NetworkClass::Cellular);
                assert_eq!(device.available_storage_bytes, Some(512));
                assert!(device.last_seen_at.is_some());
                Ok(())
            })
            .unwrap();
    }
}
