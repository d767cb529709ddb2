//! Audit logging for bundle and device operations
//!
//! Append-only record of builds, retirements, invalidations and anomalies
//! reported by devices.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::parse_timestamp;

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub device_id: Option<String>,
    pub bundle_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Types of auditable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BundleBuilt,
    BundleFailed,
    BundleRetired,
    BundleAbandoned,
    /// Device reported the current manifest checksum with the wrong chunk count
    InconsistentManifest,
    CacheInvalidated,
    DeviceEnrolled,
    DeviceUnenrolled,
    JobFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::BundleBuilt => "bundle_built",
            AuditAction::BundleFailed => "bundle_failed",
            AuditAction::BundleRetired => "bundle_retired",
            AuditAction::BundleAbandoned => "bundle_abandoned",
            AuditAction::InconsistentManifest => "inconsistent_manifest",
            AuditAction::CacheInvalidated => "cache_invalidated",
            AuditAction::DeviceEnrolled => "device_enrolled",
            AuditAction::DeviceUnenrolled => "device_unenrolled",
            AuditAction::JobFailed => "job_failed",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bundle_built" => Ok(AuditAction::BundleBuilt),
            "bundle_failed" => Ok(AuditAction::BundleFailed),
            "bundle_retired" => Ok(AuditAction::BundleRetired),
            "bundle_abandoned" => Ok(AuditAction::BundleAbandoned),
            "inconsistent_manifest" => Ok(AuditAction::InconsistentManifest),
            "cache_invalidated" => Ok(AuditAction::CacheInvalidated),
            "device_enrolled" => Ok(AuditAction::DeviceEnrolled),
            "device_unenrolled" => Ok(AuditAction::DeviceUnenrolled),
            "job_failed" => Ok(AuditAction::JobFailed),
            _ => Err(format!("Unknown audit action: {}", s)),
        }
    }
}

/// Log an audit entry
pub fn log_audit(
    conn: &Connection,
    action: AuditAction,
    device_id: Option<&str>,
    bundle_id: Option<&str>,
    details: Option<&serde_json::Value>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (timestamp, action, device_id, bundle_id, details)
         VALUES (?, ?, ?, ?, ?)",
        params![
            Utc::now().to_rfc3339(),
            action.as_str(),
            device_id,
            bundle_id,
            details.map(|d| d.to_string()),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Filter for querying audit log
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub device_id: Option<String>,
    pub bundle_id: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Query audit log entries, newest first
pub fn query_audit_log(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT id, timestamp, action, device_id, bundle_id, details
         FROM audit_log WHERE 1=1",
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref device_id) = filter.device_id {
        sql.push_str(" AND device_id = ?");
        params_vec.push(Box::new(device_id.clone()));
    }

    if let Some(ref bundle_id) = filter.bundle_id {
        sql.push_str(" AND bundle_id = ?");
        params_vec.push(Box::new(bundle_id.clone()));
    }

    if let Some(ref action) = filter.action {
        sql.push_str(" AND action = ?");
        params_vec.push(Box::new(action.as_str().to_string()));
    }

    if let Some(ref since) = filter.since {
        sql.push_str(" AND timestamp >= ?");
        params_vec.push(Box::new(since.to_rfc3339()));
    }

    sql.push_str(" ORDER BY id DESC");

    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;

    let entries: Vec<AuditEntry> = stmt
        .query_map(params_ref.as_slice(), |row| {
            let timestamp: String = row.get("timestamp")?;
            let action: String = row.get("action")?;
            let details: Option<String> = row.get("details")?;

            Ok((
                row.get::<_, i64>("id")?,
                timestamp,
                action,
                row.get::<_, Option<String>>("device_id")?,
                row.get::<_, Option<String>>("bundle_id")?,
                details,
            ))
        })?
        .filter_map(|r| r.ok())
        .filter_map(|(id, timestamp, action, device_id, bundle_id, details)| {
            // Rows written by a newer schema with unknown actions are skipped
            let action = action.parse().ok()?;
            Some(AuditEntry {
                id,
                timestamp: parse_timestamp(&timestamp),
                action,
                device_id,
                bundle_id,
                details: details.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })
        .collect();

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_audit_action_roundtrip() {
        for action in [
            AuditAction::BundleBuilt,
            AuditAction::InconsistentManifest,
            AuditAction::JobFailed,
        ] {
            let s = action.as_str();
            let parsed: AuditAction = s.parse().unwrap();
            assert_eq!(action, parsed);
        }
        assert!("login".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_log_and_query() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                log_audit(conn, AuditAction::BundleBuilt, None, Some("b1"), None)?;
                log_audit(
                    conn,
                    AuditAction::InconsistentManifest,
                    Some("dev-1"),
                    Some("b1"),
                    Some(&serde_json::json!({"reported": 2, "expected": 3})),
                )?;

                let all = query_audit_log(conn, &AuditFilter::default())?;
                assert_eq!(all.len(), 2);
                assert_eq!(all[0].action, AuditAction::InconsistentManifest);
                assert_eq!(all[0].details.as_ref().unwrap()["expected"], 3);

                let by_device = query_audit_log(
                    conn,
                    &AuditFilter {
                        device_id: Some("dev-1".into()),
                        ..Default::default()
                    },
                )?;
                assert_eq!(by_device.len(), 1);
                Ok(())
            })
            .unwrap();
    }
}
