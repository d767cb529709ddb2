//! Edge invalidation ledger
//!
//! Every purge request sent to the edge cache is recorded so operators can
//! see which paths were invalidated for a bundle and when.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::json_column;
use crate::error::Result;
use crate::types::parse_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationRecord {
    pub id: String,
    pub bundle_id: String,
    pub paths: Vec<String>,
    /// Identifier returned by the edge provider, if any
    pub provider_ref: Option<String>,
    pub requested_at: DateTime<Utc>,
}

pub fn record_invalidation(conn: &Connection, record: &InvalidationRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO invalidations (id, bundle_id, paths, provider_ref, requested_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
            record.id,
            record.bundle_id,
            serde_json::to_string(&record.paths)?,
            record.provider_ref,
            record.requested_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_invalidations(conn: &Connection, bundle_id: &str) -> Result<Vec<InvalidationRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, bundle_id, paths, provider_ref, requested_at
         FROM invalidations WHERE bundle_id = ? ORDER BY requested_at",
    )?;
    let records = stmt
        .query_map(params![bundle_id], |row| {
            let requested_at: String = row.get(4)?;
            Ok(InvalidationRecord {
                id: row.get(0)?,
                bundle_id: row.get(1)?,
                paths: json_column(row, "paths")?,
                provider_ref: row.get(3)?,
                requested_at: parse_timestamp(&requested_at),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_record_and_list() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let record = InvalidationRecord {
                    id: "inv-1".into(),
                    bundle_id: "b1".into(),
                    paths: vec!["/bundles/b1/*".into()],
                    provider_ref: Some("purge-42".into()),
                    requested_at: Utc::now(),
                };
                record_invalidation(conn, &record)?;

                let listed = list_invalidations(conn, "b1")?;
                assert_eq!(listed.len(), 1);
                assert_eq!(listed[0].paths, record.paths);
                assert!(list_invalidations(conn, "b2")?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
