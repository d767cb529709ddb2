//! Storage engine for Bundlecast
//!
//! SQLite metadata store: bundles and chunks, devices and entitlements,
//! per-device cache manifests, sync jobs, the audit log and the edge
//! invalidation ledger.

mod audit;
pub mod bundles;
pub mod cache;
mod connection;
pub mod devices;
pub mod invalidations;
pub mod jobs;
mod migrations;

pub use audit::*;
pub use connection::Storage;
pub use jobs::JobInsert;
pub use migrations::SCHEMA_VERSION;

use std::error::Error as StdError;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;

fn conversion_failure(
    row: &Row,
    column: &str,
    error: impl Into<Box<dyn StdError + Send + Sync>>,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or_default();
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, error.into())
}

/// TEXT column holding an enum's database form
pub(crate) fn parse_column<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn StdError + Send + Sync>>,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| conversion_failure(row, column, e))
}

/// TEXT column holding JSON
pub(crate) fn json_column<T: DeserializeOwned>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(row, column, e))
}
