//! Database migrations for Bundlecast

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Bundles, chunks, devices, cache manifests and sync jobs (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- seq orders builds of the same document; the newest READY one is "latest"
        CREATE TABLE IF NOT EXISTS bundles (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL,
            version TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'generating',
            manifest_checksum TEXT,
            manifest_key TEXT,
            total_size INTEGER NOT NULL DEFAULT 0,
            compressed_size INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            expires_at TEXT,
            retired_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_bundles_document ON bundles(document_id, status, seq);

        -- At most one in-flight build per document
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bundles_one_generating
            ON bundles(document_id) WHERE status = 'generating';

        CREATE TABLE IF NOT EXISTS chunks (
            bundle_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            storage_key TEXT NOT NULL,
            checksum TEXT NOT NULL,
            size INTEGER NOT NULL,
            compressed_size INTEGER NOT NULL,
            PRIMARY KEY (bundle_id, chunk_index),
            FOREIGN KEY (bundle_id) REFERENCES bundles(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_checksum ON chunks(checksum);

        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            enrolled_at TEXT NOT NULL,
            last_seen_at TEXT,
            network TEXT NOT NULL DEFAULT 'unknown',
            available_storage_bytes INTEGER
        );

        CREATE TABLE IF NOT EXISTS entitlements (
            device_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            pinned_version TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (device_id, document_id),
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS cache_manifests (
            device_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            bundle_id TEXT NOT NULL,
            bundle_version TEXT NOT NULL,
            manifest_checksum TEXT NOT NULL,
            last_modified TEXT NOT NULL,
            PRIMARY KEY (device_id, document_id),
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_cache_manifests_bundle ON cache_manifests(bundle_id);

        CREATE TABLE IF NOT EXISTS cache_manifest_chunks (
            device_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            PRIMARY KEY (device_id, document_id, chunk_index),
            FOREIGN KEY (device_id, document_id)
                REFERENCES cache_manifests(device_id, document_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            bundle_id TEXT NOT NULL,
            bundle_version TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            chunk_indices TEXT NOT NULL DEFAULT '[]',
            reuse TEXT NOT NULL DEFAULT '[]',
            base_checksums TEXT NOT NULL DEFAULT '[]',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        -- One PENDING/RUNNING job per device and document
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_active
            ON sync_jobs(device_id, document_id) WHERE status IN ('pending', 'running');

        CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(status, created_at);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Audit log and edge invalidation ledger (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            action TEXT NOT NULL,
            device_id TEXT,
            bundle_id TEXT,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log(action, timestamp);

        CREATE TABLE IF NOT EXISTS invalidations (
            id TEXT PRIMARY KEY,
            bundle_id TEXT NOT NULL,
            paths TEXT NOT NULL,
            provider_ref TEXT,
            requested_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_invalidations_bundle ON invalidations(bundle_id);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}
