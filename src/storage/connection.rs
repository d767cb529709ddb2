//! Database connection management with WAL mode
//!
//! A single serialized SQLite connection shared by the builder, coordinator
//! and sync workers. All cross-request state lives in this database.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::config::StorageConfig;
use crate::error::Result;

/// Storage engine wrapping SQLite
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create a database with the given configuration
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;

        run_migrations(&conn)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let config = StorageConfig {
            db_path: ":memory:".to_string(),
            ..Default::default()
        };
        Self::open(config)
    }

    fn create_connection(config: &StorageConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout={};
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
            "#,
            config.busy_timeout_ms
        ))?;

        Ok(conn)
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function with a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Get database path
    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Checkpoint WAL file
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO devices (id, enrolled_at, network) VALUES ('d1', '2024-01-01T00:00:00Z', 'unknown')",
                [],
            )?;
            Err(crate::error::BundlecastError::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bundlecast.db");
        let config = StorageConfig {
            db_path: path.to_string_lossy().to_string(),
            ..Default::default()
        };
        let storage = Storage::open(config.clone()).unwrap();
        storage.checkpoint().unwrap();
        drop(storage);
        // Reopening runs migrations again without error
        Storage::open(config).unwrap();
    }
}
