//! Error types for Bundlecast

use thiserror::Error;

/// Result type alias for Bundlecast operations
pub type Result<T> = std::result::Result<T, BundlecastError>;

/// Main error type for Bundlecast
#[derive(Error, Debug)]
pub enum BundlecastError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    Integrity {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Build failed for bundle {bundle_id}: {message}")]
    Build { bundle_id: String, message: String },

    #[error("Build already in progress for document {0}")]
    BuildInProgress(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Distribution error: {0}")]
    Distribution(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signed URL expired")]
    Expired,

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BundlecastError {
    /// Shorthand for a [`BundlecastError::NotFound`]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        BundlecastError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Transient I/O and integrity failures are retried where they occur;
    /// everything else is surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BundlecastError::ObjectStore(_)
                | BundlecastError::Integrity { .. }
                | BundlecastError::Io(_)
                | BundlecastError::Distribution(_)
        )
    }

    /// HTTP status code for the device-facing API
    pub fn status_code(&self) -> u16 {
        match self {
            BundlecastError::NotFound { .. } => 404,
            BundlecastError::InvalidInput(_) => 400,
            BundlecastError::InvalidSignature => 403,
            BundlecastError::Expired => 410,
            BundlecastError::Conflict(_) | BundlecastError::BuildInProgress(_) => 409,
            BundlecastError::ObjectStore(_) | BundlecastError::Distribution(_) => 502,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BundlecastError::NotFound { .. })
    }
}
