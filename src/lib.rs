//! Bundlecast - document bundle distribution
//!
//! Splits structured documents into compressed, checksummed chunks, publishes
//! them as immutable versioned bundles behind a CDN-friendly origin, and keeps
//! device caches in sync by downloading only the chunks that changed.

pub mod api;
pub mod bundle;
pub mod codec;
pub mod config;
pub mod distribution;
pub mod error;
pub mod object_store;
pub mod platform;
pub mod retry;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{BundlecastError, Result};
pub use platform::Platform;
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
