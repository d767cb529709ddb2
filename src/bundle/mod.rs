//! Bundle lifecycle: build, publish, retire and reclaim

mod builder;
mod version;

pub use builder::{BuildOptions, BundleBuilder, ReclaimReport};
pub use version::next_version;
