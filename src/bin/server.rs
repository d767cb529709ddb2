//! Bundlecast server
//!
//! Run with: bundlecast-server --snapshots ./documents --objects ./objects

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bundlecast::api::{self, AppState};
use bundlecast::config::{data_dir, AppConfig};
use bundlecast::distribution::edge_cache_for;
use bundlecast::error::Result;
use bundlecast::object_store;
use bundlecast::snapshot::DirectorySnapshotSource;
use bundlecast::sync::{ChunkSink, DiscardChunkSink, FsChunkSink, SyncWorker};
use bundlecast::Platform;

#[derive(Parser, Debug)]
#[command(name = "bundlecast-server")]
#[command(about = "Bundlecast bundle distribution and device sync server")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "BUNDLECAST_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration file)
    #[arg(long, env = "BUNDLECAST_DB_PATH")]
    db_path: Option<String>,

    /// Object store location (directory, memory:// or s3://bucket/prefix)
    #[arg(long, env = "BUNDLECAST_OBJECTS")]
    objects: Option<String>,

    /// Directory of `<document_id>.json` snapshots
    #[arg(long, env = "BUNDLECAST_SNAPSHOTS")]
    snapshots: Option<String>,

    /// Directory receiving device caches written by the sync worker
    /// (chunks are verified and discarded when unset)
    #[arg(long, env = "BUNDLECAST_DEVICE_CACHE")]
    device_cache: Option<String>,

    /// Listen address
    #[arg(long, env = "BUNDLECAST_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Public base URL of the delivery boundary
    #[arg(long, env = "BUNDLECAST_BASE_URL")]
    base_url: Option<String>,

    /// HMAC key for signed URLs
    #[arg(long, env = "BUNDLECAST_SIGNING_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,

    /// Edge cache purge endpoint
    #[arg(long, env = "BUNDLECAST_PURGE_ENDPOINT")]
    purge_endpoint: Option<String>,

    #[arg(long, env = "BUNDLECAST_PURGE_TOKEN", hide_env_values = true)]
    purge_token: Option<String>,

    /// Do not run the background sync worker
    #[arg(long, env = "BUNDLECAST_NO_WORKER")]
    no_worker: bool,

    /// Maintenance interval in seconds: reclaim stalled builds and retire
    /// expired bundles (0 = disabled)
    #[arg(long, env = "BUNDLECAST_MAINTENANCE_INTERVAL", default_value = "300")]
    maintenance_interval_seconds: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "BUNDLECAST_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn app_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(db_path) = &self.db_path {
            config.storage.db_path = db_path.clone();
        }
        config.storage.db_path = shellexpand::tilde(&config.storage.db_path).to_string();
        if let Some(base_url) = &self.base_url {
            config.distribution.base_url = base_url.clone();
        }
        if let Some(secret) = &self.signing_secret {
            config.distribution.signing_secret = secret.clone();
        }
        if self.purge_endpoint.is_some() {
            config.distribution.purge_endpoint = self.purge_endpoint.clone();
        }
        if self.purge_token.is_some() {
            config.distribution.purge_token = self.purge_token.clone();
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug"));

    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.app_config()?;

    let objects_location = args
        .objects
        .clone()
        .unwrap_or_else(|| data_dir().join("objects").to_string_lossy().to_string());
    let objects = object_store::open(&objects_location).await?;

    let snapshots_dir = args
        .snapshots
        .as_deref()
        .map(|dir| shellexpand::tilde(dir).to_string())
        .unwrap_or_else(|| data_dir().join("documents").to_string_lossy().to_string());
    let snapshots = Arc::new(DirectorySnapshotSource::new(snapshots_dir.clone()));

    let sink: Arc<dyn ChunkSink> = match &args.device_cache {
        Some(root) => Arc::new(FsChunkSink::new(root).await?),
        None => Arc::new(DiscardChunkSink),
    };

    let edge = edge_cache_for(&config.distribution);
    let platform = Platform::open(config, objects.clone(), snapshots, edge, sink)?;

    tracing::info!(
        db_path = %platform.storage().db_path(),
        objects = objects.name(),
        snapshots = %snapshots_dir,
        "Bundlecast platform opened"
    );

    let worker = if args.no_worker {
        None
    } else {
        let policy = &platform.config().sync;
        Some(Arc::new(SyncWorker::start(
            platform.storage().clone(),
            platform.executor(),
            policy.worker_concurrency,
            Duration::from_millis(policy.poll_interval_ms),
        )))
    };

    // Periodic maintenance
    if args.maintenance_interval_seconds > 0 {
        let maintenance_platform = platform.clone();
        let period = Duration::from_secs(args.maintenance_interval_seconds);
        tokio::spawn(async move {
            tracing::info!("Maintenance task started (interval: {}s)", period.as_secs());
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match maintenance_platform.maintenance().await {
                    Ok(report) => {
                        if !report.reclaim.abandoned.is_empty()
                            || !report.reclaim.reclaimed.is_empty()
                            || !report.retired.is_empty()
                            || !report.timed_out_jobs.is_empty()
                        {
                            tracing::info!(
                                abandoned = report.reclaim.abandoned.len(),
                                reclaimed = report.reclaim.reclaimed.len(),
                                deleted_objects = report.reclaim.deleted_objects,
                                retired = report.retired.len(),
                                timed_out_jobs = report.timed_out_jobs.len(),
                                "Maintenance pass finished"
                            );
                        }
                    }
                    Err(e) => tracing::error!("Maintenance pass failed: {}", e),
                }
            }
        });
    }

    let storage = platform.storage().clone();
    let mut state = AppState::new(platform);
    if let Some(worker) = &worker {
        state = state.with_worker(worker.clone());
    }

    tracing::info!("Bundlecast server starting...");
    api::serve(state, args.bind).await?;

    if let Some(worker) = worker {
        worker.stop().await?;
    }
    storage.checkpoint()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlecast::BundlecastError;

    #[test]
    fn test_flags_override_config_file() {
        let args = Args::parse_from([
            "bundlecast-server",
            "--db-path",
            "/tmp/bundlecast-test.db",
            "--base-url",
            "https://cdn.example.com",
        ]);
        let config = args.app_config().unwrap();
        assert_eq!(config.storage.db_path, "/tmp/bundlecast-test.db");
        assert_eq!(config.distribution.base_url, "https://cdn.example.com");
        assert!(config.distribution.purge_endpoint.is_none());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args::parse_from([
            "bundlecast-server",
            "--config",
            "/nonexistent/bundlecast.toml",
        ]);
        assert!(matches!(args.app_config(), Err(BundlecastError::Io(_))));
    }
}
