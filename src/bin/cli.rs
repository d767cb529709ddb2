//! Bundlecast CLI
//!
//! Command-line interface for bundle and device administration.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use bundlecast::bundle::BuildOptions;
use bundlecast::config::{data_dir, AppConfig};
use bundlecast::distribution::{edge_cache_for, generate_secret};
use bundlecast::error::{BundlecastError, Result};
use bundlecast::object_store;
use bundlecast::snapshot::DirectorySnapshotSource;
use bundlecast::storage::{AuditAction, AuditFilter};
use bundlecast::sync::{ChunkSink, DiscardChunkSink, FsChunkSink};
use bundlecast::types::*;
use bundlecast::Platform;

#[derive(Parser)]
#[command(name = "bundlecast")]
#[command(about = "Bundlecast bundle and device administration")]
#[command(version)]
struct Cli {
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

    /// Directory receiving device caches when running jobs
    #[arg(long, env = "BUNDLECAST_DEVICE_CACHE")]
    device_cache: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and publish a bundle from the current document snapshot
    Build {
        /// Document ID
        document_id: String,
        /// Explicit version (default: bump the previous one)
        #[arg(short, long)]
        release: Option<String>,
        /// Chunk threshold in bytes
        #[arg(short, long)]
        threshold: Option<usize>,
    },
    /// List bundles of a document
    Bundles {
        /// Document ID
        document_id: String,
    },
    /// Show the manifest of a READY bundle
    Manifest {
        /// Bundle ID
        bundle_id: String,
    },
    /// Retire a bundle and purge it from the edge
    Retire {
        /// Bundle ID
        bundle_id: String,
    },
    /// Print the delivery URL of a manifest or chunk
    Url {
        /// Bundle ID
        bundle_id: String,
        /// Chunk index (manifest when omitted)
        #[arg(short, long)]
        chunk: Option<u32>,
        /// Sign the URL
        #[arg(short, long)]
        signed: bool,
        /// Signed URL lifetime in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Enroll a device
    Enroll {
        /// Device ID
        device_id: String,
    },
    /// Entitle a device to a document
    Entitle {
        device_id: String,
        document_id: String,
        /// Pin the device to one version
        #[arg(short, long)]
        pin: Option<String>,
    },
    /// Revoke an entitlement
    Revoke {
        device_id: String,
        document_id: String,
    },
    /// Run a sync check from a JSON request (- for stdin)
    Check {
        #[arg(default_value = "-")]
        request: String,
    },
    /// List sync jobs of a device
    Jobs {
        /// Device ID
        device_id: String,
    },
    /// Execute PENDING sync jobs
    RunJobs {
        /// Maximum jobs to run
        #[arg(short, long, default_value = "32")]
        limit: usize,
    },
    /// Reclaim failed builds and retire expired bundles
    Maintenance,
    /// Show statistics
    Stats,
    /// Print a fresh URL signing secret
    Keygen,
    /// Show audit log entries
    Audit {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        bundle: Option<String>,
        /// Action (e.g. bundle_built, job_failed)
        #[arg(short, long)]
        action: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

impl Cli {
    fn app_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(db_path) = &self.db_path {
            config.storage.db_path = db_path.clone();
        }
        config.storage.db_path = shellexpand::tilde(&config.storage.db_path).to_string();
        Ok(config)
    }

    async fn open_platform(&self) -> Result<Platform> {
        let config = self.app_config()?;

        let objects_location = self
            .objects
            .clone()
            .unwrap_or_else(|| data_dir().join("objects").to_string_lossy().to_string());
        let objects = object_store::open(&objects_location).await?;

        let snapshots_dir = self
            .snapshots
            .as_deref()
            .map(|dir| shellexpand::tilde(dir).to_string())
            .unwrap_or_else(|| data_dir().join("documents").to_string_lossy().to_string());

        let sink: Arc<dyn ChunkSink> = match &self.device_cache {
            Some(root) => Arc::new(FsChunkSink::new(root).await?),
            None => Arc::new(DiscardChunkSink),
        };

        let edge = edge_cache_for(&config.distribution);
        Platform::open(
            config,
            objects,
            Arc::new(DirectorySnapshotSource::new(snapshots_dir)),
            edge,
            sink,
        )
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_request(source: &str) -> Result<SyncCheckRequest> {
    let raw = if source == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(shellexpand::tilde(source).as_ref())?
    };
    Ok(serde_json::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    // Needs no database
    if matches!(cli.command, Commands::Keygen) {
        println!("{}", generate_secret());
        return Ok(());
    }
    let platform = cli.open_platform().await?;

    match cli.command {
        Commands::Build {
            document_id,
            release,
            threshold,
        } => {
            let options = BuildOptions {
                version: release,
                chunk_threshold_bytes: threshold,
            };
            let bundle = platform.build_and_publish(&document_id, options).await?;
            println!(
                "Built bundle {} ({} v{}, {} chunks)",
                bundle.id,
                bundle.document_id,
                bundle.version,
                bundle.metadata.chunk_count
            );
            print_json(&bundle)?;
        }

        Commands::Bundles { document_id } => {
            for bundle in platform.builder().list(&document_id)? {
                println!(
                    "{} v{} [{}] {} chunks, {} bytes",
                    bundle.id,
                    bundle.version,
                    bundle.status.as_str(),
                    bundle.metadata.chunk_count,
                    bundle.metadata.compressed_size
                );
            }
        }

        Commands::Manifest { bundle_id } => {
            print_json(&platform.manifest(&bundle_id)?)?;
        }

        Commands::Retire { bundle_id } => {
            if platform.retire(&bundle_id).await? {
                println!("Retired bundle {}", bundle_id);
            } else {
                println!("Bundle {} was already retired", bundle_id);
            }
        }

        Commands::Url {
            bundle_id,
            chunk,
            signed,
            ttl,
        } => {
            let distributor = platform.distributor();
            let url = if signed || ttl.is_some() {
                distributor.signed_url_for(&bundle_id, chunk, ttl.map(Duration::from_secs))?
            } else {
                distributor.url_for(&bundle_id, chunk)?
            };
            println!("{}", url.url);
            println!("Cache-Control: {}", url.cache_control);
            if let Some(expires_at) = url.expires_at {
                println!("Expires: {}", expires_at.to_rfc3339());
            }
        }

        Commands::Enroll { device_id } => {
            print_json(&platform.enroll_device(&device_id)?)?;
        }

        Commands::Entitle {
            device_id,
            document_id,
            pin,
        } => {
            print_json(&platform.entitle(&device_id, &document_id, pin.as_deref())?)?;
        }

        Commands::Revoke {
            device_id,
            document_id,
        } => {
            if platform.revoke(&device_id, &document_id)? {
                println!("Revoked {} for {}", document_id, device_id);
            } else {
                println!("{} was not entitled to {}", device_id, document_id);
            }
        }

        Commands::Check { request } => {
            let request = read_request(&request)?;
            print_json(&platform.sync_check(&request)?)?;
        }

        Commands::Jobs { device_id } => {
            for job in platform.jobs(&device_id)? {
                println!(
                    "{} {} v{} [{}] {} {} chunks{}",
                    job.id,
                    job.bundle_id,
                    job.bundle_version,
                    job.status.as_str(),
                    job.kind.as_str(),
                    job.chunk_indices.len(),
                    job.last_error
                        .map(|e| format!(" - {}", e))
                        .unwrap_or_default()
                );
            }
        }

        Commands::RunJobs { limit } => {
            let reports = platform.executor().run_pending(limit).await?;
            if reports.is_empty() {
                println!("No pending jobs");
            }
            print_json(&reports)?;
        }

        Commands::Maintenance => {
            print_json(&platform.maintenance().await?)?;
        }

        Commands::Stats => {
            print_json(&platform.stats()?)?;
        }

        Commands::Keygen => {}

        Commands::Audit {
            device,
            bundle,
            action,
            limit,
        } => {
            let action = action
                .map(|a| a.parse::<AuditAction>())
                .transpose()
                .map_err(BundlecastError::InvalidInput)?;
            let filter = AuditFilter {
                device_id: device,
                bundle_id: bundle,
                action,
                since: None,
                limit: Some(limit),
            };
            for entry in platform.audit(&filter)? {
                println!(
                    "{} {} device={} bundle={} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.action.as_str(),
                    entry.device_id.as_deref().unwrap_or("-"),
                    entry.bundle_id.as_deref().unwrap_or("-"),
                    entry
                        .details
                        .map(|d| d.to_string())
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
