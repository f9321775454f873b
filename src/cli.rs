//! # Command Line Interface
//!
//! `edgeplane serve` runs the control plane; `edgeplane check` builds the
//! routing graph for a set of manifests once and prints every object status.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache::{CacheConfig, ResourceCache};
use crate::config::AppConfig;
use crate::coordinator::{DagObserver, EventHandler, StatusStore};
use crate::dag::{Builder, BuilderConfig, CurrentStatus, ObjectStatus};
use crate::k8s::{manifest, ObjectKey};
use crate::observability::{init_observability, log_config_info};
use crate::xds::{self, EndpointTranslator, SnapshotSet, TranslationOptions, XdsTranslator};
use crate::{APP_NAME, VERSION};

#[derive(Parser)]
#[command(name = "edgeplane")]
#[command(about = "Edgeplane Envoy Control Plane for Kubernetes ingress")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the control plane and the xDS server
    Serve {
        /// File or directory of Kubernetes manifests to load at startup
        #[arg(short, long)]
        manifests: Option<PathBuf>,
    },

    /// Validate manifests and print the status of every object
    Check {
        /// File or directory of Kubernetes manifests
        #[arg(short, long)]
        manifests: PathBuf,
    },
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Serve { manifests } => serve(config, manifests.as_deref()).await,
        Commands::Check { manifests } => check(&config, &manifests),
    }
}

fn cache_for(config: &AppConfig) -> Arc<ResourceCache> {
    Arc::new(ResourceCache::new(CacheConfig {
        ingress_class_names: config.ingress.class_names.clone(),
    }))
}

async fn serve(config: AppConfig, manifests: Option<&Path>) -> anyhow::Result<()> {
    init_observability(&config.observability).await?;
    info!(app_name = APP_NAME, version = VERSION, "Starting Edgeplane control plane");
    log_config_info(&config);

    let snapshots = Arc::new(SnapshotSet::new());
    let endpoints = Arc::new(EndpointTranslator::new(snapshots.clone()));
    let translator = Arc::new(XdsTranslator::new(
        TranslationOptions::from(&config),
        snapshots.clone(),
        endpoints.clone(),
    ));
    let (handler, coordinator) = EventHandler::new(
        cache_for(&config),
        endpoints,
        Builder::new(BuilderConfig::from(&config)),
        vec![translator as Arc<dyn DagObserver>],
        Arc::new(StatusStore::new()),
        config.rebuild.clone(),
    );

    let shutdown = CancellationToken::new();
    let rebuilds = tokio::spawn(coordinator.run(shutdown.clone()));

    if let Some(path) = manifests {
        let resources = manifest::load_path(path)
            .with_context(|| format!("loading manifests from {}", path.display()))?;
        info!(path = %path.display(), count = resources.len(), "Loaded manifests");
        for resource in resources {
            handler.on_add(resource);
        }
    }
    handler.synced();

    let server = {
        let xds_config = config.xds.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { xds::serve(&xds_config, snapshots, shutdown).await })
    };

    let signals = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signals.cancel();
    });

    let served = server.await.context("xDS server task panicked")?;
    shutdown.cancel();
    rebuilds.await.context("rebuild coordinator task panicked")?;
    served?;

    info!("Edgeplane stopped");
    Ok(())
}

fn check(config: &AppConfig, manifests: &Path) -> anyhow::Result<()> {
    let cache = cache_for(config);
    let resources = manifest::load_path(manifests)
        .with_context(|| format!("loading manifests from {}", manifests.display()))?;
    // Endpoints never reach the cache and do not affect statuses.
    for resource in resources {
        cache.insert(resource);
    }

    let result = Builder::new(BuilderConfig::from(config)).build(&cache.snapshot());
    print_status_table(result.statuses.iter());

    if result.invalid_count() > 0 {
        println!();
        println!("{} invalid object(s)", result.invalid_count());
        process::exit(1);
    }
    Ok(())
}

fn print_status_table<'a>(statuses: impl Iterator<Item = (&'a ObjectKey, &'a ObjectStatus)>) {
    println!("{:<50} {:<10} {:<60}", "Object", "Status", "Description");
    println!("{}", "-".repeat(120));

    for (key, status) in statuses {
        let state = match status.current_status {
            CurrentStatus::Valid => "valid",
            CurrentStatus::Invalid => "invalid",
            CurrentStatus::Orphaned => "orphaned",
        };
        println!("{:<50} {:<10} {:<60}", key.to_string(), state, status.description);
        for condition in status.errors() {
            println!("{:<50} {:<10} {}: {}", "", "", condition.reason, condition.message);
        }
    }
}
