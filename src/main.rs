use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotamesh::config::ServiceConfig;
use quotamesh::ratelimit::profiles_from_file;
use quotamesh::reload::ProfileWatcher;
use quotamesh::QuotaEngine;

/// Distributed, hot-reloadable quota enforcement.
#[derive(Debug, Parser)]
#[command(name = "quotamesh", version, about)]
struct Args {
    /// Service configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Quota profile file; overrides `profiles.path` from the configuration
    #[arg(short, long)]
    profiles: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Validate configuration and profiles, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Quotamesh");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = args.profiles {
        config.profiles.path = Some(path);
    }
    info!(
        store = ?config.store.backend,
        enabled = config.enforcement.enabled,
        inheritance = ?config.enforcement.token_inheritance,
        "Configuration loaded"
    );

    let profiles = match &config.profiles.path {
        Some(path) => profiles_from_file(path)
            .with_context(|| format!("Failed to load profiles from {}", path.display()))?,
        None => {
            warn!("No profile file configured; every quota is unknown until profiles are published");
            Default::default()
        }
    };

    if args.check {
        let registry = quotamesh::ratelimit::ProfileRegistry::new();
        let report = registry.load(&profiles);
        for (name, reason) in &report.skipped {
            warn!(quota = %name, reason = %reason, "Profile would be skipped");
        }
        info!(
            loaded = report.added.len(),
            disabled = report.disabled.len(),
            skipped = report.skipped.len(),
            "Configuration check complete"
        );
        if !report.skipped.is_empty() {
            anyhow::bail!("{} profile(s) failed to compile", report.skipped.len());
        }
        return Ok(());
    }

    let engine = QuotaEngine::from_config(&config)
        .await
        .context("Failed to initialize quota engine")?;
    let report = engine.update_profiles(&profiles);
    info!(
        quotas = engine.registry().len(),
        subscribers = report.delivered,
        "Quota profiles loaded"
    );

    match (&config.profiles.path, config.profiles.reload_interval()) {
        (Some(path), Some(interval)) => {
            let watcher = ProfileWatcher::new(path.clone(), interval, Arc::clone(engine.bus()));
            watcher.run(shutdown_signal()).await;
        }
        _ => shutdown_signal().await,
    }

    info!("Quotamesh stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
