//! Teldrive server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teldrive_core::MemoryCache;
use teldrive_core::config::AppConfig;
use teldrive_server::check::{self, CheckOptions};
use teldrive_server::{AppState, create_router, cron};
use tokio_util::sync::CancellationToken;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Teldrive - file storage on top of chat channels
#[derive(Parser, Debug)]
#[command(name = "teldrive")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "TELDRIVE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (default)
    Run,
    /// Compare stored files with channel contents
    Check {
        /// Only check this user
        #[arg(long)]
        user: Option<i64>,
        /// Delete orphan messages and mark missing files for deletion
        #[arg(long)]
        clean: bool,
        /// Report path
        #[arg(long, default_value = "missing_files.json")]
        output: PathBuf,
    },
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else if std::env::vars().any(|(k, _)| k.starts_with("TELDRIVE_") && k != "TELDRIVE_CONFIG") {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    } else {
        anyhow::bail!("no configuration: {path} does not exist and no TELDRIVE_ variables are set");
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("TELDRIVE_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load configuration")?;

    let warnings = config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    for warning in warnings {
        tracing::warn!("Configuration warning: {}", warning);
    }
    Ok(config)
}

/// Open the stores and wire the services.
async fn build_state(config: AppConfig) -> Result<(AppState, Arc<MemoryCache>)> {
    let (metadata, bus) = teldrive_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    tracing::info!("Metadata store initialized");

    let connector = teldrive_upstream::from_config(&config.upstream.backend)
        .await
        .context("failed to initialize upstream backend")?;
    tracing::info!("Upstream backend initialized");

    let cache = Arc::new(MemoryCache::new(config.cache.max_entries));
    let state = AppState::new(config, metadata, bus, connector, cache.clone());
    Ok((state, cache))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

async fn serve(config: AppConfig) -> Result<()> {
    teldrive_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let read_timeout = config.server.read_timeout_secs;
    let write_timeout = config.server.write_timeout_secs;

    let (state, cache) = build_state(config).await?;

    let shutdown = CancellationToken::new();
    let jobs = cron::spawn(state.clone(), Some(cache), shutdown.clone());
    tracing::info!(jobs = jobs.len(), "Background jobs spawned");

    let mut app = create_router(state.clone());
    if read_timeout > 0 {
        app = app.layer(RequestBodyTimeoutLayer::new(Duration::from_secs(read_timeout)));
    }
    if write_timeout > 0 {
        app = app.layer(TimeoutLayer::new(Duration::from_secs(write_timeout)));
    }

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    shutdown.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            tracing::warn!(error = %e, "background job ended abnormally");
        }
    }
    state.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn run_check(config: AppConfig, options: CheckOptions) -> Result<()> {
    let (state, _) = build_state(config).await?;
    let result = check::run(&state, &options).await;
    state.shutdown().await;
    let reports = result?;
    let missing: usize = reports.iter().map(|r| r.missing.len()).sum();
    let orphans: usize = reports.iter().map(|r| r.orphans).sum();
    tracing::info!(channels = reports.len(), missing, orphans, "Check finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Teldrive v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => serve(config).await,
        Command::Check {
            user,
            clean,
            output,
        } => run_check(config, CheckOptions { user, clean, output }).await,
    }
}
