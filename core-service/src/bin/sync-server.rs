//! Headless sync server.
//!
//! Runs the sync loop for one site until SIGINT or SIGTERM and optionally
//! exposes the REST control surface.

use anyhow::{Context, Result};
use bridge_traits::time::LogLevel;
use clap::Parser;
use core_runtime::config::CoreConfig;
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use core_service::{api, CoreService};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(
    name = "sync-server",
    about = "Keeps published files in sync between studio and remote sites",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Site id of this machine
    #[clap(long = "active_site", env = "SYNC_ACTIVE_SITE")]
    active_site: String,

    /// JSON settings file (defaults to the per-user config directory)
    #[clap(long, env = "SYNC_SETTINGS")]
    settings: Option<PathBuf>,

    /// SQLite database holding representations
    #[clap(long, env = "SYNC_DATABASE", default_value = "site-sync.db")]
    database: PathBuf,

    /// Address for the REST control surface
    #[clap(long, env = "SYNC_API_BIND")]
    bind: Option<SocketAddr>,

    /// Parallel transfers
    #[clap(long, env = "SYNC_WORKERS")]
    workers: Option<usize>,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// pretty, compact or json
    #[clap(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: LogLevel = args
        .log_level
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let mut logging = LoggingConfig::default().with_level(level);
    if let Some(format) = &args.log_format {
        logging = logging.with_format(format.parse::<LogFormat>()?);
    }
    init_logging(logging)?;

    let mut builder = CoreConfig::builder()
        .database_path(&args.database)
        .local_site_id(&args.active_site);
    if let Some(path) = &args.settings {
        builder = builder.settings_path(path);
    }
    if let Some(workers) = args.workers {
        builder = builder.worker_threads(workers);
    }
    if let Some(addr) = args.bind {
        builder = builder.api_bind(addr);
    }
    let config = builder.build().context("Invalid configuration")?;

    let core = CoreService::bootstrap(config)
        .await
        .context("Failed to bootstrap sync server")?;
    core.start()?;
    info!(site = %args.active_site, "Sync server started");

    let api_shutdown = CancellationToken::new();
    let api_task = match core.config().api_bind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            let token = api_shutdown.clone();
            let router = core.router();
            Some(tokio::spawn(async move {
                if let Err(e) = api::serve(listener, router, token.cancelled_owned()).await {
                    error!(error = %e, "Control API stopped");
                }
            }))
        }
        None => None,
    };

    wait_for_signal().await?;
    info!("Shutdown requested");

    api_shutdown.cancel();
    if let Some(task) = api_task {
        let _ = task.await;
    }
    core.shutdown().await?;

    info!("Sync server exited");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
