//! acsd - TR-069 ACS device authentication and task dispatch daemon
//!
//! The daemon listens for inbound CWMP sessions, gates every request
//! through the Digest/Basic authenticator, and dispatches queued tasks to
//! authenticated devices. A background sweeper reconciles tasks whose
//! device response never arrived.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acsd_core::auth::Authenticator;
use acsd_core::config::AcsConfig;
use acsd_core::credentials::CredentialStore;
use acsd_core::nonce::{NonceCache, NonceCacheConfig};
use acsd_core::task::{InMemoryTaskStore, TaskManager, TaskStore};
use acsd_daemon::http::{self, AppState};
use acsd_daemon::store::SqliteTaskStore;
use acsd_daemon::sweep::TimeoutSweeper;
use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// acsd - TR-069 ACS core daemon
#[derive(Parser, Debug)]
#[command(name = "acsd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "acsd.toml")]
    config: PathBuf,

    /// Override the CWMP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the task database path
    #[arg(long)]
    task_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AcsConfig::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.daemon.listen = listen;
    }
    if let Some(task_db) = args.task_db {
        config.daemon.task_db = Some(task_db);
    }

    let credentials = Arc::new(CredentialStore::from_config(&config.credentials));
    let nonces = Arc::new(NonceCache::new(NonceCacheConfig::with_ttl_secs(
        config.auth.nonce_ttl_secs,
    )));
    let authenticator = Arc::new(Authenticator::new(
        config.auth.realm.clone(),
        credentials,
        nonces,
        config.auth.single_use_nonces,
    ));

    let store: Arc<dyn TaskStore> = match &config.daemon.task_db {
        Some(path) => {
            info!(path = %path.display(), "opening task database");
            Arc::new(SqliteTaskStore::open(path).context("opening task database")?)
        },
        None => {
            info!("no task database configured, queue state is in-memory only");
            Arc::new(InMemoryTaskStore::new())
        },
    };
    let tasks = Arc::new(TaskManager::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = TimeoutSweeper::new(
        Arc::clone(&tasks),
        Duration::from_secs(config.tasks.sweep_interval_secs),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let state = Arc::new(AppState {
        authenticator,
        tasks,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(config.daemon.listen)
        .await
        .with_context(|| format!("binding CWMP listener on {}", config.daemon.listen))?;
    info!(addr = %config.daemon.listen, realm = %config.auth.realm, "CWMP listener ready");

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("CWMP server error")?;

    // Stop the sweeper after the listener drains
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;
    info!("shutdown complete");
    Ok(())
}
