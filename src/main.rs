//! Library Vault - service account lending daemon
//!
//! Usage:
//!   library-vault [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>  Path to config file
//!   -v, --verbose        Increase log verbosity
//!   --json-logs          Output logs as JSON

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use library_vault::alerting::{Alerter, NoopAlerter, TelegramAlerter};
use library_vault::audit::AuditLog;
use library_vault::checkout::{HandlerSettings, HandlerStack};
use library_vault::config::{self, Config, StorageBackend};
use library_vault::directory::LdapClient;
use library_vault::library::Library;
use library_vault::roles::RoleManager;
use library_vault::rotation::{MaintenanceScheduler, Reconciler, RootRotator};
use library_vault::server::LibraryServer;
use library_vault::storage::{MemoryStorage, SqliteStorage, StorageHandle};

#[derive(Parser, Debug)]
#[command(name = "library-vault")]
#[command(author, version, about = "Service account lending daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("library_vault={log_level},warn")));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting library-vault");

    let config = Config::load(args.config.as_ref())?;
    tracing::debug!(role = ?config.server.role, storage = ?config.storage.backend, "loaded configuration");

    let storage: StorageHandle = match config.storage.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStorage::open(&config.storage.db_path)?),
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, loans and passwords are lost on exit");
            Arc::new(MemoryStorage::new())
        }
    };

    if config.is_leader() {
        config::seed_engine_config(storage.as_ref(), config.engine.as_ref()).await?;
    }

    let alerter: Arc<dyn Alerter> = match TelegramAlerter::from_config(&config.alerting, storage.as_ref()).await {
        Some(telegram) => Arc::new(telegram),
        None => Arc::new(NoopAlerter),
    };

    let client = Arc::new(LdapClient::new());
    let stack = HandlerStack::build(
        config.server.role,
        storage.clone(),
        client.clone(),
        alerter.clone(),
        HandlerSettings {
            overdue_retry: config.overdue_retry(),
        },
    )
    .await?;

    let library = Arc::new(Library::new(storage.clone(), stack.handler.clone()));
    let roles = Arc::new(RoleManager::new(storage.clone(), client.clone()));

    let audit = if config.audit.enabled {
        Some(Arc::new(AuditLog::new(&config.audit.db_path, config.audit.retention_days)?))
    } else {
        None
    };

    let reconciler = stack
        .passwords
        .clone()
        .map(|passwords| {
            Arc::new(Reconciler::new(passwords, stack.locks.clone(), alerter.clone()).with_roles(roles.clone()))
        });

    let root = config.is_leader().then(|| {
        Arc::new(RootRotator::new(
            client.clone(),
            alerter.clone(),
            config.lending.root_rollback_attempts,
            Duration::from_millis(config.lending.root_rollback_backoff_ms),
        ))
    });

    let scheduler = MaintenanceScheduler::start(&config.lending, storage.clone(), reconciler, audit.clone()).await?;

    let server = Arc::new(LibraryServer::new(
        config.clone(),
        library,
        roles,
        stack.watcher.clone(),
        root,
        audit,
    ));
    let shutdown = server.shutdown_token();

    let server_handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "server error");
            }
        }
    });

    shutdown_signal().await;

    tracing::info!("shutting down");

    shutdown.cancel();
    if let Err(e) = server_handle.await {
        tracing::error!(error = %e, "server task failed");
    }

    let watched = stack.watcher.as_ref().map_or(0, |w| w.watched_accounts().len());
    stack.shutdown();
    scheduler.shutdown().await?;

    tracing::info!(watched_accounts = watched, "stopped, watchers resume on next start");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}
