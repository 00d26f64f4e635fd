//! Running a master: stores, executor, event bus, API and signal handling.

use crate::executor::{LoggingExecutor, WebhookExecutor};
use anyhow::Context;
use bosun_core::ports::{BuildExecutor, EventBus};
use bosun_db::{Database, MemoryStore};
use bosun_scheduler::{LocalEventBus, Master, MasterConfig, Stores};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

async fn open_stores(config: &MasterConfig) -> anyhow::Result<Stores> {
    match &config.database.url {
        Some(url) => {
            let db = Database::connect(url).await.context("connecting to database")?;
            db.migrate().await.context("running migrations")?;
            info!("Using PostgreSQL store");
            Ok(Stores {
                changes: Arc::new(db.changes()),
                requests: Arc::new(db.build_requests()),
                state: Arc::new(db.scheduler_state()),
            })
        }
        None => {
            warn!("No database configured; state is kept in memory only");
            Ok(Stores::shared(Arc::new(MemoryStore::new())))
        }
    }
}

fn build_executor(config: &MasterConfig) -> anyhow::Result<Arc<dyn BuildExecutor>> {
    Ok(match &config.executor.webhook_url {
        Some(url) => {
            info!(url = %url, "Dispatching builds to webhook");
            Arc::new(WebhookExecutor::new(
                url,
                Duration::from_secs(config.executor.timeout_secs),
            )?)
        }
        None => Arc::new(LoggingExecutor),
    })
}

pub async fn serve(config_path: &Path, config: MasterConfig) -> anyhow::Result<()> {
    let stores = open_stores(&config).await?;
    let executor = build_executor(&config)?;
    let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());

    let master = Master::start(&config, stores, event_bus, executor)
        .await
        .context("starting master")?;
    info!(master_id = %master.master_id(), name = %config.master.name, "Master started");

    let shutdown = CancellationToken::new();
    let reload = tokio::spawn(reload_on_hangup(
        master.clone(),
        config_path.to_path_buf(),
        shutdown.clone(),
    ));

    let app = bosun_api::create_router(Arc::new(bosun_api::AppState::new(master.clone())));
    let listener = tokio::net::TcpListener::bind(config.api.listen)
        .await
        .with_context(|| format!("binding {}", config.api.listen))?;
    info!(addr = %config.api.listen, "API listening");

    let signal_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_token.cancel();
        })
        .await;

    shutdown.cancel();
    let _ = reload.await;
    master.shutdown().await;
    info!("Master stopped");
    served.context("serving API")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
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
    info!("Shutdown requested");
}

/// Re-read the configuration on SIGHUP and apply it.
#[cfg(unix)]
async fn reload_on_hangup(master: Arc<Master>, path: std::path::PathBuf, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "Failed to listen for SIGHUP; reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!(path = %path.display(), "Reloading configuration");
                let result = match MasterConfig::from_file(&path) {
                    Ok(config) => master.reconfigure(&config).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(plan) => info!(
                        started = plan.to_start.len(),
                        stopped = plan.to_stop.len(),
                        kept = plan.to_keep.len(),
                        "Configuration reloaded"
                    ),
                    Err(e) => error!(error = %e, "Reload failed; keeping previous configuration"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_master: Arc<Master>, _path: std::path::PathBuf, cancel: CancellationToken) {
    cancel.cancelled().await;
}
