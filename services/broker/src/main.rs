//! vmlease broker
//!
//! Serves the client WebSocket protocol, provisions one machine per
//! connected user and reclaims idle machines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmlease_broker::{
    api,
    backend::{HttpBackend, MockBackend, ProvisioningBackend},
    catalog::Catalog,
    config::{BackendKind, Config},
    connection::ConnectionRegistry,
    manager::{LifecycleEvent, ResourceManager},
    persistence::SqliteSnapshotStore,
    reaper::{IdleReaper, IdleReaperConfig},
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to VMLEASE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmlease broker");
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        reap_interval_secs = config.reap_interval.as_secs(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        id_domain = config.id_domain,
        "Configuration loaded"
    );

    let backend: Arc<dyn ProvisioningBackend> = match &config.backend {
        BackendKind::Mock => {
            warn!("Using mock provisioning backend");
            Arc::new(MockBackend::new())
        }
        BackendKind::Http { provisioner_url } => {
            info!(provisioner_url = %provisioner_url, "Using HTTP provisioning backend");
            Arc::new(HttpBackend::new(provisioner_url.clone())?)
        }
    };

    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => {
            warn!("No catalog configured; every start request will be rejected");
            Catalog::empty()
        }
    };
    info!(targets = catalog.len(), "Catalog loaded");

    let store = SqliteSnapshotStore::open(config.snapshot_path())
        .with_context(|| format!("Failed to open {}", config.snapshot_path().display()))?;

    let manager = ResourceManager::new(backend, config.id_domain);
    let registry = ConnectionRegistry::new();

    let reaper = IdleReaper::new(
        manager.clone(),
        registry.clone(),
        Arc::new(store),
        IdleReaperConfig {
            interval: config.reap_interval,
            idle_timeout: config.idle_timeout,
        },
    );

    // Must run before the first snapshot write replaces the old one.
    let orphan_cleanup = reaper
        .recover()
        .await
        .context("Failed to read previous snapshot")?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reaper.run(shutdown_rx).await;
        }
    });

    let mut events = manager.events();
    let event_log_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Ready { record }) => {
                    info!(user_id = %record.user_id, resource_id = %record.resource_id, "Lifecycle: ready");
                }
                Ok(LifecycleEvent::Error { user_id, error }) => {
                    warn!(user_id = %user_id, kind = error.kind(), "Lifecycle: error");
                }
                Ok(LifecycleEvent::Released { user_id, resource_id }) => {
                    info!(user_id = %user_id, resource_id = %resource_id, "Lifecycle: released");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let state = AppState::new(manager, registry, catalog);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reaper_handle).await {
        warn!(error = %e, "Idle reaper did not shut down in time");
    }

    if !orphan_cleanup.is_finished() {
        warn!("Orphan cleanup still running at shutdown");
        orphan_cleanup.abort();
    }
    event_log_handle.abort();

    info!("Broker shutdown complete");
    Ok(())
}
