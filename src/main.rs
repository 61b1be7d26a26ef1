//! VRTY Bridge - cross-chain bridge engine
//!
//! Moves VRTY between the native ledger and wrapped wVRTY deployments by
//! locking or burning on the source chain and minting or releasing on the
//! destination, gated by a quorum of validator attestations.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod quorum;
mod state;

use chain::{AdapterRegistry, ChainRegistry};
use config::Settings;
use coordination::BridgeOrchestrator;
use events::BroadcastEventSink;
use metrics::MetricsServer;
use state::{MemoryRepository, PostgresRepository, TransactionRepository, TransactionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting VRTY Bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains ({})",
        settings.enabled_chains().len(),
        settings.bridge.instance_id
    );

    // Initialize transaction persistence
    let repository: Arc<dyn TransactionRepository> = match &settings.database {
        Some(database) => {
            let repository = PostgresRepository::new(database).await?;
            info!("Database connection established");
            repository.run_migrations().await?;
            Arc::new(repository)
        }
        None => {
            warn!("No [database] configured - transactions are kept in memory only");
            Arc::new(MemoryRepository::new())
        }
    };

    // Transition events fan out to the log and metrics
    let event_sink = Arc::new(BroadcastEventSink::new(settings.bridge.event_buffer));
    let event_log_handle = tokio::spawn(events::log_transitions(event_sink.subscribe()));

    let store = Arc::new(TransactionStore::new(repository, event_sink));

    // Chains, routes and adapters
    let registry = Arc::new(ChainRegistry::from_settings(&settings)?);
    let adapters = AdapterRegistry::from_settings(&settings)?;

    // Initialize orchestrator and pick up unfinished work
    let orchestrator = Arc::new(BridgeOrchestrator::new(
        &settings.bridge,
        &settings.validators,
        registry,
        adapters,
        store.clone(),
    )?);
    orchestrator.resume_pending().await?;
    info!("Bridge orchestrator initialized");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(server)
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = api::run_server(config, orchestrator).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if let Some(server) = metrics_server {
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start orchestrator
    let orchestrator_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = orchestrator.run().await {
                error!("Bridge orchestrator error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let interval = settings.bridge.cleanup_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                if let Err(e) = store.health_check().await {
                    warn!("Transaction store health check failed: {}", e);
                }

                match store.stats().await {
                    Ok(stats) if stats.manual_intervention > 0 => {
                        warn!(
                            "{} bridge transactions require manual intervention",
                            stats.manual_intervention
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to load transaction stats: {}", e),
                }
            }
        }
    });

    info!("VRTY Bridge is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    orchestrator.stop().await;

    // Abort background tasks
    api_handle.abort();
    orchestrator_handle.abort();
    health_handle.abort();
    event_log_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("VRTY Bridge stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vrty_bridge=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
}
