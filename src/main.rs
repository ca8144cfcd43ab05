//! Token Deployer - multi-chain token deployment orchestrator
//!
//! Deploys a configured token on every selected chain, links each deployed
//! peer with the hub chain and tracks per-chain progress durably.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod locks;
mod metrics;
mod model;
mod state;

use chain::{ChainManager, ChainRegistry, EvmDeploymentClient};
use config::Settings;
use coordination::Orchestrator;
use metrics::MetricsServer;
use state::{DeploymentStore, MemoryStore, PgStateManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Token Deployer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (hub: {})",
        settings.enabled_chains().len(),
        settings.orchestrator.hub_chain
    );

    // Initialize storage
    let store: Arc<dyn DeploymentStore> = if settings.database.is_memory() {
        warn!("Using in-memory storage; deployment state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let manager = PgStateManager::new(&settings.database).await?;
        info!("Database connection established");
        manager.run_migrations().await?;
        Arc::new(manager)
    };

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Initialize chain connections and the deployment client
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!("Chain connections initialized");

    let registry = Arc::new(ChainRegistry::from_settings(&settings));
    let client = Arc::new(EvmDeploymentClient::new(
        chain_manager.clone(),
        registry.clone(),
        &settings.wallet,
        &settings.contracts,
    )?);
    info!("Deploying from wallet {:?}", client.wallet_address());

    // Initialize orchestrator and recover interrupted work
    let orchestrator = Orchestrator::new(
        store.clone(),
        client,
        registry,
        settings.orchestrator.clone(),
    );
    let interrupted = orchestrator.recover().await?;
    if interrupted > 0 {
        warn!("Marked {} interrupted executions as timed out", interrupted);
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let orchestrator = orchestrator.clone();
        let chain_manager = chain_manager.clone();
        async move {
            if let Err(e) = api::run_server(config, orchestrator, chain_manager).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start reconciliation loop
    let orchestrator_handle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if let Err(e) = orchestrator.run().await {
                error!("Orchestrator error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.orchestrator.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                let mut healthy = true;
                for (chain, chain_healthy) in health {
                    if !chain_healthy {
                        warn!("Chain {} health check failed", chain);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Token Deployer is running");
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
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Token Deployer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,token_deployer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("DEPLOYER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
