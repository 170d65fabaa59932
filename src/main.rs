//! Crosslock resolver service
//!
//! Accepts swap orders over HTTP and drives them through escrow setup and
//! settlement on an EVM chain and a TON chain.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crosslock_resolver::api::{self, AppState};
use crosslock_resolver::config::Settings;
use crosslock_resolver::intake::OrderService;
use crosslock_resolver::metrics::{self, MetricsServer};
use crosslock_resolver::orchestrator::{FlowWorker, Orchestrator, SystemClock};
use crosslock_resolver::resolver::ChainRegistry;
use crosslock_resolver::store;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting crosslock resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.service.instance_id
    );

    // Open the order store
    let order_store = store::connect(&settings.database)
        .await
        .context("Failed to open order store")?;
    info!("Order store ready");

    // Build one resolver per enabled chain
    let chains = Arc::new(
        ChainRegistry::from_settings(&settings).context("Failed to build chain resolvers")?,
    );
    chains.initialize_all().await;
    info!("Resolvers initialized for chains {:?}", chains.chain_ids());

    // Orchestrator and its command queue
    let (commands, queue) = mpsc::channel(settings.service.command_queue_size);
    let orchestrator = Arc::new(Orchestrator::new(
        order_store.clone(),
        chains.clone(),
        Arc::new(SystemClock),
        settings.orchestrator.clone(),
        commands,
    ));

    // The worker must consume before recovery fills the queue
    let worker_handle = tokio::spawn(FlowWorker::new(orchestrator.clone(), queue).run());

    let recovery = orchestrator
        .resume_all()
        .await
        .context("Failed to recover open orders")?;
    if recovery.attention > 0 {
        warn!(
            "{} orders need manual intervention, see their attention notes",
            recovery.attention
        );
    }

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            orders: Arc::new(OrderService::new(order_store.clone(), orchestrator.clone())),
            chains: chains.clone(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let order_store = order_store.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chains.health_check().await {
                    metrics::record_chain_health(chain_id, chain_ok);
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = order_store.health_check().await {
                    warn!("Order store health check failed: {}", e);
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

    info!("Crosslock resolver is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight flows resume from the store on the next start
    orchestrator.shutdown();
    api_handle.abort();
    worker_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Crosslock resolver stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,crosslock_resolver=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
