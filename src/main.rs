mod config;

use anyhow::Context;
use clap::Parser as _;
use config::Config;
use std::future::IntoFuture;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use vramkeeper::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    allocator::Allocator,
    janitor::Janitor,
    providers::ProviderRegistry,
    settings::{EngineFile, WatchedFile, receive_updates},
    snapshot::Snapshot,
};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse().validate()?;

    let filter = if config.verbose {
        tracing_subscriber::EnvFilter::new("vramkeeper=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Starting vramkeeper with config: {:?}", config);

    let engine = EngineFile::from_file(&config.config).await?;
    let registry = ProviderRegistry::from_config(&engine.providers, engine.timeouts().load)
        .context("Failed to build provider adapters")?;
    let allocator = Allocator::new(engine.ledger()?, registry, engine.timeouts());

    let discovered = allocator.discover().await;
    info!(
        added = discovered.added,
        updated = discovered.updated,
        "Provider discovery finished"
    );

    if let Some(path) = &config.snapshot {
        match Snapshot::read(path).await {
            Ok(Some(snapshot)) => {
                let restored = allocator.warm_start(&snapshot.resident).await;
                info!(restored = restored.len(), "Warm start from snapshot");
            }
            Ok(None) => info!("No snapshot found, cold start"),
            Err(e) => warn!(error = %e, "Ignoring unreadable snapshot"),
        }
    }

    if config.watch {
        receive_updates(
            allocator.clone(),
            engine.capacity.clone(),
            WatchedFile(config.config.clone()),
        )
        .await?;
    }

    let janitor = Janitor::new(
        allocator.clone(),
        engine.janitor_config(config.snapshot.clone()),
    )
    .spawn();

    let mut serves = JoinSet::new();

    let prometheus_layer = if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        serves.spawn(axum::serve(listener, metrics_router).into_future());
        info!("Metrics endpoint enabled on {}", bind_addr);
        Some(prometheus_layer)
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    let mut router = build_router(AppState::new(allocator));
    if let Some(prometheus_layer) = prometheus_layer {
        router = router.layer(prometheus_layer);
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    serves.spawn(axum::serve(listener, router).into_future());
    info!("vramkeeper listening on {}", bind_addr);

    let result = match serves.join_next().await {
        Some(result) => result?.map_err(anyhow::Error::from),
        None => {
            error!("No server tasks were spawned");
            Err(anyhow::anyhow!("No server tasks were spawned"))
        }
    };
    janitor.shutdown().await;
    result
}
