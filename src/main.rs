mod config;

use std::sync::Arc;
use std::time::Duration;

use beacon_router::{
    AppState, build_metrics_router, build_router,
    health::run_health_loop,
    registry::Registry,
};
use clap::Parser as _;
use config::Config;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting hybrid router with config: {:?}", config);

    let registry = match &config.providers {
        Some(path) => Registry::from_config_file(path).await?,
        None => Registry::from_env()?,
    };
    if registry.is_empty() {
        warn!("No providers configured; every inference will fail selection");
    }

    let app_state = AppState::new(registry)?;

    // One immediate probe round so the first requests see real health
    // flags, then the periodic loop keeps them fresh.
    app_state.router.health_check_all().await;
    tokio::spawn(run_health_loop(
        Arc::clone(&app_state.router),
        Duration::from_secs(config.health_interval_secs),
    ));

    if config.queue_workers {
        app_state.start_queue_workers();
    }

    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) =
            beacon_router::build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                warn!("Metrics server exited: {e}");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Hybrid router listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
