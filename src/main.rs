use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, Level};

use driftfield::config::Config;
use driftfield::metrics::{self, Metrics};
use driftfield::net::gateway::Gateway;
use driftfield::sim::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Driftfield server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    info!(
        "Configuration loaded: {}:{}, tick {} ms, world ±{}, aoi {}",
        config.bind_address,
        config.port,
        config.tick_period_ms,
        config.world_bounds.max_x,
        config.aoi_radius
    );

    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let engine = Engine::new(config.clone(), metrics);
    engine.start();

    let gateway_addr = SocketAddr::new(config.bind_address, config.port);
    let gateway = Gateway::bind(engine.clone(), gateway_addr).await?;

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = gateway.run() => {
            if let Err(e) = result {
                error!("Gateway error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    engine.shutdown().await;
    info!("Server stopped");

    Ok(())
}
