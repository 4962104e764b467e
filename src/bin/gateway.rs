//! Standalone HTTP gateway.
//!
//! Serves `GET/POST/DELETE /api/cache/{group}/{key}` and routes every
//! request to the owning cache node discovered through the registry. Runs
//! anywhere; it holds no cache state of its own.

use meshcache::client::ClusterClient;
use meshcache::config::Config;
use meshcache::gateway;
use meshcache::registry::{RedisRegistry, ServiceRegistry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&config.monitoring.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(config).await {
        error!("Gateway failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> meshcache::Result<()> {
    let registry: Arc<RedisRegistry> =
        Arc::new(RedisRegistry::connect(config.registry.to_registry_config()).await?);

    let client = ClusterClient::new(
        &config.node.service_name,
        registry.clone() as Arc<dyn ServiceRegistry>,
        config.ring.to_ring_config(),
    )
    .await?;

    let listener = tokio::net::TcpListener::bind(&config.gateway.listen_addr).await?;
    info!(addr = %config.gateway.listen_addr, service = %config.node.service_name, "Gateway listening");

    let app = gateway::router(client.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    client.shutdown().await;
    registry.stop_watchers();
    info!("Gateway stopped");
    Ok(())
}
