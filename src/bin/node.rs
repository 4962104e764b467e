//! Meshcache node server.
//!
//! One node of the federated cache: it registers itself in the
//! coordination store, discovers its peers, serves the peer RPC surface,
//! and optionally exposes the external HTTP gateway.
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `MESHCACHE_CONFIG` environment variable (path to TOML file)
//! 2. `./meshcache.toml` in the current directory
//! 3. Default configuration
//!
//! with `MESHCACHE_*` environment variables overriding in every case.

use meshcache::client::ClusterClient;
use meshcache::config::Config;
use meshcache::gateway;
use meshcache::group::{GroupDirectory, MapSource};
use meshcache::peers::PeerPicker;
use meshcache::registry::{RedisRegistry, ServiceRegistry};
use meshcache::rpc;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
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

    info!("Shutdown signal received, starting graceful shutdown");
}

fn load_config() -> Config {
    if let Ok(path) = std::env::var("MESHCACHE_CONFIG") {
        match Config::from_file_with_env(&path) {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
    if std::path::Path::new("meshcache.toml").exists() {
        match Config::from_file_with_env("meshcache.toml") {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
    Config::from_env()
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(&config.monitoring.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_tracing(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("Node failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> meshcache::Result<()> {
    let advertise = config.node.advertise_addr().to_string();
    let service = config.node.service_name.clone();
    info!(addr = %advertise, service = %service, "Starting meshcache node");

    // Registry first: bootstrap failure is fatal.
    let registry: Arc<RedisRegistry> =
        Arc::new(RedisRegistry::connect(config.registry.to_registry_config()).await?);

    // Directory and groups before anything can serve a request.
    let directory = Arc::new(GroupDirectory::new());
    let mut groups = Vec::new();
    if config.groups.is_empty() {
        warn!("No groups configured; creating an empty 'default' group");
        groups.push(directory.create_group(
            "default",
            1 << 20,
            Arc::new(MapSource::new::<String, String, _>([])),
        )?);
    }
    for group_config in &config.groups {
        let source = Arc::new(MapSource::new(group_config.seed.clone()));
        groups.push(directory.create_group(
            &group_config.name,
            group_config.capacity_bytes,
            source,
        )?);
    }

    // Peer discovery before the RPC listener accepts; early requests must
    // not observe an empty ring.
    let picker = PeerPicker::new(
        &advertise,
        &service,
        registry.clone() as Arc<dyn ServiceRegistry>,
        config.ring.to_ring_config(),
    )
    .await?;
    for group in &groups {
        group.register_peer_picker(picker.clone())?;
    }

    // RPC server.
    let listener = tokio::net::TcpListener::bind(&config.node.listen_addr).await?;
    info!(addr = %config.node.listen_addr, "RPC server listening");
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let rpc_task = {
        let app = rpc::router(directory.clone());
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let graceful = async move {
                let _ = stop_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "RPC server failed");
            }
        })
    };

    // Only now become discoverable.
    registry.register(&service, &advertise).await?;

    // Optional external gateway.
    let gateway_task = if config.gateway.enabled {
        let client = ClusterClient::new(
            &service,
            registry.clone() as Arc<dyn ServiceRegistry>,
            config.ring.to_ring_config(),
        )
        .await?;
        let listener = tokio::net::TcpListener::bind(&config.gateway.listen_addr).await?;
        info!(addr = %config.gateway.listen_addr, "Gateway listening");
        let app = gateway::router(client.clone());
        let mut stop_rx = stop_rx.clone();
        Some((
            client,
            tokio::spawn(async move {
                let graceful = async move {
                    let _ = stop_rx.changed().await;
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(graceful)
                    .await
                {
                    error!(error = %e, "Gateway failed");
                }
            }),
        ))
    } else {
        None
    };

    info!("Node running, press Ctrl+C to exit");
    shutdown_signal().await;

    // Teardown order: leave the cluster, stop discovery, close groups,
    // then drain the servers.
    if let Err(e) = registry.unregister().await {
        warn!(error = %e, "Unregister failed");
    }
    picker.shutdown().await;
    directory.close_all();

    let _ = stop_tx.send(true);
    let _ = rpc_task.await;
    if let Some((client, task)) = gateway_task {
        client.shutdown().await;
        let _ = task.await;
    }
    registry.stop_watchers();

    info!("Node stopped");
    Ok(())
}
