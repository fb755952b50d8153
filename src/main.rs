//! clusterd server: loads `clusterd.toml` (if present), starts a
//! `ClusterRuntime`, and serves the HTTP API until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clusterd::config::ClusterConfig;
use clusterd::store::InMemoryStore;
use clusterd::{ClusterRuntime, Result, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    print_banner();

    let config_path = PathBuf::from("clusterd.toml");
    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => ClusterConfig::from_toml_str(&contents)
            .map_err(|e| clusterd::ClusterError::Configuration(e.to_string()))?,
        Err(_) => {
            info!("no clusterd.toml found, using defaults");
            ClusterConfig::default()
        }
    };

    let addr = config.cluster_advertise_address.clone();
    let store: Arc<dyn clusterd::store::Store> = Arc::new(InMemoryStore::new());
    let runtime = ClusterRuntime::new(config, store)?;
    runtime.start().await?;

    let router = clusterd::api::build_router(runtime.handle());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, version = VERSION, "clusterd listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = &result {
        error!(error = %e, "server exited with error");
    }
    runtime.shutdown().await;
    result.map_err(clusterd::ClusterError::from)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_banner() {
    println!("clusterd v{VERSION}");
    println!("cluster coordination and replication daemon");
    println!();
}
