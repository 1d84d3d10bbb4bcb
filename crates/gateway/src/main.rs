use gateway::api;
use gateway::config::GatewayConfig;
use gateway::persistence::{load_mirror, save_mirror, snapshot_path, spawn_snapshot_task};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env()?;
    let path = snapshot_path(&config.data_dir);
    let mirror = load_mirror(&path);

    let server_addr = config.server_addr;
    let network_id = config.network_id;
    let snapshot_interval = config.snapshot_interval;
    let state = gateway::build_state(config, mirror.clone())?;

    if state.dev.is_some() {
        tracing::warn!("ETHEREUM_RPC_URL not set; escrow runs on the in-process dev chain");
    }

    tokio::spawn(state.reconciler.clone().run());
    spawn_snapshot_task(mirror.clone(), path.clone(), snapshot_interval);

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    tracing::info!(addr = %server_addr, ?network_id, "payment gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let rows = save_mirror(&path, &mirror)?;
    tracing::info!(rows, "mirror snapshot flushed, shutting down");
    Ok(())
}
