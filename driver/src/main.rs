use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use common::DriverConfig;
use driver::{build_router, monitor, spawn_driver, AppState, RelayChannel};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("driver=debug,axum=info,tower_http=info")
        .init();

    let config = DriverConfig::from_env();
    info!(
        "config: max_task_attempts={} heartbeat_timeout={:?} sweep={:?}",
        config.max_task_attempts, config.heartbeat_timeout, config.sweep_interval
    );

    // el relay es el canal de salida del loop y los buzones que leen los tasks
    let relay = RelayChannel::new();
    let (handle, _loop) = spawn_driver(config.clone(), Arc::new(relay.clone()));

    // monitor de heartbeats en segundo plano
    tokio::spawn(monitor::monitor_tasks(
        handle.clone(),
        relay.clone(),
        config.sweep_interval,
    ));

    let app = build_router(AppState {
        driver: handle,
        relay,
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.listen_addr))?;
    info!("driver escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
