use std::sync::Arc;

use anyhow::{Context, Result};
use common::{Inbox, TaskConfig};
use reqwest::Client;
use tracing::{info, warn};
use worker::{demo, heartbeat_loop, poll_loop, register_with_retry, DriverClient, GroupCommClient, HttpChannel};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("worker=debug,reqwest=info")
        .init();

    let config = TaskConfig::from_env();
    info!(
        "task {} del grupo {} contra {}",
        config.task_id, config.group_id, config.driver_url
    );

    let http = Client::new();
    let driver = DriverClient::new(
        http.clone(),
        config.driver_url.clone(),
        config.group_id.clone(),
        config.task_id.clone(),
    );
    let inbox = Arc::new(Inbox::new(config.task_id.clone()));
    let client = GroupCommClient::new(
        config.task_id.clone(),
        Arc::new(HttpChannel::new(http, config.driver_url.clone())),
        Arc::clone(&inbox),
        config.operator_timeout,
    );
    let token = client.shutdown_token();

    let registration = register_with_retry(&driver, config.poll_interval, &token)
        .await
        .context("registrando el task en el driver")?;

    tokio::spawn(poll_loop(
        driver.clone(),
        inbox,
        config.poll_interval,
        token.clone(),
    ));
    tokio::spawn(heartbeat_loop(
        driver.clone(),
        config.heartbeat_interval,
        token.clone(),
    ));

    driver.running().await.context("reportando Running")?;

    // 1) correr el job; 2) reportar el resultado al driver
    let outcome = demo::run(&client, &registration.group_id).await;
    match outcome {
        Ok(Some(summary)) => {
            info!("job terminado: total = {}", summary.total);
            for (task_id, partial) in &summary.partials {
                info!("  {} -> {}", task_id, partial);
            }
            driver.completed().await?;
        }
        Ok(None) => {
            info!("parte del job terminada");
            driver.completed().await?;
        }
        Err(e) => {
            warn!("el job falló: {}", e);
            driver.failed(e.to_string()).await?;
        }
    }

    token.cancel();
    Ok(())
}
