use std::time::Duration;
use tracing::{info, warn};

use crate::relay::RelayChannel;
use crate::service::DriverHandle;

/// Barrido periódico de heartbeats: los tasks Running que no dieron señales
/// dentro del timeout se declaran fallidos y se vacía su buzón del grupo.
/// Termina cuando el loop del driver deja de responder.
pub async fn monitor_tasks(handle: DriverHandle, relay: RelayChannel, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let failed = match handle.sweep().await {
            Ok(failed) => failed,
            Err(e) => {
                warn!("monitor detenido: {}", e);
                return;
            }
        };

        for (group_id, task_id) in failed {
            info!("marcando task {} de {} como caído por falta de heartbeat", task_id, group_id);
            relay.discard(&task_id, &group_id);
        }
    }
}
