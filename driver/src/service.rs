//! Loop de control del driver: un único task de tokio dueño del
//! `GroupCommDriver`. Todas las mutaciones llegan como comandos por un canal
//! mpsc, así que nunca hay dos escritores sobre la topología.

use std::sync::Arc;
use std::time::Instant;

use common::{
    DriverConfig, Epoch, GroupCommError, GroupId, GroupStatus, Inbox, MessageChannel,
    MessageKind, OperatorSpec, RegistrationResponse, Result, TaskId, TopologyShape,
    TopologySnapshot, DRIVER_ID,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::GroupCommDriver;

const COMMAND_BUFFER: usize = 256;

pub enum DriverCommand {
    CreateGroup {
        group_id: GroupId,
        members: Vec<TaskId>,
        shape: Option<TopologyShape>,
        operators: Vec<OperatorSpec>,
        reply: oneshot::Sender<Result<Arc<TopologySnapshot>>>,
    },
    Registered {
        group_id: GroupId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<RegistrationResponse>>,
    },
    Running {
        group_id: GroupId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Completed {
        group_id: GroupId,
        task_id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Failed {
        group_id: GroupId,
        task_id: TaskId,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Acked {
        group_id: GroupId,
        task_id: TaskId,
        epoch: Epoch,
    },
    Heartbeat {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Sweep {
        reply: oneshot::Sender<Vec<(GroupId, TaskId)>>,
    },
    Snapshot {
        group_id: GroupId,
        reply: oneshot::Sender<Result<Arc<TopologySnapshot>>>,
    },
    Status {
        group_id: GroupId,
        reply: oneshot::Sender<Result<GroupStatus>>,
    },
}

/// Punto de entrada clonable al loop del driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverCommand>,
}

fn loop_closed() -> GroupCommError {
    GroupCommError::transport(DRIVER_ID, "el loop del driver terminó")
}

impl DriverHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DriverCommand,
    ) -> std::result::Result<T, GroupCommError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| loop_closed())?;
        rx.await.map_err(|_| loop_closed())
    }

    pub async fn create_group(
        &self,
        group_id: impl Into<GroupId>,
        members: Vec<TaskId>,
        shape: Option<TopologyShape>,
        operators: Vec<OperatorSpec>,
    ) -> Result<Arc<TopologySnapshot>> {
        let group_id = group_id.into();
        self.request(|reply| DriverCommand::CreateGroup {
            group_id,
            members,
            shape,
            operators,
            reply,
        })
        .await?
    }

    pub async fn task_registered(&self, group_id: &str, task_id: &str) -> Result<RegistrationResponse> {
        self.request(|reply| DriverCommand::Registered {
            group_id: group_id.to_string(),
            task_id: task_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn task_running(&self, group_id: &str, task_id: &str) -> Result<()> {
        self.request(|reply| DriverCommand::Running {
            group_id: group_id.to_string(),
            task_id: task_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn task_completed(&self, group_id: &str, task_id: &str) -> Result<()> {
        self.request(|reply| DriverCommand::Completed {
            group_id: group_id.to_string(),
            task_id: task_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn task_failed(&self, group_id: &str, task_id: &str, reason: &str) -> Result<()> {
        self.request(|reply| DriverCommand::Failed {
            group_id: group_id.to_string(),
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            reply,
        })
        .await?
    }

    /// Sin respuesta: los ACKs no bloquean a quien los reenvía.
    pub async fn task_acked(&self, group_id: &str, task_id: &str, epoch: Epoch) -> Result<()> {
        self.tx
            .send(DriverCommand::Acked {
                group_id: group_id.to_string(),
                task_id: task_id.to_string(),
                epoch,
            })
            .await
            .map_err(|_| loop_closed())
    }

    pub async fn heartbeat(&self, task_id: &str) -> Result<bool> {
        self.request(|reply| DriverCommand::Heartbeat {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn sweep(&self) -> Result<Vec<(GroupId, TaskId)>> {
        self.request(|reply| DriverCommand::Sweep { reply }).await
    }

    pub async fn snapshot(&self, group_id: &str) -> Result<Arc<TopologySnapshot>> {
        self.request(|reply| DriverCommand::Snapshot {
            group_id: group_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn status(&self, group_id: &str) -> Result<GroupStatus> {
        self.request(|reply| DriverCommand::Status {
            group_id: group_id.to_string(),
            reply,
        })
        .await?
    }
}

/// Lanza el loop del driver. Los mensajes de control que genera cada comando
/// se envían por `channel` antes de responder al llamador.
pub fn spawn_driver(
    config: DriverConfig,
    channel: Arc<dyn MessageChannel>,
) -> (DriverHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let driver = GroupCommDriver::new(config);
    let join = tokio::spawn(run_loop(driver, rx, channel));
    (DriverHandle { tx }, join)
}

async fn run_loop(
    mut driver: GroupCommDriver,
    mut rx: mpsc::Receiver<DriverCommand>,
    channel: Arc<dyn MessageChannel>,
) {
    info!("loop del driver iniciado");

    while let Some(command) = rx.recv().await {
        match command {
            DriverCommand::CreateGroup {
                group_id,
                members,
                shape,
                operators,
                reply,
            } => {
                let result = driver.create_group(&group_id, &members, shape, operators);
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(result);
            }
            DriverCommand::Registered {
                group_id,
                task_id,
                reply,
            } => {
                let result = driver.task_registered(&group_id, &task_id);
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(result);
            }
            DriverCommand::Running {
                group_id,
                task_id,
                reply,
            } => {
                let result = driver.task_running(&group_id, &task_id);
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(result);
            }
            DriverCommand::Completed {
                group_id,
                task_id,
                reply,
            } => {
                let result = driver.task_completed(&group_id, &task_id);
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(result);
            }
            DriverCommand::Failed {
                group_id,
                task_id,
                reason,
                reply,
            } => {
                let result = driver.task_failed(&group_id, &task_id, &reason);
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(result);
            }
            DriverCommand::Acked {
                group_id,
                task_id,
                epoch,
            } => {
                if let Err(e) = driver.task_acked(&group_id, &task_id, epoch) {
                    debug!("ACK ignorado: {}", e);
                }
            }
            DriverCommand::Heartbeat { task_id, reply } => {
                let _ = reply.send(driver.heartbeat(&task_id));
            }
            DriverCommand::Sweep { reply } => {
                let failed = driver.sweep(Instant::now());
                flush(&mut driver, channel.as_ref()).await;
                let _ = reply.send(failed);
            }
            DriverCommand::Snapshot { group_id, reply } => {
                let _ = reply.send(driver.snapshot(&group_id));
            }
            DriverCommand::Status { group_id, reply } => {
                let _ = reply.send(driver.status(&group_id));
            }
        }
    }

    info!("loop del driver terminado");
}

/// Envía el outbox. Un destino caído no detiene al resto: el driver se entera
/// de la falla por su propio camino (reporte o barrido).
async fn flush(driver: &mut GroupCommDriver, channel: &dyn MessageChannel) {
    for message in driver.drain_outbox() {
        let destination = message.destination.clone();
        if let Err(e) = channel.send(&destination, message).await {
            warn!("no se pudo enviar control a {}: {}", destination, e);
        }
    }
}

/// Reenvía al loop los `ControlAck` que llegan al buzón del driver.
pub async fn forward_acks(inbox: Arc<Inbox>, handle: DriverHandle) {
    loop {
        let notified = inbox.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        for message in inbox.drain_control() {
            if message.kind != MessageKind::ControlAck {
                debug!("mensaje de control inesperado en el driver: {:?}", message.kind);
                continue;
            }
            if handle
                .task_acked(&message.group_id, &message.source, message.epoch)
                .await
                .is_err()
            {
                return;
            }
        }

        notified.await;
    }
}
