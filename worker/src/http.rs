//! Transporte HTTP contra el relay del driver: los mensajes salientes se
//! publican con POST y los entrantes se retiran con un poll periódico.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Ack, ErrorResponse, GroupCommError, HeartbeatRequest, Inbox, Message, MessageChannel,
    PollRequest, PollResponse, RegistrationResponse, Result, TaskEventRequest, TaskId, DRIVER_ID,
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Convierte la respuesta del driver en el tipo esperado o en un error de
/// transporte con el cuerpo `{ "error": ... }`.
async fn read_json<T: DeserializeOwned>(destination: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let message = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => format!("status {}", status),
        };
        return Err(GroupCommError::transport(destination, message));
    }
    resp.json::<T>()
        .await
        .map_err(|e| GroupCommError::transport(destination, e.to_string()))
}

async fn post_json<B: Serialize, T: DeserializeOwned>(
    http: &Client,
    url: &str,
    destination: &str,
    body: &B,
) -> Result<T> {
    let resp = http
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| GroupCommError::transport(destination, e.to_string()))?;
    read_json(destination, resp).await
}

/* ---------------- canal de mensajes ---------------- */

#[derive(Clone)]
pub struct HttpChannel {
    http: Client,
    base_url: String,
}

impl HttpChannel {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MessageChannel for HttpChannel {
    async fn send(&self, destination: &TaskId, mut message: Message) -> Result<()> {
        message.destination = destination.clone();
        let url = format!("{}/api/v1/messages", self.base_url);
        let _: Ack = post_json(&self.http, &url, destination, &message).await?;
        Ok(())
    }
}

/* ---------------- ciclo de vida del task ---------------- */

/// Llamadas de ciclo de vida de un task contra la API del driver.
#[derive(Clone)]
pub struct DriverClient {
    http: Client,
    base_url: String,
    group_id: String,
    task_id: TaskId,
}

impl DriverClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        group_id: impl Into<String>,
        task_id: impl Into<TaskId>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            group_id: group_id.into(),
            task_id: task_id.into(),
        }
    }

    fn task_url(&self, event: &str) -> String {
        format!("{}/api/v1/groups/{}/tasks/{}", self.base_url, self.group_id, event)
    }

    fn event(&self, reason: Option<String>) -> TaskEventRequest {
        TaskEventRequest {
            task_id: self.task_id.clone(),
            reason,
        }
    }

    pub async fn register(&self) -> Result<RegistrationResponse> {
        let url = self.task_url("register");
        post_json(&self.http, &url, DRIVER_ID, &self.event(None)).await
    }

    pub async fn running(&self) -> Result<()> {
        let url = self.task_url("running");
        let _: Ack = post_json(&self.http, &url, DRIVER_ID, &self.event(None)).await?;
        Ok(())
    }

    pub async fn completed(&self) -> Result<()> {
        let url = self.task_url("completed");
        let _: Ack = post_json(&self.http, &url, DRIVER_ID, &self.event(None)).await?;
        Ok(())
    }

    pub async fn failed(&self, reason: impl Into<String>) -> Result<()> {
        let url = self.task_url("failed");
        let body = self.event(Some(reason.into()));
        let _: Ack = post_json(&self.http, &url, DRIVER_ID, &body).await?;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let url = format!("{}/api/v1/tasks/heartbeat", self.base_url);
        let body = HeartbeatRequest {
            task_id: self.task_id.clone(),
        };
        let _: Ack = post_json(&self.http, &url, DRIVER_ID, &body).await?;
        Ok(())
    }

    /// Retira el buzón del task en el relay.
    pub async fn poll(&self) -> Result<Vec<Message>> {
        let url = format!("{}/api/v1/messages/poll", self.base_url);
        let body = PollRequest {
            task_id: self.task_id.clone(),
        };
        let resp: PollResponse = post_json(&self.http, &url, DRIVER_ID, &body).await?;
        Ok(resp.messages)
    }
}

/* ---------------- loops de fondo ---------------- */

/// Trae periódicamente los mensajes del relay al buzón local hasta que se
/// cancele `token`.
pub async fn poll_loop(
    driver: DriverClient,
    inbox: Arc<Inbox>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("poll de {} detenido", inbox.owner());
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match driver.poll().await {
            Ok(messages) => {
                for message in messages {
                    if !inbox.deliver(message) {
                        debug!("[{}] mensaje duplicado descartado", inbox.owner());
                    }
                }
            }
            Err(e) => warn!("[{}] poll falló: {}", inbox.owner(), e),
        }
    }
}

/// Heartbeats periódicos al driver hasta que se cancele `token`.
pub async fn heartbeat_loop(driver: DriverClient, interval: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match driver.heartbeat().await {
            Ok(()) => debug!("heartbeat de {} enviado", driver.task_id),
            Err(e) => warn!("heartbeat de {} falló: {}", driver.task_id, e),
        }
    }
}

/// Registra el task, reintentando mientras el driver no acepte conexiones.
/// Un error devuelto por el driver se propaga sin reintentar.
pub async fn register_with_retry(
    driver: &DriverClient,
    interval: Duration,
    token: &CancellationToken,
) -> Result<RegistrationResponse> {
    let url = driver.task_url("register");
    loop {
        match driver.http.post(&url).json(&driver.event(None)).send().await {
            Ok(resp) => {
                let resp: RegistrationResponse = read_json(DRIVER_ID, resp).await?;
                info!(
                    "task {} registrado en {} (epoch {}, intento {})",
                    resp.task_id, resp.group_id, resp.epoch, resp.attempts
                );
                return Ok(resp);
            }
            Err(e) => warn!("driver no disponible todavía: {}", e),
        }
        tokio::select! {
            _ = token.cancelled() => {
                return Err(GroupCommError::transport(DRIVER_ID, "registro cancelado"));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
