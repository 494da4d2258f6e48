//! Runtime de comunicación de grupo del lado del task.
//!
//! Mantiene, por grupo, la última vista que mandó el driver (operadores +
//! snapshot de topología) y confirma cada snapshot adoptado con un `ControlAck`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common::{
    ControlPayload, Epoch, FunctionRegistry, GroupCommError, GroupId, Inbox, Message,
    MessageChannel, MessageKind, OperatorSpec, Result, Sequencer, TaskId, TopologySnapshot,
    DRIVER_ID,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operators::{Broadcast, Gather, Operator, Reduce, Scatter};

/// Lo que un task sabe de un grupo.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub operators: Vec<OperatorSpec>,
    pub topology: Arc<TopologySnapshot>,
}

impl GroupView {
    pub fn operator(&self, name: &str) -> Option<&OperatorSpec> {
        self.operators.iter().find(|o| o.name() == name)
    }
}

#[derive(Default)]
struct ClientState {
    views: HashMap<GroupId, GroupView>,
    aborted: HashMap<GroupId, String>,
    sequencer: Sequencer,
}

pub struct GroupCommClient {
    task_id: TaskId,
    channel: Arc<dyn MessageChannel>,
    inbox: Arc<Inbox>,
    timeout: Duration,
    shutdown: CancellationToken,
    state: Mutex<ClientState>,
}

impl GroupCommClient {
    pub fn new(
        task_id: impl Into<TaskId>,
        channel: Arc<dyn MessageChannel>,
        inbox: Arc<Inbox>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            channel,
            inbox,
            timeout,
            shutdown: CancellationToken::new(),
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Token que cancela todas las operaciones en curso de este task.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn view(&self, group_id: &str) -> Option<GroupView> {
        self.lock().views.get(group_id).cloned()
    }

    pub fn snapshot(&self, group_id: &str) -> Option<Arc<TopologySnapshot>> {
        self.lock().views.get(group_id).map(|v| Arc::clone(&v.topology))
    }

    pub fn abort_reason(&self, group_id: &str) -> Option<String> {
        self.lock().aborted.get(group_id).cloned()
    }

    /* ---------------- envío ---------------- */

    /// Numera y envía un mensaje. Las fallas de transporte se reportan al
    /// llamador; la reacción a tasks caídos llega por el driver.
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        let message = self.lock().sequencer.stamp(message);
        let destination = message.destination.clone();
        self.channel.send(&destination, message).await
    }

    /* ---------------- control ---------------- */

    /// Aplica los mensajes de control pendientes y confirma los snapshots
    /// adoptados.
    pub async fn refresh(&self) {
        let control = self.inbox.drain_control();
        if control.is_empty() {
            return;
        }

        let mut acks = Vec::new();
        {
            let mut state = self.lock();
            for message in control {
                if let Some(epoch) = self.apply_control(&mut state, &message) {
                    acks.push((message.group_id.clone(), epoch));
                }
            }
        }

        for (group_id, epoch) in acks {
            let ack = Message::ack(group_id.clone(), self.task_id.clone(), epoch);
            if let Err(e) = self.send(ack).await {
                warn!("[{}] no se pudo confirmar epoch {} de {}: {}", self.task_id, epoch, group_id, e);
            }
        }
    }

    /// Devuelve el epoch adoptado, si el mensaje cambió la vista.
    fn apply_control(&self, state: &mut ClientState, message: &Message) -> Option<Epoch> {
        if message.kind != MessageKind::TopologyUpdate {
            debug!("[{}] control ignorado: {:?}", self.task_id, message.kind);
            return None;
        }
        let payload = match message.control_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] {}", self.task_id, e);
                return None;
            }
        };
        let group_id = message.group_id.clone();

        match payload {
            ControlPayload::GroupConfig { operators, topology } => {
                // tras un abort el grupo se pudo recrear con epochs desde cero
                let current = state.views.get(&group_id).map(|v| v.topology.epoch());
                let recreated = state.aborted.contains_key(&group_id);
                if !recreated && current.map_or(false, |e| topology.epoch() < e) {
                    debug!("[{}] configuración vieja de {} descartada", self.task_id, group_id);
                    return None;
                }
                let epoch = topology.epoch();
                info!(
                    "[{}] configuración de {}: {} operadores, epoch {}",
                    self.task_id,
                    group_id,
                    operators.len(),
                    epoch
                );
                state.aborted.remove(&group_id);
                state.views.insert(
                    group_id,
                    GroupView {
                        operators,
                        topology: Arc::new(topology),
                    },
                );
                Some(epoch)
            }
            ControlPayload::OperatorReady { topology }
            | ControlPayload::TopologyUpdate { topology } => {
                let view = match state.views.get_mut(&group_id) {
                    Some(view) => view,
                    None => {
                        debug!("[{}] topología de {} sin configuración previa", self.task_id, group_id);
                        return None;
                    }
                };
                if topology.epoch() < view.topology.epoch() {
                    debug!(
                        "[{}] snapshot viejo de {} (epoch {} < {})",
                        self.task_id,
                        group_id,
                        topology.epoch(),
                        view.topology.epoch()
                    );
                    return None;
                }
                let epoch = topology.epoch();
                debug!(
                    "[{}] {}: epoch {} ({:?})",
                    self.task_id,
                    group_id,
                    epoch,
                    topology.state()
                );
                view.topology = Arc::new(topology);
                Some(epoch)
            }
            ControlPayload::Abort { reason } => {
                warn!("[{}] grupo {} abortado: {}", self.task_id, group_id, reason);
                state.aborted.insert(group_id, reason);
                None
            }
        }
    }

    /* ---------------- esperas ---------------- */

    fn unrecoverable(&self, group_id: &str) -> Option<GroupCommError> {
        self.abort_reason(group_id)
            .map(|reason| GroupCommError::UnrecoverableGroup {
                group_id: group_id.to_string(),
                reason,
            })
    }

    /// Espera a que `check` devuelva algo, despertando con cada entrega en el
    /// buzón. Falla por abort del grupo, deadline o cancelación.
    pub(crate) async fn wait_until<R>(
        &self,
        group_id: &str,
        operator: &str,
        deadline: Instant,
        mut check: impl FnMut(&Self) -> Option<Result<R>>,
    ) -> Result<R> {
        loop {
            let notified = self.inbox.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.refresh().await;
            if let Some(err) = self.unrecoverable(group_id) {
                return Err(err);
            }
            if let Some(result) = check(self) {
                return result;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(GroupCommError::Timeout {
                        group_id: group_id.to_string(),
                        operator: operator.to_string(),
                        task_id: self.task_id.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    });
                }
                _ = self.shutdown.cancelled() => {
                    return Err(GroupCommError::Cancelled {
                        group_id: group_id.to_string(),
                        operator: operator.to_string(),
                        task_id: self.task_id.clone(),
                    });
                }
            }
        }
    }

    /// Espera la configuración del grupo (sin exigir la barrera).
    pub async fn wait_configured(&self, group_id: &str) -> Result<GroupView> {
        let deadline = Instant::now() + self.timeout;
        self.wait_until(group_id, "", deadline, |client| client.view(group_id).map(Ok))
            .await
    }

    /// Espera a que el grupo pase la barrera y devuelve el snapshot vigente.
    pub async fn wait_ready(&self, group_id: &str) -> Result<Arc<TopologySnapshot>> {
        let deadline = Instant::now() + self.timeout;
        self.wait_ready_until(group_id, "", deadline).await
    }

    pub(crate) async fn wait_ready_until(
        &self,
        group_id: &str,
        operator: &str,
        deadline: Instant,
    ) -> Result<Arc<TopologySnapshot>> {
        self.wait_until(group_id, operator, deadline, |client| {
            client
                .snapshot(group_id)
                .filter(|snapshot| snapshot.is_ready())
                .map(Ok)
        })
        .await
    }

    /* ---------------- operadores ---------------- */

    /// Handle tipado para el operador `name` del grupo. Espera la configuración
    /// del grupo si todavía no llegó.
    pub async fn get_operator<T>(
        self: &Arc<Self>,
        group_id: &str,
        name: &str,
        registry: &FunctionRegistry<T>,
    ) -> Result<Operator<T>>
    where
        T: Send + 'static,
    {
        let view = self.wait_configured(group_id).await?;
        let spec = view
            .operator(name)
            .cloned()
            .ok_or_else(|| GroupCommError::UnknownOperator {
                group_id: group_id.to_string(),
                operator: name.to_string(),
            })?;
        let functions = registry.resolve(&spec)?;
        Ok(Operator::new(Arc::clone(self), spec, functions))
    }

    pub async fn broadcast<T>(
        self: &Arc<Self>,
        group_id: &str,
        name: &str,
        registry: &FunctionRegistry<T>,
    ) -> Result<Broadcast<T>>
    where
        T: Send + 'static,
    {
        self.get_operator(group_id, name, registry).await?.into_broadcast()
    }

    pub async fn reduce<T>(
        self: &Arc<Self>,
        group_id: &str,
        name: &str,
        registry: &FunctionRegistry<T>,
    ) -> Result<Reduce<T>>
    where
        T: Send + 'static,
    {
        self.get_operator(group_id, name, registry).await?.into_reduce()
    }

    pub async fn scatter<T>(
        self: &Arc<Self>,
        group_id: &str,
        name: &str,
        registry: &FunctionRegistry<T>,
    ) -> Result<Scatter<T>>
    where
        T: Send + 'static,
    {
        self.get_operator(group_id, name, registry).await?.into_scatter()
    }

    pub async fn gather<T>(
        self: &Arc<Self>,
        group_id: &str,
        name: &str,
        registry: &FunctionRegistry<T>,
    ) -> Result<Gather<T>>
    where
        T: Send + 'static,
    {
        self.get_operator(group_id, name, registry).await?.into_gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{GroupState, LocalChannel, TaskNode};
    use std::collections::BTreeMap;

    fn snapshot(epoch: Epoch, state: GroupState) -> TopologySnapshot {
        let mut nodes = BTreeMap::new();
        nodes.insert("r".to_string(), TaskNode::new("r", 0));
        TopologySnapshot::new("g", "r", epoch, state, nodes)
    }

    fn control(payload: &ControlPayload, epoch: Epoch, seq: u64) -> Message {
        let mut m = Message::control("g", "a", epoch, payload).unwrap();
        m.sequence = seq;
        m
    }

    fn setup() -> (LocalChannel, Arc<Inbox>, Arc<Inbox>, Arc<GroupCommClient>) {
        let channel = LocalChannel::new();
        let driver_inbox = channel.register(DRIVER_ID);
        let inbox = channel.register("a");
        let client = GroupCommClient::new(
            "a",
            Arc::new(channel.clone()),
            Arc::clone(&inbox),
            Duration::from_millis(200),
        );
        (channel, driver_inbox, inbox, client)
    }

    #[tokio::test]
    async fn adopta_snapshots_y_confirma_con_ack() {
        let (_channel, driver_inbox, inbox, client) = setup();
        inbox.deliver(control(
            &ControlPayload::GroupConfig {
                operators: vec![],
                topology: snapshot(0, GroupState::Forming),
            },
            0,
            1,
        ));
        inbox.deliver(control(
            &ControlPayload::OperatorReady {
                topology: snapshot(0, GroupState::Ready),
            },
            0,
            2,
        ));

        let ready = client.wait_ready("g").await.unwrap();
        assert!(ready.is_ready());

        let acks = driver_inbox.drain_control();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|m| m.kind == MessageKind::ControlAck && m.source == "a"));
    }

    #[tokio::test]
    async fn snapshot_viejo_no_pisa_al_nuevo() {
        let (_channel, _driver, inbox, client) = setup();
        inbox.deliver(control(
            &ControlPayload::GroupConfig {
                operators: vec![],
                topology: snapshot(3, GroupState::Ready),
            },
            3,
            1,
        ));
        inbox.deliver(control(
            &ControlPayload::TopologyUpdate {
                topology: snapshot(2, GroupState::Forming),
            },
            2,
            1,
        ));
        client.refresh().await;
        assert_eq!(client.snapshot("g").unwrap().epoch(), 3);
    }

    #[tokio::test]
    async fn abort_despierta_a_quien_espera() {
        let (_channel, _driver, inbox, client) = setup();
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.wait_ready("g").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        inbox.deliver(control(&ControlPayload::Abort { reason: "raíz caída".into() }, 1, 1));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GroupCommError::UnrecoverableGroup { .. }));
    }

    #[tokio::test]
    async fn sin_configuracion_vence_el_timeout() {
        let (_channel, _driver, _inbox, client) = setup();
        let err = client.wait_configured("g").await.unwrap_err();
        assert!(matches!(err, GroupCommError::Timeout { .. }));
    }

    #[tokio::test]
    async fn shutdown_cancela_la_espera() {
        let (_channel, _driver, _inbox, client) = setup();
        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.wait_ready("g").await })
        };
        client.shutdown();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GroupCommError::Cancelled { .. }));
    }
}
