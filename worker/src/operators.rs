//! Operadores colectivos tipados: Broadcast, Reduce, Scatter y Gather.
//!
//! Cada llamada espera la barrera del grupo, toma el snapshot vigente y corre
//! un intento del protocolo. Si el intento choca con un epoch distinto
//! (`StaleTopology`) se refresca la vista y se reintenta una vez por epoch;
//! todos los intentos comparten el mismo deadline.

use std::sync::Arc;

use common::{
    frame_values, unframe_values, Epoch, GroupCommError, Message, OperatorKind, OperatorSpec,
    ResolvedFunctions, Result, Role, TaskId, Take, TopologySnapshot,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::GroupCommClient;

/* =========================
   Contexto compartido
   ========================= */

struct OperatorContext<T> {
    client: Arc<GroupCommClient>,
    spec: OperatorSpec,
    functions: ResolvedFunctions<T>,
}

impl<T> Clone for OperatorContext<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            spec: self.spec.clone(),
            functions: self.functions.clone(),
        }
    }
}

impl<T: Send + 'static> OperatorContext<T> {
    fn group_id(&self) -> &str {
        self.spec.group_id()
    }

    fn name(&self) -> &str {
        self.spec.name()
    }

    fn me(&self) -> &str {
        self.client.task_id()
    }

    fn is_root(&self) -> bool {
        self.spec.root_id() == self.me()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.client.timeout()
    }

    /// Falla si este task no puede usar el operador con `role`.
    fn require(&self, role: Role, as_root: bool) -> Result<()> {
        if self.is_root() == as_root {
            return Ok(());
        }
        Err(GroupCommError::WrongRole {
            group_id: self.group_id().to_string(),
            operator: self.name().to_string(),
            task_id: self.me().to_string(),
            role: role.as_str(),
        })
    }

    fn codec_error(&self, message: String) -> GroupCommError {
        GroupCommError::Codec {
            group_id: self.group_id().to_string(),
            operator: self.name().to_string(),
            message,
        }
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        self.functions
            .codec
            .encode(value)
            .map_err(|e| self.codec_error(e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self.functions
            .codec
            .decode(bytes)
            .map_err(|e| self.codec_error(e))
    }

    async fn ready(&self, deadline: Instant) -> Result<Arc<TopologySnapshot>> {
        let snapshot = self
            .client
            .wait_ready_until(self.group_id(), self.name(), deadline)
            .await?;
        if !snapshot.contains_live(self.me()) {
            return Err(GroupCommError::UnknownMember {
                group_id: self.group_id().to_string(),
                task_id: self.me().to_string(),
            });
        }
        Ok(snapshot)
    }

    /// Envía `payload` a `destination`. Una falla de envío no corta la
    /// operación: el destino caído lo reporta el driver con un nuevo epoch.
    async fn send_to(&self, destination: &str, epoch: Epoch, payload: Vec<u8>) {
        let message = Message::data(self.group_id(), self.name(), self.me(), destination, epoch, payload);
        if let Err(e) = self.client.send(message).await {
            warn!(
                "[{}] {}/{}: envío a {} falló: {}",
                self.me(),
                self.group_id(),
                self.name(),
                destination,
                e
            );
        }
    }

    fn stale(&self, expected: Epoch, found: Epoch) -> GroupCommError {
        GroupCommError::StaleTopology {
            group_id: self.group_id().to_string(),
            operator: self.name().to_string(),
            task_id: self.me().to_string(),
            expected,
            found,
        }
    }

    /// Espera un mensaje de datos de cada origen, en `epoch`. Los mensajes se
    /// retiran del buzón sólo cuando están todos.
    async fn receive_from(
        &self,
        sources: &[TaskId],
        epoch: Epoch,
        deadline: Instant,
    ) -> Result<Vec<Message>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let group_id = self.group_id().to_string();
        let name = self.name().to_string();
        // mayor epoch visto en datos que la vista local todavía no alcanzó
        let mut ahead: Option<Epoch> = None;

        let result = self
            .client
            .wait_until(&group_id, &name, deadline, |client| {
                // la vista avanzó mientras esperábamos: el snapshot del intento ya no vale
                if let Some(current) = client.snapshot(&group_id) {
                    if current.epoch() > epoch {
                        return Some(Err(self.stale(epoch, current.epoch())));
                    }
                }
                match client.inbox().take_all(&group_id, &name, sources, epoch) {
                    Take::Ready(messages) => Some(Ok(messages)),
                    // un par ya adoptó un epoch que el driver todavía no nos
                    // entregó: se espera el TopologyUpdate antes de reintentar
                    Take::Stale(found) if found > epoch => {
                        if ahead.map_or(true, |seen| found > seen) {
                            debug!(
                                "[{}] {}/{}: datos en epoch {} con vista en {}, esperando actualización",
                                self.me(),
                                group_id,
                                name,
                                found,
                                epoch
                            );
                        }
                        ahead = Some(ahead.map_or(found, |seen| seen.max(found)));
                        None
                    }
                    Take::Stale(found) => Some(Err(self.stale(epoch, found))),
                    Take::Pending => None,
                }
            })
            .await;

        match (result, ahead) {
            // la actualización nunca llegó: se informa como topología obsoleta
            (Err(GroupCommError::Timeout { .. }), Some(found)) => Err(self.stale(epoch, found)),
            (result, _) => result,
        }
    }
}

/// Cuenta los reintentos por `StaleTopology`: uno por epoch.
#[derive(Default)]
struct StaleRetry {
    last_epoch: Option<Epoch>,
}

impl StaleRetry {
    fn should_retry(&mut self, error: &GroupCommError, epoch: Epoch) -> bool {
        if !error.is_stale() {
            return false;
        }
        if self.last_epoch == Some(epoch) {
            warn!("topología obsoleta otra vez en epoch {}: {}", epoch, error);
            return false;
        }
        debug!("reintentando tras {}", error);
        self.last_epoch = Some(epoch);
        true
    }
}

/* =========================
   Operator
   ========================= */

/// Handle de un operador del grupo, según su tipo.
pub enum Operator<T> {
    Broadcast(Broadcast<T>),
    Reduce(Reduce<T>),
    Scatter(Scatter<T>),
    Gather(Gather<T>),
}

impl<T: Send + 'static> Operator<T> {
    pub(crate) fn new(
        client: Arc<GroupCommClient>,
        spec: OperatorSpec,
        functions: ResolvedFunctions<T>,
    ) -> Self {
        let kind = spec.kind();
        let ctx = OperatorContext {
            client,
            spec,
            functions,
        };
        match kind {
            OperatorKind::Broadcast => Operator::Broadcast(Broadcast { ctx }),
            OperatorKind::Reduce => Operator::Reduce(Reduce { ctx }),
            OperatorKind::Scatter => Operator::Scatter(Scatter { ctx }),
            OperatorKind::Gather => Operator::Gather(Gather { ctx }),
        }
    }

    fn ctx(&self) -> &OperatorContext<T> {
        match self {
            Operator::Broadcast(op) => &op.ctx,
            Operator::Reduce(op) => &op.ctx,
            Operator::Scatter(op) => &op.ctx,
            Operator::Gather(op) => &op.ctx,
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.ctx().spec.kind()
    }

    pub fn spec(&self) -> &OperatorSpec {
        &self.ctx().spec
    }

    fn mismatch(&self, wanted: OperatorKind) -> GroupCommError {
        GroupCommError::invalid_spec(
            self.ctx().group_id(),
            self.ctx().name(),
            format!("el operador es {} y se pidió {}", self.kind(), wanted),
        )
    }

    pub fn into_broadcast(self) -> Result<Broadcast<T>> {
        match self {
            Operator::Broadcast(op) => Ok(op),
            other => Err(other.mismatch(OperatorKind::Broadcast)),
        }
    }

    pub fn into_reduce(self) -> Result<Reduce<T>> {
        match self {
            Operator::Reduce(op) => Ok(op),
            other => Err(other.mismatch(OperatorKind::Reduce)),
        }
    }

    pub fn into_scatter(self) -> Result<Scatter<T>> {
        match self {
            Operator::Scatter(op) => Ok(op),
            other => Err(other.mismatch(OperatorKind::Scatter)),
        }
    }

    pub fn into_gather(self) -> Result<Gather<T>> {
        match self {
            Operator::Gather(op) => Ok(op),
            other => Err(other.mismatch(OperatorKind::Gather)),
        }
    }
}

/* =========================
   Broadcast
   ========================= */

pub struct Broadcast<T> {
    ctx: OperatorContext<T>,
}

impl<T: Send + 'static> Broadcast<T> {
    /// Raíz: envía `value` a sus hijos según el snapshot vigente.
    pub async fn send(&self, value: &T) -> Result<()> {
        self.ctx.require(Role::Sender, true)?;
        let deadline = self.ctx.deadline();
        let snapshot = self.ctx.ready(deadline).await?;
        let payload = self.ctx.encode(value)?;

        for child in snapshot.children_of(self.ctx.me()) {
            self.ctx.send_to(&child, snapshot.epoch(), payload.clone()).await;
        }
        debug!(
            "[{}] broadcast {} enviado en epoch {}",
            self.ctx.me(),
            self.ctx.name(),
            snapshot.epoch()
        );
        Ok(())
    }

    /// No raíz: espera el valor del padre, lo reenvía a sus hijos y lo devuelve.
    pub async fn receive(&self) -> Result<T> {
        self.ctx.require(Role::Receiver, false)?;
        let deadline = self.ctx.deadline();
        let mut retry = StaleRetry::default();
        loop {
            let snapshot = self.ctx.ready(deadline).await?;
            match self.receive_once(&snapshot, deadline).await {
                Err(e) if retry.should_retry(&e, snapshot.epoch()) => continue,
                other => return other,
            }
        }
    }

    async fn receive_once(&self, snapshot: &TopologySnapshot, deadline: Instant) -> Result<T> {
        let me = self.ctx.me();
        let parent = snapshot.parent_of(me).cloned().ok_or_else(|| {
            GroupCommError::UnknownMember {
                group_id: self.ctx.group_id().to_string(),
                task_id: me.to_string(),
            }
        })?;

        let mut messages = self
            .ctx
            .receive_from(std::slice::from_ref(&parent), snapshot.epoch(), deadline)
            .await?;
        let payload = messages.pop().map(|m| m.payload).unwrap_or_default();

        // se decodifica completo antes de reenviar
        let value = self.ctx.decode(&payload)?;
        for child in snapshot.children_of(me) {
            self.ctx.send_to(&child, snapshot.epoch(), payload.clone()).await;
        }
        Ok(value)
    }
}

/* =========================
   Reduce
   ========================= */

pub struct Reduce<T> {
    ctx: OperatorContext<T>,
}

impl<T: Send + 'static> Reduce<T> {
    fn reduce_fn(&self) -> Result<&Arc<dyn common::ReduceFunction<T>>> {
        self.ctx.functions.reducer.as_ref().ok_or_else(|| {
            GroupCommError::invalid_spec(
                self.ctx.group_id(),
                self.ctx.name(),
                "Reduce sin reduce_function",
            )
        })
    }

    /// No raíz: combina `value` con los parciales de sus hijos (en orden
    /// ascendente de task id) y envía el resultado al padre.
    pub async fn send(&self, value: &T) -> Result<()> {
        self.ctx.require(Role::Sender, false)?;
        let own = self.ctx.encode(value)?;
        let deadline = self.ctx.deadline();
        let mut retry = StaleRetry::default();
        loop {
            let snapshot = self.ctx.ready(deadline).await?;
            match self.send_once(&snapshot, &own, deadline).await {
                Err(e) if retry.should_retry(&e, snapshot.epoch()) => continue,
                other => return other,
            }
        }
    }

    async fn send_once(&self, snapshot: &TopologySnapshot, own: &[u8], deadline: Instant) -> Result<()> {
        let me = self.ctx.me();
        let parent = snapshot.parent_of(me).cloned().ok_or_else(|| {
            GroupCommError::UnknownMember {
                group_id: self.ctx.group_id().to_string(),
                task_id: me.to_string(),
            }
        })?;
        let children = snapshot.children_of(me);

        let partial = if children.is_empty() {
            own.to_vec()
        } else {
            let messages = self
                .ctx
                .receive_from(&children, snapshot.epoch(), deadline)
                .await?;
            let mut values = Vec::with_capacity(children.len() + 1);
            values.push(self.ctx.decode(own)?);
            for message in &messages {
                values.push(self.ctx.decode(&message.payload)?);
            }
            let combined = self.reduce_fn()?.reduce(values);
            self.ctx.encode(&combined)?
        };

        self.ctx.send_to(&parent, snapshot.epoch(), partial).await;
        Ok(())
    }

    /// Raíz: combina los parciales de sus hijos directos.
    pub async fn receive(&self) -> Result<T> {
        self.ctx.require(Role::Receiver, true)?;
        let deadline = self.ctx.deadline();
        let mut retry = StaleRetry::default();
        loop {
            let snapshot = self.ctx.ready(deadline).await?;
            match self.receive_once(&snapshot, deadline).await {
                Err(e) if retry.should_retry(&e, snapshot.epoch()) => continue,
                other => return other,
            }
        }
    }

    async fn receive_once(&self, snapshot: &TopologySnapshot, deadline: Instant) -> Result<T> {
        let children = snapshot.children_of(self.ctx.me());
        if children.is_empty() {
            return Err(GroupCommError::NothingToReduce {
                group_id: self.ctx.group_id().to_string(),
                operator: self.ctx.name().to_string(),
            });
        }
        let messages = self
            .ctx
            .receive_from(&children, snapshot.epoch(), deadline)
            .await?;
        let values = messages
            .iter()
            .map(|m| self.ctx.decode(&m.payload))
            .collect::<Result<Vec<T>>>()?;
        Ok(self.reduce_fn()?.reduce(values))
    }
}

/* =========================
   Scatter
   ========================= */

pub struct Scatter<T> {
    ctx: OperatorContext<T>,
}

impl<T: Send + 'static> Scatter<T> {
    /// Raíz: parte `values` en una porción por miembro (orden ascendente de
    /// task id). Los miembros sin porción reciben una secuencia vacía.
    pub async fn send(&self, values: Vec<T>) -> Result<()> {
        self.ctx.require(Role::Sender, true)?;
        let deadline = self.ctx.deadline();
        let snapshot = self.ctx.ready(deadline).await?;
        let participants = snapshot.participants();

        let mut shares = self
            .ctx
            .functions
            .converter
            .split(values, participants.len())
            .into_iter();
        for participant in &participants {
            let share = shares.next().unwrap_or_default();
            let encoded = share
                .iter()
                .map(|v| self.ctx.encode(v))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            self.ctx
                .send_to(participant, snapshot.epoch(), frame_values(&encoded))
                .await;
        }
        debug!(
            "[{}] scatter {} repartido entre {} miembros",
            self.ctx.me(),
            self.ctx.name(),
            participants.len()
        );
        Ok(())
    }

    /// No raíz: devuelve la porción asignada a este task.
    pub async fn receive(&self) -> Result<Vec<T>> {
        self.ctx.require(Role::Receiver, false)?;
        let deadline = self.ctx.deadline();
        let mut retry = StaleRetry::default();
        loop {
            let snapshot = self.ctx.ready(deadline).await?;
            match self.receive_once(&snapshot, deadline).await {
                Err(e) if retry.should_retry(&e, snapshot.epoch()) => continue,
                other => return other,
            }
        }
    }

    async fn receive_once(&self, snapshot: &TopologySnapshot, deadline: Instant) -> Result<Vec<T>> {
        let root = snapshot.root_id().to_string();
        let mut messages = self
            .ctx
            .receive_from(std::slice::from_ref(&root), snapshot.epoch(), deadline)
            .await?;
        let payload = messages.pop().map(|m| m.payload).unwrap_or_default();
        let parts = unframe_values(&payload).map_err(|e| self.ctx.codec_error(e))?;
        parts.iter().map(|p| self.ctx.decode(p)).collect()
    }
}

/* =========================
   Gather
   ========================= */

pub struct Gather<T> {
    ctx: OperatorContext<T>,
}

impl<T: Send + 'static> Gather<T> {
    /// No raíz: envía `value` directamente a la raíz.
    pub async fn send(&self, value: &T) -> Result<()> {
        self.ctx.require(Role::Sender, false)?;
        let deadline = self.ctx.deadline();
        let snapshot = self.ctx.ready(deadline).await?;
        let payload = self.ctx.encode(value)?;
        self.ctx
            .send_to(snapshot.root_id(), snapshot.epoch(), payload)
            .await;
        Ok(())
    }

    /// No raíz: envía una secuencia completa; la raíz la recibe con
    /// [`Gather::receive_merged`].
    pub async fn send_many(&self, values: &[T]) -> Result<()> {
        self.ctx.require(Role::Sender, false)?;
        let deadline = self.ctx.deadline();
        let snapshot = self.ctx.ready(deadline).await?;
        let encoded = values
            .iter()
            .map(|v| self.ctx.encode(v))
            .collect::<Result<Vec<Vec<u8>>>>()?;
        self.ctx
            .send_to(snapshot.root_id(), snapshot.epoch(), frame_values(&encoded))
            .await;
        Ok(())
    }

    /// Raíz: un valor por miembro, ordenados por task id y no por llegada.
    pub async fn receive(&self) -> Result<Vec<T>> {
        Ok(self
            .receive_keyed()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Como [`Gather::receive`], con el task id de cada valor.
    pub async fn receive_keyed(&self) -> Result<Vec<(TaskId, T)>> {
        let messages = self.receive_raw().await?;
        messages
            .into_iter()
            .map(|m| Ok((m.source.clone(), self.ctx.decode(&m.payload)?)))
            .collect()
    }

    /// Raíz: une con el DataConverter las secuencias enviadas con
    /// [`Gather::send_many`], en orden de task id.
    pub async fn receive_merged(&self) -> Result<Vec<T>> {
        let messages = self.receive_raw().await?;
        let mut parts = Vec::with_capacity(messages.len());
        for message in &messages {
            let frames = unframe_values(&message.payload).map_err(|e| self.ctx.codec_error(e))?;
            parts.push(
                frames
                    .iter()
                    .map(|f| self.ctx.decode(f))
                    .collect::<Result<Vec<T>>>()?,
            );
        }
        Ok(self.ctx.functions.converter.merge(parts))
    }

    async fn receive_raw(&self) -> Result<Vec<Message>> {
        self.ctx.require(Role::Receiver, true)?;
        let deadline = self.ctx.deadline();
        let mut retry = StaleRetry::default();
        loop {
            let snapshot = self.ctx.ready(deadline).await?;
            let participants = snapshot.participants();
            match self
                .ctx
                .receive_from(&participants, snapshot.epoch(), deadline)
                .await
            {
                Err(e) if retry.should_retry(&e, snapshot.epoch()) => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_se_reintenta_una_vez_por_epoch() {
        let stale = GroupCommError::StaleTopology {
            group_id: "g".into(),
            operator: "op".into(),
            task_id: "a".into(),
            expected: 1,
            found: 2,
        };
        let mut retry = StaleRetry::default();
        assert!(retry.should_retry(&stale, 1));
        assert!(!retry.should_retry(&stale, 1));
        assert!(retry.should_retry(&stale, 2));

        let timeout = GroupCommError::Cancelled {
            group_id: "g".into(),
            operator: "op".into(),
            task_id: "a".into(),
        };
        assert!(!StaleRetry::default().should_retry(&timeout, 1));
    }
}
