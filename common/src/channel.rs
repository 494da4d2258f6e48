//! Canal punto a punto entre tasks y buzón de entrada por task.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{GroupCommError, Result};
use crate::message::{Message, MessageKind};
use crate::{Epoch, GroupId, TaskId};

/// Canal confiable punto a punto. La entrega puede repetirse (at-least-once);
/// el [`Inbox`] del destino descarta los duplicados.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, destination: &TaskId, message: Message) -> Result<()>;
}

/// Resultado de intentar retirar un conjunto de mensajes del buzón.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Take {
    /// Un mensaje por origen, en el orden de los orígenes pedidos.
    Ready(Vec<Message>),
    /// Hay mensajes para el operador con otro epoch (el mayor encontrado).
    Stale(Epoch),
    /// Todavía falta al menos un origen; no se retiró nada.
    Pending,
}

#[derive(Default)]
struct InboxState {
    data: HashMap<(GroupId, String), VecDeque<Message>>,
    control: VecDeque<Message>,
    applied: HashMap<(GroupId, TaskId, Epoch), Applied>,
}

/// Secuencias ya aplicadas de un origen: todo lo que está por debajo de
/// `floor` más las que llegaron salteadas por encima.
#[derive(Default)]
struct Applied {
    floor: u64,
    ahead: BTreeSet<u64>,
}

impl Applied {
    fn contains(&self, sequence: u64) -> bool {
        sequence <= self.floor || self.ahead.contains(&sequence)
    }

    fn insert(&mut self, sequence: u64) {
        self.ahead.insert(sequence);
        while self.ahead.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

/// Buzón de entrada de un task. Es el único recurso que se bloquea mientras
/// se drena, y sólo por el tiempo de mover mensajes.
pub struct Inbox {
    owner: TaskId,
    state: Mutex<InboxState>,
    notify: Notify,
}

impl Inbox {
    pub fn new(owner: impl Into<TaskId>) -> Self {
        Self {
            owner: owner.into(),
            state: Mutex::new(InboxState::default()),
            notify: Notify::new(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        // un panic con el lock tomado no deja el buzón a medio modificar
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Encola un mensaje entrante. Devuelve `false` si era un duplicado.
    pub fn deliver(&self, message: Message) -> bool {
        {
            let mut state = self.lock();
            let key = (
                message.group_id.clone(),
                message.source.clone(),
                message.epoch,
            );
            let applied = state.applied.entry(key).or_default();
            if applied.contains(message.sequence) {
                debug!(
                    "[{}] descartando duplicado de {} (seq {})",
                    self.owner, message.source, message.sequence
                );
                return false;
            }
            applied.insert(message.sequence);

            match message.kind {
                MessageKind::Data => state
                    .data
                    .entry((message.group_id.clone(), message.operator_name.clone()))
                    .or_default()
                    .push_back(message),
                MessageKind::TopologyUpdate | MessageKind::ControlAck => {
                    state.control.push_back(message)
                }
            }
        }
        self.notify.notify_waiters();
        true
    }

    /// Retira todos los mensajes de control pendientes, en orden de llegada.
    pub fn drain_control(&self) -> Vec<Message> {
        self.lock().control.drain(..).collect()
    }

    /// Retira, de forma atómica, el primer mensaje de datos de cada origen en
    /// `sources` para `(group_id, operator)` en `epoch`.
    ///
    /// Los mensajes de epochs anteriores se descartan y los de epochs
    /// posteriores se conservan para el reintento; en ambos casos se responde
    /// [`Take::Stale`]. Si falta algún origen no se retira nada.
    pub fn take_all(
        &self,
        group_id: &str,
        operator: &str,
        sources: &[TaskId],
        epoch: Epoch,
    ) -> Take {
        let mut state = self.lock();
        let key = (group_id.to_string(), operator.to_string());
        let queue = match state.data.get_mut(&key) {
            Some(queue) => queue,
            None => return Take::Pending,
        };

        let mut older: Option<Epoch> = None;
        queue.retain(|m| {
            if m.epoch < epoch {
                older = Some(older.map_or(m.epoch, |e| e.max(m.epoch)));
                false
            } else {
                true
            }
        });
        if let Some(found) = older {
            debug!(
                "[{}] {}/{}: descartados mensajes de epoch {} (vista en {})",
                self.owner, group_id, operator, found, epoch
            );
            return Take::Stale(found);
        }
        if let Some(found) = queue.iter().map(|m| m.epoch).filter(|e| *e > epoch).max() {
            return Take::Stale(found);
        }

        let mut positions = Vec::with_capacity(sources.len());
        for source in sources {
            match queue.iter().position(|m| &m.source == source) {
                Some(pos) => positions.push(pos),
                None => return Take::Pending,
            }
        }

        // se retiran de atrás hacia adelante para no correr los índices
        let mut order: Vec<usize> = (0..positions.len()).collect();
        order.sort_by(|a, b| positions[*b].cmp(&positions[*a]));
        let mut taken: Vec<Option<Message>> = vec![None; positions.len()];
        for idx in order {
            taken[idx] = queue.remove(positions[idx]);
        }
        if queue.is_empty() {
            state.data.remove(&key);
        }
        Take::Ready(taken.into_iter().flatten().collect())
    }

    /// Cantidad de mensajes de datos encolados para un operador.
    pub fn pending(&self, group_id: &str, operator: &str) -> usize {
        self.lock()
            .data
            .get(&(group_id.to_string(), operator.to_string()))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Futuro que se resuelve en la próxima entrega. Para no perder
    /// notificaciones hay que habilitarlo (`enable`) antes de revisar el buzón.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// Canal en memoria: entrega directamente en el buzón del destino.
#[derive(Clone, Default)]
pub struct LocalChannel {
    inboxes: Arc<Mutex<HashMap<TaskId, Arc<Inbox>>>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<Inbox>>> {
        self.inboxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Crea un buzón nuevo para `task_id`, reemplazando el anterior si existía.
    pub fn register(&self, task_id: impl Into<TaskId>) -> Arc<Inbox> {
        let task_id = task_id.into();
        let inbox = Arc::new(Inbox::new(task_id.clone()));
        self.lock().insert(task_id, Arc::clone(&inbox));
        inbox
    }

    pub fn unregister(&self, task_id: &str) -> Option<Arc<Inbox>> {
        self.lock().remove(task_id)
    }

    pub fn inbox(&self, task_id: &str) -> Option<Arc<Inbox>> {
        self.lock().get(task_id).cloned()
    }
}

#[async_trait]
impl MessageChannel for LocalChannel {
    async fn send(&self, destination: &TaskId, message: Message) -> Result<()> {
        let inbox = self.inbox(destination).ok_or_else(|| {
            GroupCommError::transport(destination.clone(), "destino no registrado en el canal local")
        })?;
        inbox.deliver(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Sequencer;
    use std::time::Duration;

    fn data(source: &str, epoch: Epoch, seq: u64, payload: &[u8]) -> Message {
        let mut m = Message::data("g", "op", source, "me", epoch, payload.to_vec());
        m.sequence = seq;
        m
    }

    fn ids(ids: &[&str]) -> Vec<TaskId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn take_all_es_atomico_y_respeta_el_orden_de_origenes() {
        let inbox = Inbox::new("me");
        inbox.deliver(data("c", 1, 1, b"c"));
        assert_eq!(inbox.take_all("g", "op", &ids(&["a", "c"]), 1), Take::Pending);
        // nada se retiró mientras faltaba "a"
        assert_eq!(inbox.pending("g", "op"), 1);

        inbox.deliver(data("a", 1, 1, b"a"));
        match inbox.take_all("g", "op", &ids(&["a", "c"]), 1) {
            Take::Ready(msgs) => {
                let sources: Vec<_> = msgs.iter().map(|m| m.source.as_str()).collect();
                assert_eq!(sources, vec!["a", "c"]);
            }
            other => panic!("se esperaba Ready: {other:?}"),
        }
        assert_eq!(inbox.pending("g", "op"), 0);
    }

    #[test]
    fn duplicados_se_descartan_por_secuencia() {
        let inbox = Inbox::new("me");
        assert!(inbox.deliver(data("a", 1, 1, b"x")));
        assert!(!inbox.deliver(data("a", 1, 1, b"x")));
        assert!(inbox.deliver(data("a", 1, 2, b"y")));
        assert_eq!(inbox.pending("g", "op"), 2);
    }

    #[test]
    fn secuencia_salteada_se_acepta_una_sola_vez() {
        let inbox = Inbox::new("me");
        // el contador del emisor es por destino y compartido entre operadores
        assert!(inbox.deliver(data("a", 1, 2, b"x")));
        let mut other = Message::data("g", "other", "a", "me", 1, b"y".to_vec());
        other.sequence = 1;
        assert!(inbox.deliver(other.clone()));
        assert_eq!(inbox.pending("g", "other"), 1);
        assert_eq!(inbox.pending("g", "op"), 1);

        assert!(!inbox.deliver(other));
        assert!(!inbox.deliver(data("a", 1, 2, b"x")));
        assert!(inbox.deliver(data("a", 1, 4, b"z")));
        assert!(inbox.deliver(data("a", 1, 3, b"w")));
        assert!(!inbox.deliver(data("a", 1, 3, b"w")));
    }

    #[test]
    fn emisor_reiniciado_en_epoch_nuevo_no_es_duplicado() {
        let inbox = Inbox::new("me");
        assert!(inbox.deliver(data("a", 1, 5, b"x")));
        // el task reinició su numeración pero el epoch subió
        assert!(inbox.deliver(data("a", 2, 1, b"y")));
    }

    #[test]
    fn mensajes_viejos_se_descartan_y_los_nuevos_se_conservan() {
        let inbox = Inbox::new("me");
        inbox.deliver(data("a", 1, 1, b"old"));
        assert_eq!(inbox.take_all("g", "op", &ids(&["a"]), 2), Take::Stale(1));
        assert_eq!(inbox.pending("g", "op"), 0);

        inbox.deliver(data("a", 3, 1, b"new"));
        assert_eq!(inbox.take_all("g", "op", &ids(&["a"]), 2), Take::Stale(3));
        assert_eq!(inbox.pending("g", "op"), 1);
        assert!(matches!(inbox.take_all("g", "op", &ids(&["a"]), 3), Take::Ready(_)));
    }

    #[test]
    fn control_va_a_su_propia_cola() {
        let inbox = Inbox::new("me");
        let mut ack = Message::ack("g", "a", 1);
        ack.sequence = 1;
        inbox.deliver(ack);
        assert_eq!(inbox.pending("g", ""), 0);
        assert_eq!(inbox.drain_control().len(), 1);
        assert!(inbox.drain_control().is_empty());
    }

    #[tokio::test]
    async fn canal_local_entrega_y_despierta_al_receptor() {
        let channel = LocalChannel::new();
        let inbox = channel.register("me");
        let mut seq = Sequencer::new();

        let waiter = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move {
                loop {
                    let notified = inbox.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if let Take::Ready(msgs) = inbox.take_all("g", "op", &["a".to_string()], 0) {
                        return msgs;
                    }
                    notified.await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let msg = seq.stamp(Message::data("g", "op", "a", "me", 0, b"hola".to_vec()));
        channel.send(&"me".to_string(), msg).await.unwrap();

        let msgs = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msgs[0].payload, b"hola".to_vec());
    }

    #[tokio::test]
    async fn destino_desconocido_es_error_de_transporte() {
        let channel = LocalChannel::new();
        let err = channel
            .send(&"nadie".to_string(), Message::ack("g", "a", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, GroupCommError::Transport { .. }));
    }
}
