//! Buzones del despliegue HTTP: los tasks no se ven entre sí, así que el driver
//! guarda los mensajes por destino hasta que el task los retira con un poll.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use common::{Message, MessageChannel, Result, TaskId};
use tracing::debug;

#[derive(Clone, Default)]
pub struct RelayChannel {
    mailboxes: Arc<Mutex<HashMap<TaskId, VecDeque<Message>>>>,
}

impl RelayChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, VecDeque<Message>>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn post(&self, message: Message) {
        let mut mailboxes = self.lock();
        let queue = mailboxes.entry(message.destination.clone()).or_default();
        queue.push_back(message);
        debug!("relay: {} mensajes pendientes", queue.len());
    }

    /// Retira todo lo pendiente para `task_id`, en orden de llegada.
    pub fn poll(&self, task_id: &str) -> Vec<Message> {
        self.lock()
            .get_mut(task_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Descarta lo pendiente de `group_id` para un task que completó o cayó.
    /// El buzón desaparece si no le queda nada de otros grupos; un task que
    /// vuelve a registrarse recibe uno nuevo con el próximo mensaje.
    pub fn discard(&self, task_id: &str, group_id: &str) -> usize {
        let mut mailboxes = self.lock();
        let Some(queue) = mailboxes.get_mut(task_id) else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|m| m.group_id != group_id);
        let dropped = before - queue.len();
        if queue.is_empty() {
            mailboxes.remove(task_id);
        }
        if dropped > 0 {
            debug!("relay: {} mensajes de {} descartados para {}", dropped, group_id, task_id);
        }
        dropped
    }

    pub fn mailboxes(&self) -> usize {
        self.lock().len()
    }

    pub fn pending(&self, task_id: &str) -> usize {
        self.lock().get(task_id).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MessageChannel for RelayChannel {
    async fn send(&self, destination: &TaskId, mut message: Message) -> Result<()> {
        message.destination = destination.clone();
        self.post(message);
        Ok(())
    }
}
