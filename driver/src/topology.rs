//! Topología mutable de un grupo, propiedad exclusiva del loop del driver.
//!
//! La ubicación usa "slots": cada alta recibe el siguiente índice y el padre de
//! un slot sale de la forma del grupo (estrella: slot 0; árbol: `(s-1)/fan_out`).
//! Cuando un nodo cae, sus hijos pasan al ancestro Running más cercano y sus
//! slots los hereda el hijo vivo con menor secuencia de registro, así las altas
//! posteriores se ubican de forma reproducible.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use common::{
    Epoch, GroupCommError, GroupId, GroupState, Result, TaskId, TaskNode, TaskStatus,
    TopologyShape, TopologySnapshot,
};
use tracing::{debug, info};

/// Cómo quedó un task después de `add_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Primer registro de un miembro esperado.
    First,
    /// Re-registro de un task que había fallado.
    Recovered { attempts: u32 },
    /// Alta de un task que no estaba en la lista de miembros.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Failed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Los hijos del nodo caído pasaron a `new_parent`.
    Reparented {
        new_parent: TaskId,
        moved: Vec<TaskId>,
    },
    /// Cayó la raíz: el grupo no se puede reparar.
    RootLost,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Topology {
    group_id: GroupId,
    root_id: TaskId,
    shape: TopologyShape,
    epoch: Epoch,
    state: GroupState,
    nodes: BTreeMap<TaskId, TaskNode>,
    // titular de cada slot; el slot 0 es siempre la raíz
    slots: Vec<TaskId>,
    next_seq: u64,
}

impl Topology {
    /// Arma la topología con todos los miembros esperados reservados como
    /// Pending. La raíz ocupa el slot 0 y el resto se ubica en el orden dado.
    pub fn new(
        group_id: impl Into<GroupId>,
        root_id: impl Into<TaskId>,
        shape: TopologyShape,
        members: &[TaskId],
    ) -> Result<Self> {
        let group_id = group_id.into();
        let root_id = root_id.into();

        let mut topology = Self {
            group_id,
            root_id: root_id.clone(),
            shape,
            epoch: 0,
            state: GroupState::Forming,
            nodes: BTreeMap::new(),
            slots: Vec::new(),
            next_seq: 0,
        };

        let root = TaskNode::new(root_id.clone(), topology.take_seq());
        topology.nodes.insert(root_id.clone(), root);
        topology.slots.push(root_id.clone());

        let mut seen = HashSet::new();
        seen.insert(root_id.clone());
        for member in members {
            if member == &root_id {
                continue;
            }
            if !seen.insert(member.clone()) {
                return Err(GroupCommError::DuplicateMember {
                    group_id: topology.group_id.clone(),
                    task_id: member.clone(),
                });
            }
            let node = TaskNode::new(member.clone(), topology.take_seq());
            topology.nodes.insert(member.clone(), node);
            topology.place(member);
        }

        debug!(
            "topología de {} creada: {} nodos, forma {:?}",
            topology.group_id,
            topology.nodes.len(),
            topology.shape
        );
        Ok(topology)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn shape(&self) -> TopologyShape {
        self.shape
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    /// Miembros Pending o Running.
    pub fn live_members(&self) -> Vec<TaskId> {
        self.nodes
            .values()
            .filter(|n| n.status.is_live())
            .map(|n| n.task_id.clone())
            .collect()
    }

    /// Todos los miembros vivos están Running (y la raíz entre ellos).
    pub fn all_running(&self) -> bool {
        let root_running = self
            .nodes
            .get(&self.root_id)
            .map(|n| n.status == TaskStatus::Running)
            .unwrap_or(false);
        root_running
            && self
                .nodes
                .values()
                .filter(|n| n.status.is_live())
                .all(|n| n.status == TaskStatus::Running)
    }

    /// Ningún miembro sigue vivo y la raíz terminó bien.
    pub fn is_complete(&self) -> bool {
        let root_done = self
            .nodes
            .get(&self.root_id)
            .map(|n| n.status == TaskStatus::Completed)
            .unwrap_or(false);
        root_done && self.nodes.values().all(|n| !n.status.is_live())
    }

    pub fn mark_ready(&mut self) {
        if self.state == GroupState::Forming {
            self.state = GroupState::Ready;
        }
    }

    pub fn mark_unrecoverable(&mut self) {
        self.state = GroupState::Unrecoverable;
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::new(TopologySnapshot::new(
            self.group_id.clone(),
            self.root_id.clone(),
            self.epoch,
            self.state,
            self.nodes.clone(),
        ))
    }

    /* --------- altas --------- */

    /// Registra `task_id` en el grupo.
    ///
    /// - miembro reservado sin registrar: primer registro, sin cambio de epoch.
    /// - miembro Failed: vuelve como Pending en un slot nuevo (recuperación).
    /// - id desconocido: alta dinámica al final.
    /// - cualquier otro caso: `DuplicateMember`.
    pub fn add_task(&mut self, task_id: &str) -> Result<Registration> {
        let (status, attempts) = match self.nodes.get(task_id) {
            Some(node) => (Some(node.status), node.attempts),
            None => (None, 0),
        };

        match status {
            Some(TaskStatus::Pending) if attempts == 0 => {
                if let Some(node) = self.nodes.get_mut(task_id) {
                    node.attempts = 1;
                }
                debug!("{}: primer registro de {}", self.group_id, task_id);
                Ok(Registration::First)
            }
            Some(TaskStatus::Failed) => {
                if task_id == self.root_id {
                    return Err(self.unrecoverable("la raíz no puede volver a registrarse"));
                }
                self.detach(task_id);
                if let Some(node) = self.nodes.get_mut(task_id) {
                    node.status = TaskStatus::Pending;
                    node.attempts += 1;
                }
                self.place(task_id);
                self.bump_epoch();
                self.state = GroupState::Forming;

                let attempts = attempts + 1;
                info!(
                    "{}: {} recuperado (intento {}), epoch {}",
                    self.group_id, task_id, attempts, self.epoch
                );
                Ok(Registration::Recovered { attempts })
            }
            None => {
                let mut node = TaskNode::new(task_id, self.take_seq());
                node.attempts = 1;
                self.nodes.insert(task_id.to_string(), node);
                self.place(task_id);
                self.bump_epoch();
                self.state = GroupState::Forming;

                info!(
                    "{}: alta dinámica de {}, epoch {}",
                    self.group_id, task_id, self.epoch
                );
                Ok(Registration::Joined)
            }
            Some(_) => Err(GroupCommError::DuplicateMember {
                group_id: self.group_id.clone(),
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Pending → Running. Devuelve `false` si ya estaba Running.
    pub fn mark_running(&mut self, task_id: &str) -> Result<bool> {
        let group_id = self.group_id.clone();
        let node = self.node_mut(task_id)?;
        match node.status {
            TaskStatus::Pending => {
                node.status = TaskStatus::Running;
                Ok(true)
            }
            TaskStatus::Running => Ok(false),
            from => Err(GroupCommError::InvalidTransition {
                group_id,
                task_id: task_id.to_string(),
                from,
                to: TaskStatus::Running,
            }),
        }
    }

    /* --------- bajas --------- */

    pub fn remove_task(&mut self, task_id: &str, reason: RemovalReason) -> Result<Removal> {
        let group_id = self.group_id.clone();
        let node = self.node_mut(task_id)?;
        let from = node.status;

        match reason {
            RemovalReason::Completed => {
                if from != TaskStatus::Running {
                    return Err(GroupCommError::InvalidTransition {
                        group_id,
                        task_id: task_id.to_string(),
                        from,
                        to: TaskStatus::Completed,
                    });
                }
                node.status = TaskStatus::Completed;
                Ok(Removal::Completed)
            }
            RemovalReason::Failed => {
                if !from.is_live() {
                    return Err(GroupCommError::InvalidTransition {
                        group_id,
                        task_id: task_id.to_string(),
                        from,
                        to: TaskStatus::Failed,
                    });
                }
                node.status = TaskStatus::Failed;

                if task_id == self.root_id {
                    self.bump_epoch();
                    self.state = GroupState::Unrecoverable;
                    info!("{}: cayó la raíz {}, grupo irrecuperable", self.group_id, task_id);
                    return Ok(Removal::RootLost);
                }

                let removal = self.reparent_children(task_id);
                self.bump_epoch();
                info!(
                    "{}: {} falló, epoch {} ({:?})",
                    self.group_id, task_id, self.epoch, removal
                );
                Ok(removal)
            }
        }
    }

    /* --------- internos --------- */

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn bump_epoch(&mut self) {
        self.epoch += 1;
    }

    fn node_mut(&mut self, task_id: &str) -> Result<&mut TaskNode> {
        let group_id = &self.group_id;
        self.nodes
            .get_mut(task_id)
            .ok_or_else(|| GroupCommError::UnknownMember {
                group_id: group_id.clone(),
                task_id: task_id.to_string(),
            })
    }

    fn unrecoverable(&self, reason: &str) -> GroupCommError {
        GroupCommError::UnrecoverableGroup {
            group_id: self.group_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn parent_slot(&self, slot: usize) -> usize {
        match self.shape {
            TopologyShape::Flat => 0,
            TopologyShape::Tree { fan_out } => (slot - 1) / fan_out.max(1),
        }
    }

    /// Asigna a `task_id` el siguiente slot y lo cuelga del titular vivo más
    /// cercano hacia la raíz.
    fn place(&mut self, task_id: &str) {
        let slot = self.slots.len();
        self.slots.push(task_id.to_string());

        let mut cursor = self.parent_slot(slot);
        let parent = loop {
            let holder = &self.slots[cursor];
            let live = self.nodes.get(holder).map(|n| n.status.is_live()).unwrap_or(false);
            if live || cursor == 0 {
                break holder.clone();
            }
            cursor = self.parent_slot(cursor);
        };

        self.link(&parent, task_id);
        debug!("{}: {} en slot {} bajo {}", self.group_id, task_id, slot, parent);
    }

    fn link(&mut self, parent: &str, child: &str) {
        if let Some(node) = self.nodes.get_mut(child) {
            node.parent_id = Some(parent.to_string());
        }
        if let Some(node) = self.nodes.get_mut(parent) {
            node.child_ids.insert(child.to_string());
        }
    }

    fn detach(&mut self, task_id: &str) {
        let parent = self.nodes.get_mut(task_id).and_then(|n| n.parent_id.take());
        if let Some(parent) = parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.child_ids.remove(task_id);
            }
        }
    }

    /// Ancestro Running más cercano de `task_id`; la raíz si no hay ninguno.
    fn nearest_running_ancestor(&self, task_id: &str) -> TaskId {
        let mut cursor = self.nodes.get(task_id).and_then(|n| n.parent_id.clone());
        while let Some(id) = cursor {
            match self.nodes.get(&id) {
                Some(node) if node.status == TaskStatus::Running => return id,
                Some(node) => cursor = node.parent_id.clone(),
                None => break,
            }
        }
        self.root_id.clone()
    }

    fn reparent_children(&mut self, failed: &str) -> Removal {
        let target = self.nearest_running_ancestor(failed);
        let children: BTreeSet<TaskId> = self
            .nodes
            .get_mut(failed)
            .map(|n| std::mem::take(&mut n.child_ids))
            .unwrap_or_default();

        // el hijo vivo más antiguo hereda los slots del caído
        let heir = children
            .iter()
            .filter_map(|c| self.nodes.get(c))
            .filter(|n| n.status.is_live())
            .min_by_key(|n| n.registration_seq)
            .map(|n| n.task_id.clone())
            .unwrap_or_else(|| target.clone());
        for holder in self.slots.iter_mut().filter(|h| h.as_str() == failed) {
            *holder = heir.clone();
        }

        let moved: Vec<TaskId> = children.into_iter().collect();
        for child in &moved {
            self.link(&target, child);
        }

        Removal::Reparented {
            new_parent: target,
            moved,
        }
    }
}
