use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Epoch, GroupId, TaskId};

/* --------- Estados --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Failed,
    Completed,
}

impl TaskStatus {
    /// Un nodo "vivo" participa en el ruteo de mensajes.
    pub fn is_live(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    /// Esperando que todos los miembros vivos estén Running.
    Forming,
    /// Barrera liberada: se puede intercambiar datos.
    Ready,
    /// La raíz cayó o se agotaron los reintentos.
    Unrecoverable,
}

/// Política de ubicación de los miembros en el árbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyShape {
    /// Estrella: todos los miembros cuelgan de la raíz.
    #[default]
    Flat,
    /// Árbol con grado de salida fijo.
    Tree { fan_out: usize },
}

impl TopologyShape {
    /// Estrella para grupos chicos, árbol de `fan_out` para el resto.
    pub fn for_members(members: usize, fan_out: usize) -> Self {
        let fan_out = fan_out.max(1);
        if members <= fan_out + 1 {
            TopologyShape::Flat
        } else {
            TopologyShape::Tree { fan_out }
        }
    }
}

/* --------- Nodos y snapshot --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub task_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub child_ids: BTreeSet<TaskId>,
    pub status: TaskStatus,
    /// Orden de alta en el grupo; desempata promociones.
    pub registration_seq: u64,
    /// Cantidad de registros (el primero cuenta como 1).
    pub attempts: u32,
}

impl TaskNode {
    pub fn new(task_id: impl Into<TaskId>, registration_seq: u64) -> Self {
        Self {
            task_id: task_id.into(),
            parent_id: None,
            child_ids: BTreeSet::new(),
            status: TaskStatus::Pending,
            registration_seq,
            attempts: 0,
        }
    }
}

/// Copia inmutable de la topología de un grupo, tal como se disemina a los tasks.
///
/// No expone ningún método que mute: los tasks la comparten vía `Arc` y el driver
/// arma una nueva en cada cambio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    group_id: GroupId,
    root_id: TaskId,
    epoch: Epoch,
    state: GroupState,
    nodes: BTreeMap<TaskId, TaskNode>,
}

impl TopologySnapshot {
    pub fn new(
        group_id: impl Into<GroupId>,
        root_id: impl Into<TaskId>,
        epoch: Epoch,
        state: GroupState,
        nodes: BTreeMap<TaskId, TaskNode>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            root_id: root_id.into(),
            epoch,
            state,
            nodes,
        }
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

    pub fn is_ready(&self) -> bool {
        self.state == GroupState::Ready
    }

    pub fn is_root(&self, task_id: &str) -> bool {
        self.root_id == task_id
    }

    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_live(&self, task_id: &str) -> bool {
        self.nodes
            .get(task_id)
            .map(|n| n.status.is_live())
            .unwrap_or(false)
    }

    pub fn parent_of(&self, task_id: &str) -> Option<&TaskId> {
        self.nodes.get(task_id).and_then(|n| n.parent_id.as_ref())
    }

    /// Hijos vivos de `task_id`, en orden ascendente de task id.
    pub fn children_of(&self, task_id: &str) -> Vec<TaskId> {
        match self.nodes.get(task_id) {
            Some(node) => node
                .child_ids
                .iter()
                .filter(|c| self.contains_live(c))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Miembros vivos que no son la raíz, en orden ascendente de task id.
    pub fn participants(&self) -> Vec<TaskId> {
        self.nodes
            .values()
            .filter(|n| n.task_id != self.root_id && n.status.is_live())
            .map(|n| n.task_id.clone())
            .collect()
    }

    /// Cantidad de nodos sin padre.
    pub fn parentless_count(&self) -> usize {
        self.nodes.values().filter(|n| n.parent_id.is_none()).count()
    }

    /// Verifica que el grafo sea un árbol con una única raíz y enlaces consistentes.
    pub fn is_well_formed(&self) -> bool {
        if self.parentless_count() != 1 {
            return false;
        }
        match self.nodes.get(&self.root_id) {
            Some(root) if root.parent_id.is_none() => {}
            _ => return false,
        }

        for node in self.nodes.values() {
            // enlaces padre <-> hijo en ambos sentidos
            if let Some(parent) = &node.parent_id {
                match self.nodes.get(parent) {
                    Some(p) if p.child_ids.contains(&node.task_id) => {}
                    _ => return false,
                }
            }
            for child in &node.child_ids {
                match self.nodes.get(child) {
                    Some(c) if c.parent_id.as_deref() == Some(node.task_id.as_str()) => {}
                    _ => return false,
                }
            }

            // sin ciclos: subiendo siempre se llega a la raíz
            let mut cursor = node.parent_id.as_ref();
            let mut hops = 0;
            while let Some(id) = cursor {
                hops += 1;
                if hops > self.nodes.len() {
                    return false;
                }
                cursor = self.nodes.get(id).and_then(|n| n.parent_id.as_ref());
            }
        }
        true
    }
}
