//! DTOs del API HTTP del driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::operator::{ConfigFragment, OperatorKind, OperatorSpec, Role};
use crate::topology::{GroupState, TaskStatus, TopologyShape};
use crate::{Epoch, GroupId, TaskId};

/* ---------- creación de grupos ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorRequest {
    pub name: String,
    pub kind: OperatorKind,
    /// Emisor (Broadcast/Scatter) o receptor (Reduce/Gather).
    pub root: TaskId,
    /// Se aplican en orden: el último gana por clave.
    #[serde(default)]
    pub fragments: Vec<ConfigFragment>,
}

impl OperatorRequest {
    pub fn to_spec(&self, group_id: &str) -> Result<OperatorSpec> {
        let builder = OperatorSpec::builder(group_id, self.name.clone(), self.kind);
        let builder = match self.kind.root_role() {
            Role::Sender => builder.sender(self.root.clone()),
            Role::Receiver => builder.receiver(self.root.clone()),
        };
        builder.fragments(self.fragments.iter().cloned()).build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub group_id: GroupId,
    /// Miembros esperados, incluida la raíz.
    pub members: Vec<TaskId>,
    /// Si falta se elige según la cantidad de miembros.
    #[serde(default)]
    pub shape: Option<TopologyShape>,
    pub operators: Vec<OperatorRequest>,
}

impl CreateGroupRequest {
    pub fn operator_specs(&self) -> Result<Vec<OperatorSpec>> {
        self.operators
            .iter()
            .map(|op| op.to_spec(&self.group_id))
            .collect()
    }
}

/* ---------- ciclo de vida de tasks ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventRequest {
    pub task_id: TaskId,
    /// Sólo para fallas reportadas.
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub group_id: GroupId,
    pub task_id: TaskId,
    pub epoch: Epoch,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub task_id: TaskId,
}

/* ---------- relay de mensajes ---------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub messages: Vec<Message>,
}

/* ---------- estado ---------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub task_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub child_ids: Vec<TaskId>,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Último epoch confirmado con ControlAck.
    pub acked_epoch: Option<Epoch>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub state: GroupState,
    pub epoch: Epoch,
    pub root_id: TaskId,
    pub operators: Vec<String>,
    pub members: Vec<MemberStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupStatus {
    pub fn member(&self, task_id: &str) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.task_id == task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
