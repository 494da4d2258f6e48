use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GroupCommError, Result};
use crate::operator::OperatorSpec;
use crate::topology::TopologySnapshot;
use crate::{Epoch, GroupId, TaskId, DRIVER_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Valores de una operación colectiva.
    Data,
    /// Control del driver: configuración, barrera, cambios de topología, abort.
    TopologyUpdate,
    /// Confirmación de un task al driver de que adoptó un epoch.
    ControlAck,
}

/// Mensaje punto a punto entre tasks o entre driver y tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub group_id: GroupId,
    /// Vacío en mensajes de control.
    pub operator_name: String,
    pub source: TaskId,
    pub destination: TaskId,
    /// Estrictamente creciente por par (origen, destino); lo asigna [`Sequencer`].
    pub sequence: u64,
    pub epoch: Epoch,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn data(
        group_id: impl Into<GroupId>,
        operator_name: impl Into<String>,
        source: impl Into<TaskId>,
        destination: impl Into<TaskId>,
        epoch: Epoch,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            operator_name: operator_name.into(),
            source: source.into(),
            destination: destination.into(),
            sequence: 0,
            epoch,
            kind: MessageKind::Data,
            payload,
        }
    }

    /// Mensaje de control del driver hacia `destination`.
    pub fn control(
        group_id: impl Into<GroupId>,
        destination: impl Into<TaskId>,
        epoch: Epoch,
        payload: &ControlPayload,
    ) -> Result<Self> {
        let group_id = group_id.into();
        let bytes = serde_json::to_vec(payload).map_err(|e| GroupCommError::Codec {
            group_id: group_id.clone(),
            operator: String::new(),
            message: format!("error serializando control: {e}"),
        })?;
        Ok(Self {
            group_id,
            operator_name: String::new(),
            source: DRIVER_ID.to_string(),
            destination: destination.into(),
            sequence: 0,
            epoch,
            kind: MessageKind::TopologyUpdate,
            payload: bytes,
        })
    }

    /// Confirmación de que `source` adoptó el snapshot en `epoch`.
    pub fn ack(group_id: impl Into<GroupId>, source: impl Into<TaskId>, epoch: Epoch) -> Self {
        Self {
            group_id: group_id.into(),
            operator_name: String::new(),
            source: source.into(),
            destination: DRIVER_ID.to_string(),
            sequence: 0,
            epoch,
            kind: MessageKind::ControlAck,
            payload: Vec::new(),
        }
    }

    pub fn control_payload(&self) -> Result<ControlPayload> {
        serde_json::from_slice(&self.payload).map_err(|e| GroupCommError::Codec {
            group_id: self.group_id.clone(),
            operator: self.operator_name.clone(),
            message: format!("payload de control ilegible: {e}"),
        })
    }
}

/// Contenido de los mensajes `TopologyUpdate` que emite el driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    /// Configuración de operadores para un task recién registrado.
    GroupConfig {
        operators: Vec<OperatorSpec>,
        topology: TopologySnapshot,
    },
    /// Barrera liberada: todos los miembros vivos están Running.
    OperatorReady { topology: TopologySnapshot },
    /// La topología cambió (falla, recuperación o alta dinámica).
    TopologyUpdate { topology: TopologySnapshot },
    /// El grupo es irrecuperable; los miembros tienen que abortar.
    Abort { reason: String },
}

impl ControlPayload {
    pub fn topology(&self) -> Option<&TopologySnapshot> {
        match self {
            ControlPayload::GroupConfig { topology, .. }
            | ControlPayload::OperatorReady { topology }
            | ControlPayload::TopologyUpdate { topology } => Some(topology),
            ControlPayload::Abort { .. } => None,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ControlPayload::GroupConfig { .. } => "group_config",
            ControlPayload::OperatorReady { .. } => "operator_ready",
            ControlPayload::TopologyUpdate { .. } => "topology_update",
            ControlPayload::Abort { .. } => "abort",
        }
    }
}

/// Numeración por destino de los mensajes que salen de un mismo origen.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: HashMap<TaskId, u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, mut message: Message) -> Message {
        let counter = self.next.entry(message.destination.clone()).or_insert(0);
        *counter += 1;
        message.sequence = *counter;
        message
    }
}
