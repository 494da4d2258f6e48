use thiserror::Error;

use crate::topology::TaskStatus;
use crate::{Epoch, GroupId, TaskId};

/// Errores del framework de comunicación de grupo.
///
/// Todas las variantes llevan el contexto (grupo / operador / task) necesario
/// para saber qué operación colectiva se vio afectada.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupCommError {
    /* --------- errores de configuración (fatales al crear el grupo) --------- */
    #[error("el task {task_id} ya es miembro activo del grupo {group_id}")]
    DuplicateMember { group_id: GroupId, task_id: TaskId },

    #[error("spec de operador inválida en {group_id}/{operator}: {reason}")]
    InvalidOperatorSpec {
        group_id: GroupId,
        operator: String,
        reason: String,
    },

    #[error(
        "conflicto de configuración en {group_id}/{operator}: la clave '{key}' se ligó como {existing} y luego como {incoming}"
    )]
    ConfigurationConflict {
        group_id: GroupId,
        operator: String,
        key: String,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("el grupo {group_id} ya existe")]
    GroupExists { group_id: GroupId },

    /* --------- errores de runtime --------- */
    #[error(
        "topología obsoleta en {group_id}/{operator} (task {task_id}): snapshot en epoch {expected}, mensaje en epoch {found}"
    )]
    StaleTopology {
        group_id: GroupId,
        operator: String,
        task_id: TaskId,
        expected: Epoch,
        found: Epoch,
    },

    #[error("grupo {group_id} irrecuperable: {reason}")]
    UnrecoverableGroup { group_id: GroupId, reason: String },

    #[error("grupo desconocido: {group_id}")]
    UnknownGroup { group_id: GroupId },

    #[error("el task {task_id} no pertenece al grupo {group_id}")]
    UnknownMember { group_id: GroupId, task_id: TaskId },

    #[error("operador desconocido {group_id}/{operator}")]
    UnknownOperator { group_id: GroupId, operator: String },

    #[error("transición inválida para {task_id} en {group_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        group_id: GroupId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("el task {task_id} no puede usar {group_id}/{operator} como {role}")]
    WrongRole {
        group_id: GroupId,
        operator: String,
        task_id: TaskId,
        role: &'static str,
    },

    #[error("no hay {kind} registrado con nombre '{name}' para {group_id}/{operator}")]
    MissingFunction {
        group_id: GroupId,
        operator: String,
        kind: &'static str,
        name: String,
    },

    #[error("error de codec en {group_id}/{operator}: {message}")]
    Codec {
        group_id: GroupId,
        operator: String,
        message: String,
    },

    #[error("nada que reducir en {group_id}/{operator}: la raíz no tiene hijos vivos")]
    NothingToReduce { group_id: GroupId, operator: String },

    #[error("timeout de {timeout_ms}ms en {group_id}/{operator} (task {task_id})")]
    Timeout {
        group_id: GroupId,
        operator: String,
        task_id: TaskId,
        timeout_ms: u64,
    },

    #[error("operación cancelada en {group_id}/{operator} (task {task_id})")]
    Cancelled {
        group_id: GroupId,
        operator: String,
        task_id: TaskId,
    },

    #[error("error de transporte hacia {destination}: {message}")]
    Transport { destination: TaskId, message: String },
}

impl GroupCommError {
    pub fn is_stale(&self) -> bool {
        matches!(self, GroupCommError::StaleTopology { .. })
    }

    pub fn transport(destination: impl Into<TaskId>, message: impl Into<String>) -> Self {
        GroupCommError::Transport {
            destination: destination.into(),
            message: message.into(),
        }
    }

    pub fn invalid_spec(
        group_id: impl Into<GroupId>,
        operator: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        GroupCommError::InvalidOperatorSpec {
            group_id: group_id.into(),
            operator: operator.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GroupCommError>;
