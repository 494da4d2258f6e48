use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GroupCommError, Result};
use crate::{GroupId, TaskId};

pub const CODEC_KEY: &str = "codec";
pub const REDUCE_FUNCTION_KEY: &str = "reduce_function";
pub const DATA_CONVERTER_KEY: &str = "data_converter";

pub const DEFAULT_CODEC: &str = "json";
pub const DEFAULT_DATA_CONVERTER: &str = "chunked";

/* --------- Tipos de operador --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorKind {
    Broadcast,
    Reduce,
    Scatter,
    Gather,
}

/// Rol de la raíz de un operador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl OperatorKind {
    /// Broadcast/Scatter tienen un único emisor; Reduce/Gather un único receptor.
    pub fn root_role(self) -> Role {
        match self {
            OperatorKind::Broadcast | OperatorKind::Scatter => Role::Sender,
            OperatorKind::Reduce | OperatorKind::Gather => Role::Receiver,
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Broadcast => "Broadcast",
            OperatorKind::Reduce => "Reduce",
            OperatorKind::Scatter => "Scatter",
            OperatorKind::Gather => "Gather",
        };
        f.write_str(name)
    }
}

/* --------- Configuración --------- */

/// Valor ligado a una clave de configuración ya resuelta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Binding {
    Codec(String),
    ReduceFunction(String),
    DataConverter(String),
    Text(String),
    Number(i64),
    Flag(bool),
}

impl Binding {
    pub fn type_name(&self) -> &'static str {
        match self {
            Binding::Codec(_) => "codec",
            Binding::ReduceFunction(_) => "reduce_function",
            Binding::DataConverter(_) => "data_converter",
            Binding::Text(_) => "text",
            Binding::Number(_) => "number",
            Binding::Flag(_) => "flag",
        }
    }

    fn same_type(&self, other: &Binding) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Fragmento de configuración: mapa clave → binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFragment {
    bindings: BTreeMap<String, Binding>,
}

impl ConfigFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(key.into(), binding);
        self
    }

    pub fn codec(name: impl Into<String>) -> Self {
        Self::new().with(CODEC_KEY, Binding::Codec(name.into()))
    }

    pub fn reduce_function(name: impl Into<String>) -> Self {
        Self::new().with(REDUCE_FUNCTION_KEY, Binding::ReduceFunction(name.into()))
    }

    pub fn data_converter(name: impl Into<String>) -> Self {
        Self::new().with(DATA_CONVERTER_KEY, Binding::DataConverter(name.into()))
    }

    pub fn get(&self, key: &str) -> Option<&Binding> {
        self.bindings.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Une fragmentos de izquierda a derecha; el último gana por clave.
    ///
    /// El orden de `fragments` importa: el llamador tiene que pasarlos en un orden
    /// explícito y no depender del orden de iteración de una colección.
    /// Sólo falla si una misma clave se liga a tipos de binding distintos.
    pub fn merge(group_id: &str, operator: &str, fragments: &[ConfigFragment]) -> Result<Self> {
        let mut merged = ConfigFragment::new();
        for fragment in fragments {
            for (key, binding) in &fragment.bindings {
                if let Some(existing) = merged.bindings.get(key) {
                    if !existing.same_type(binding) {
                        return Err(GroupCommError::ConfigurationConflict {
                            group_id: group_id.to_string(),
                            operator: operator.to_string(),
                            key: key.clone(),
                            existing: existing.type_name(),
                            incoming: binding.type_name(),
                        });
                    }
                }
                merged.bindings.insert(key.clone(), binding.clone());
            }
        }
        Ok(merged)
    }
}

/* --------- OperatorSpec --------- */

/// Descripción inmutable de una instancia de operador dentro de un grupo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSpec {
    group_id: GroupId,
    name: String,
    kind: OperatorKind,
    /// Emisor (Broadcast/Scatter) o receptor (Reduce/Gather).
    root_id: TaskId,
    configuration: ConfigFragment,
}

impl OperatorSpec {
    pub fn builder(
        group_id: impl Into<GroupId>,
        name: impl Into<String>,
        kind: OperatorKind,
    ) -> OperatorSpecBuilder {
        OperatorSpecBuilder {
            group_id: group_id.into(),
            name: name.into(),
            kind,
            senders: Vec::new(),
            receivers: Vec::new(),
            fragments: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn sender_id(&self) -> Option<&str> {
        match self.kind.root_role() {
            Role::Sender => Some(&self.root_id),
            Role::Receiver => None,
        }
    }

    pub fn receiver_id(&self) -> Option<&str> {
        match self.kind.root_role() {
            Role::Receiver => Some(&self.root_id),
            Role::Sender => None,
        }
    }

    pub fn configuration(&self) -> &ConfigFragment {
        &self.configuration
    }

    pub fn codec_name(&self) -> &str {
        match self.configuration.get(CODEC_KEY) {
            Some(Binding::Codec(name)) => name,
            _ => DEFAULT_CODEC,
        }
    }

    pub fn reduce_function_name(&self) -> Option<&str> {
        match self.configuration.get(REDUCE_FUNCTION_KEY) {
            Some(Binding::ReduceFunction(name)) => Some(name),
            _ => None,
        }
    }

    pub fn data_converter_name(&self) -> &str {
        match self.configuration.get(DATA_CONVERTER_KEY) {
            Some(Binding::DataConverter(name)) => name,
            _ => DEFAULT_DATA_CONVERTER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperatorSpecBuilder {
    group_id: GroupId,
    name: String,
    kind: OperatorKind,
    senders: Vec<TaskId>,
    receivers: Vec<TaskId>,
    fragments: Vec<ConfigFragment>,
}

impl OperatorSpecBuilder {
    pub fn sender(mut self, task_id: impl Into<TaskId>) -> Self {
        self.senders.push(task_id.into());
        self
    }

    pub fn receiver(mut self, task_id: impl Into<TaskId>) -> Self {
        self.receivers.push(task_id.into());
        self
    }

    /// Agrega un fragmento; se aplican en el orden en que se agregan.
    pub fn fragment(mut self, fragment: ConfigFragment) -> Self {
        self.fragments.push(fragment);
        self
    }

    pub fn fragments(mut self, fragments: impl IntoIterator<Item = ConfigFragment>) -> Self {
        self.fragments.extend(fragments);
        self
    }

    pub fn build(self) -> Result<OperatorSpec> {
        let invalid = |reason: String| GroupCommError::invalid_spec(&self.group_id, &self.name, reason);

        if self.name.trim().is_empty() {
            return Err(invalid("el operador necesita un nombre".to_string()));
        }

        let (roots, others, role) = match self.kind.root_role() {
            Role::Sender => (&self.senders, &self.receivers, Role::Sender),
            Role::Receiver => (&self.receivers, &self.senders, Role::Receiver),
        };
        if roots.len() != 1 {
            return Err(invalid(format!(
                "{} requiere exactamente un {} (recibidos: {})",
                self.kind,
                role.as_str(),
                roots.len()
            )));
        }
        if !others.is_empty() {
            return Err(invalid(format!(
                "{} no admite roles explícitos distintos de {}: {:?}",
                self.kind,
                role.as_str(),
                others
            )));
        }

        let configuration = ConfigFragment::merge(&self.group_id, &self.name, &self.fragments)?;

        // las claves conocidas tienen que tener el tipo esperado
        let expected = [
            (CODEC_KEY, "codec"),
            (REDUCE_FUNCTION_KEY, "reduce_function"),
            (DATA_CONVERTER_KEY, "data_converter"),
        ];
        for (key, type_name) in expected {
            if let Some(binding) = configuration.get(key) {
                if binding.type_name() != type_name {
                    return Err(invalid(format!(
                        "la clave '{}' debe ser {} y es {}",
                        key,
                        type_name,
                        binding.type_name()
                    )));
                }
            }
        }

        if self.kind == OperatorKind::Reduce && configuration.get(REDUCE_FUNCTION_KEY).is_none() {
            return Err(invalid("Reduce requiere una reduce_function".to_string()));
        }

        Ok(OperatorSpec {
            root_id: roots[0].clone(),
            group_id: self.group_id,
            name: self.name,
            kind: self.kind,
            configuration,
        })
    }
}
