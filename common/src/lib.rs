pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod functions;
pub mod message;
pub mod operator;
pub mod topology;

pub type TaskId = String;
pub type GroupId = String;
pub type Epoch = u64;

/// Identificador reservado del driver como origen/destino de mensajes de control.
pub const DRIVER_ID: &str = "driver";

pub use api::*;
pub use channel::{Inbox, LocalChannel, MessageChannel, Take};
pub use config::{DriverConfig, TaskConfig};
pub use error::{GroupCommError, Result};
pub use functions::{
    frame_values, unframe_values, ChunkedConverter, Codec, DataConverter, FunctionRegistry,
    JsonCodec, Max, Min, ReduceFunction, ResolvedFunctions, Sum,
};
pub use message::{ControlPayload, Message, MessageKind, Sequencer};
pub use operator::{Binding, ConfigFragment, OperatorKind, OperatorSpec, OperatorSpecBuilder, Role};
pub use topology::{GroupState, TaskNode, TaskStatus, TopologyShape, TopologySnapshot};
