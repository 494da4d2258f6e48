pub mod controller;
pub mod handlers;
pub mod monitor;
pub mod relay;
pub mod service;
pub mod topology;

pub use controller::GroupCommDriver;
pub use handlers::{build_router, AppState};
pub use relay::RelayChannel;
pub use service::{forward_acks, spawn_driver, DriverCommand, DriverHandle};
pub use topology::{Registration, Removal, RemovalReason, Topology};
