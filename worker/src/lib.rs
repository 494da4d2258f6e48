pub mod client;
pub mod demo;
pub mod http;
pub mod operators;

pub use client::{GroupCommClient, GroupView};
pub use http::{heartbeat_loop, poll_loop, register_with_retry, DriverClient, HttpChannel};
pub use operators::{Broadcast, Gather, Operator, Reduce, Scatter};
