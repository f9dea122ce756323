//! Gateway: runs channel connectors, dispatches their messages, and serves health over HTTP.

mod server;

pub use server::{build_pipeline, run_gateway, spawn_dispatcher, GatewayState};
