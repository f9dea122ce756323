//! Relay core library: channel connectors, the dispatch pipeline, the external task
//! runner, and the gateway runtime used by the CLI.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod exec;
pub mod gateway;
pub mod init;
pub mod task;
