//! cove-relay: the HTTP signal relay rooms negotiate through.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod server;
pub mod storage;
pub mod telemetry;
