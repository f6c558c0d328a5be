//! SBX control plane daemon: configuration, telemetry, and the HTTP edge in
//! front of the sandbox store and the cluster pool.

pub mod config;
pub mod lifecycle;
pub mod models;
pub mod server;
pub mod telemetry;
