//! Core library backing the `master`, `rtu`, and `scada-cli` binaries.

pub mod alarm_engine;
pub mod auth;
pub mod bootstrap;
pub mod bus;
pub mod cli;
pub mod config;
pub mod control_coordinator;
pub mod errors;
pub mod historian;
pub mod http;
pub mod master_link;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod rtu;
pub mod security_engine;
pub mod sharded;
pub mod telemetry_store;
