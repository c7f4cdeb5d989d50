//! Shared application state injected into every HTTP/WebSocket handler.

use std::sync::Arc;

use crate::alarm_engine::AlarmEngine;
use crate::auth::AuthGate;
use crate::bus::FanOutBus;
use crate::control_coordinator::ControlCoordinator;
use crate::historian::{HistorianHandle, HistorianSink};
use crate::registry::NodeRegistry;
use crate::security_engine::SecurityEngine;
use crate::telemetry_store::Aggregator;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub alarms: Arc<AlarmEngine>,
    pub coordinator: Arc<ControlCoordinator>,
    pub security: Arc<SecurityEngine>,
    pub auth: Arc<AuthGate>,
    pub aggregator: Arc<Aggregator>,
    pub bus: FanOutBus,
    pub historian: HistorianHandle,
    pub historian_sink: Arc<HistorianSink>,
}
