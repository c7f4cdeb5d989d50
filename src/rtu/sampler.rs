//! Telemetry sampler (spec.md §4.1). Ticks the local simulation and pushes
//! samples onto the outbound buffer for the control channel to drain.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::model::node::NodeKind;
use crate::model::telemetry::{SampleQuality, TelemetrySample};

use super::control_channel::OutboundBuffer;
use super::state::RtuState;

pub const REGISTER_COUNT: usize = 8;
pub const REG_VOLTAGE_DV: usize = 0;
pub const REG_CURRENT_DA: usize = 1;
pub const REG_POWER_DMW: usize = 2;
pub const REG_FREQUENCY_CHZ: usize = 3;
pub const REG_BREAKER_STATE: usize = 4;

/// Snapshot of the simulated registers a Modbus client can read, refreshed
/// once per sampling tick. Kept separate from [`RtuState`] because the
/// `tokio-modbus` `Service::call` is synchronous and cannot await the
/// state's async locks.
pub struct RegisterBank {
    registers: std::sync::RwLock<[u16; REGISTER_COUNT]>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self { registers: std::sync::RwLock::new([0; REGISTER_COUNT]) }
    }

    fn refresh(&self, voltage_kv: f64, current_a: f64, real_power_mw: f64, frequency_hz: f64, breaker_open: bool) {
        let mut regs = self.registers.write().unwrap();
        regs[REG_VOLTAGE_DV] = (voltage_kv * 10.0).clamp(0.0, u16::MAX as f64) as u16;
        regs[REG_CURRENT_DA] = (current_a * 10.0).clamp(0.0, u16::MAX as f64) as u16;
        regs[REG_POWER_DMW] = (real_power_mw * 10.0).clamp(0.0, u16::MAX as f64) as u16;
        regs[REG_FREQUENCY_CHZ] = (frequency_hz * 100.0).clamp(0.0, u16::MAX as f64) as u16;
        regs[REG_BREAKER_STATE] = u16::from(!breaker_open);
    }

    pub fn read(&self, address: u16, count: u16) -> Option<Vec<u16>> {
        let regs = self.registers.read().unwrap();
        let start = address as usize;
        let end = start.checked_add(count as usize)?;
        regs.get(start..end).map(|s| s.to_vec())
    }

    pub fn len(&self) -> usize {
        REGISTER_COUNT
    }
}

pub fn primary_breaker_id(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Substation => "BRK-01",
        _ => "BRK-01",
    }
}

/// Runs the sampling loop at `rate_hz` until cancelled.
pub async fn run(
    state: Arc<RtuState>,
    registers: Arc<RegisterBank>,
    outbound: Arc<OutboundBuffer>,
    rate_hz: f64,
    cancel: tokio_util::sync::CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(0.01));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let sample = tick_once(&state, &registers).await;
                outbound.push(sample).await;
            }
        }
    }
}

async fn tick_once(state: &RtuState, registers: &RegisterBank) -> TelemetrySample {
    let (electrical, substituted) = state.tick().await;
    let sequence = state.next_sequence().await;
    let breaker_id = primary_breaker_id(state.descriptor.kind);
    let breaker_state = state.breakers.read().await.get(breaker_id).copied();
    let breaker_open = matches!(breaker_state, Some(crate::model::node::BreakerState::Open));

    registers.refresh(
        electrical.voltage_kv,
        electrical.current_a,
        electrical.real_power_mw,
        electrical.frequency_hz,
        breaker_open,
    );

    if substituted {
        debug!(node_id = %state.descriptor.node_id, "simulator produced a non-finite value, substituted last good reading");
    }

    TelemetrySample {
        node_id: state.descriptor.node_id.clone(),
        sequence,
        timestamp: chrono::Utc::now(),
        voltage_kv: Some(electrical.voltage_kv),
        current_a: Some(electrical.current_a),
        real_power_mw: Some(electrical.real_power_mw),
        reactive_power_mvar: Some(electrical.reactive_power_mvar),
        power_factor: Some(electrical.power_factor),
        frequency_hz: Some(electrical.frequency_hz),
        temperature_c: if matches!(state.descriptor.kind, NodeKind::Distribution) {
            None
        } else {
            Some(electrical.temperature_c)
        },
        breaker_state,
        energy_delivered_mwh: Some(electrical.energy_delivered_mwh),
        quality: if substituted { SampleQuality::Suspect } else { SampleQuality::Good },
    }
}
