//! Local electrical state simulated by a single RTU process (spec.md §1:
//! "the electrical physics simulation itself... treated as opaque
//! producers of telemetry samples" — this is the opaque producer, kept
//! deliberately simple).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use rand::Rng;
use tokio::sync::RwLock;

use crate::config::NodeCatalogue;
use crate::model::node::{BreakerState, NodeDescriptor, NodeKind};
use crate::model::security::Protocol;

#[derive(Debug, Clone)]
pub struct ElectricalState {
    pub voltage_kv: f64,
    pub current_a: f64,
    pub real_power_mw: f64,
    pub reactive_power_mvar: f64,
    pub power_factor: f64,
    pub frequency_hz: f64,
    pub temperature_c: f64,
    pub energy_delivered_mwh: f64,
}

impl ElectricalState {
    fn baseline(descriptor: &NodeDescriptor) -> Self {
        Self {
            voltage_kv: descriptor.nominal_voltage_kv,
            current_a: descriptor.rated_capacity_mw * 10.0,
            real_power_mw: descriptor.rated_capacity_mw * 0.7,
            reactive_power_mvar: descriptor.rated_capacity_mw * 0.1,
            power_factor: 0.98,
            frequency_hz: 50.0,
            temperature_c: 45.0,
            energy_delivered_mwh: 0.0,
        }
    }

    /// Small bounded random walk around the current operating point. Not a
    /// power-flow solver — see the module doc comment.
    fn step(&mut self, descriptor: &NodeDescriptor) {
        let mut rng = rand::thread_rng();
        let drift = |v: f64, spread: f64| v + rng.gen_range(-spread..spread);

        self.voltage_kv = drift(self.voltage_kv, descriptor.nominal_voltage_kv * 0.01);
        self.frequency_hz = drift(self.frequency_hz, 0.02);
        self.real_power_mw = drift(self.real_power_mw, descriptor.rated_capacity_mw * 0.01)
            .clamp(0.0, descriptor.rated_capacity_mw);
        self.reactive_power_mvar = drift(self.reactive_power_mvar, descriptor.rated_capacity_mw * 0.005);
        self.current_a = (self.real_power_mw * 10.0).max(0.0);
        self.temperature_c = drift(self.temperature_c, 0.3).clamp(-20.0, 140.0);
        self.energy_delivered_mwh += self.real_power_mw / 3600.0;
    }
}

pub struct RtuState {
    pub descriptor: NodeDescriptor,
    electrical: RwLock<ElectricalState>,
    last_good: RwLock<ElectricalState>,
    pub breakers: RwLock<HashMap<String, BreakerState>>,
    pub allow_list: RwLock<HashSet<(IpAddr, Protocol)>>,
    pub blocked: RwLock<HashSet<IpAddr>>,
    pub sequence: std::sync::atomic::AtomicU64,
}

impl RtuState {
    pub fn new(descriptor: NodeDescriptor, catalogue: &NodeCatalogue, master_ip: IpAddr) -> Self {
        let baseline = ElectricalState::baseline(&descriptor);
        let mut breakers = HashMap::new();
        breakers.insert("BRK-01".to_string(), BreakerState::Closed);
        if matches!(descriptor.kind, NodeKind::Substation) {
            breakers.insert("BRK-02".to_string(), BreakerState::Closed);
        }

        let mut allow_list = HashSet::new();
        for protocol in [Protocol::Modbus, Protocol::Iec104, Protocol::Rest] {
            allow_list.insert((master_ip, protocol));
        }
        for node in &catalogue.node {
            if let Ok(ip) = node.node_ip.parse::<IpAddr>() {
                allow_list.insert((ip, Protocol::Modbus));
                allow_list.insert((ip, Protocol::Iec104));
            }
        }

        Self {
            descriptor,
            electrical: RwLock::new(baseline.clone()),
            last_good: RwLock::new(baseline),
            breakers: RwLock::new(breakers),
            allow_list: RwLock::new(allow_list),
            blocked: RwLock::new(HashSet::new()),
            sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Advances the simulation and returns the reading plus whether it had
    /// to be substituted (spec.md §4.1: NaN -> last good value, `Suspect`).
    pub async fn tick(&self) -> (ElectricalState, bool) {
        let mut electrical = self.electrical.write().await;
        electrical.step(&self.descriptor);

        let is_finite = electrical.voltage_kv.is_finite()
            && electrical.current_a.is_finite()
            && electrical.real_power_mw.is_finite()
            && electrical.frequency_hz.is_finite();

        if is_finite {
            *self.last_good.write().await = electrical.clone();
            (electrical.clone(), false)
        } else {
            let good = self.last_good.read().await.clone();
            *electrical = good.clone();
            (good, true)
        }
    }

    pub async fn classify(&self, ip: IpAddr, protocol: Protocol) -> crate::model::security::ConnectionStatus {
        if self.blocked.read().await.contains(&ip) {
            return crate::model::security::ConnectionStatus::Unknown;
        }
        if self.allow_list.read().await.contains(&(ip, protocol)) {
            crate::model::security::ConnectionStatus::Authorised
        } else {
            crate::model::security::ConnectionStatus::Unknown
        }
    }

    pub async fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn set_breaker(&self, breaker_id: &str, state: BreakerState) {
        self.breakers.write().await.insert(breaker_id.to_string(), state);
    }

    pub async fn isolate(&self) {
        let mut breakers = self.breakers.write().await;
        for state in breakers.values_mut() {
            *state = BreakerState::Open;
        }
    }

    pub async fn block(&self, ip: IpAddr) {
        self.blocked.write().await.insert(ip);
    }
}
