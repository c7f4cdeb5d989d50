//! Grid-wide aggregator (spec.md §4.3).
//!
//! Reads a consistent-enough view of every node's latest sample once per
//! tick, rolls it up into a [`GridSnapshot`], and publishes it to the fan-out
//! bus. The per-node ring buffers themselves live on [`NodeRegistry`]
//! records; this module only does the cross-node math.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alarm_engine::AlarmEngine;
use crate::bus::{BusMessage, FanOutBus};
use crate::historian::{HistorianHandle, HistorianRow};
use crate::model::alarm::{AlarmState, Severity};
use crate::model::grid::{AlarmCounts, GridSnapshot};
use crate::model::node::{LinkState, NodeKind};
use crate::registry::NodeRegistry;

/// 10 minutes of 1 Hz samples (spec.md §3: "last-10-minute frequency trace").
const FREQUENCY_TRACE_LEN: usize = 600;

pub struct Aggregator {
    registry: Arc<NodeRegistry>,
    alarms: Arc<AlarmEngine>,
    bus: FanOutBus,
    historian: HistorianHandle,
    tick: Duration,
    keepalive: Duration,
    last_snapshot: RwLock<Option<GridSnapshot>>,
    last_published: RwLock<Option<DateTime<Utc>>>,
    frequency_trace: RwLock<VecDeque<(DateTime<Utc>, f64)>>,
}

impl Aggregator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        alarms: Arc<AlarmEngine>,
        bus: FanOutBus,
        historian: HistorianHandle,
        tick_ms: u64,
        keepalive_ms: u64,
    ) -> Self {
        Self {
            registry,
            alarms,
            bus,
            historian,
            tick: Duration::from_millis(tick_ms),
            keepalive: Duration::from_millis(keepalive_ms),
            last_snapshot: RwLock::new(None),
            last_published: RwLock::new(None),
            frequency_trace: RwLock::new(VecDeque::with_capacity(FREQUENCY_TRACE_LEN)),
        }
    }

    pub async fn latest(&self) -> Option<GridSnapshot> {
        self.last_snapshot.read().await.clone()
    }

    /// Computes one snapshot from the registry's current state (spec.md
    /// §4.3 numeric rules).
    pub async fn compute(&self) -> GridSnapshot {
        let records = self.registry.snapshot_all().await;

        let mut weighted_freq_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut total_generation = 0.0;
        let mut total_load = 0.0;
        let mut nodes_online = 0u32;
        let mut nodes_offline = 0u32;
        let mut nodes_degraded = 0u32;

        for record in &records {
            if record.link_state.is_online() {
                nodes_online += 1;
            }
            if record.link_state == LinkState::Offline {
                nodes_offline += 1;
            }
            if record.link_state == LinkState::Degraded {
                nodes_degraded += 1;
            }

            let Some(sample) = &record.latest_sample else { continue };
            let Some(power) = sample.real_power_mw else { continue };

            match record.descriptor.kind {
                NodeKind::Generation => {
                    if record.link_state != LinkState::Offline {
                        total_generation += power;
                        if let Some(freq) = sample.frequency_hz {
                            let weight = record.descriptor.rated_capacity_mw;
                            weighted_freq_sum += freq * weight;
                            weight_sum += weight;
                        }
                    }
                }
                NodeKind::Substation | NodeKind::Distribution => {
                    total_load += power;
                }
            }
        }

        let system_frequency_hz = if weight_sum > 0.0 { weighted_freq_sum / weight_sum } else { 0.0 };
        let grid_losses_mw = (total_generation - total_load).max(0.0);

        let active_alarms = self.alarms.active_alarms().await;
        let mut alarm_counts = AlarmCounts::default();
        for alarm in &active_alarms {
            if alarm.state == AlarmState::Cleared {
                continue;
            }
            match alarm.severity {
                Severity::Info => alarm_counts.info += 1,
                Severity::Warning => alarm_counts.warning += 1,
                Severity::Critical => alarm_counts.critical += 1,
            }
        }

        let computed_at = Utc::now();
        {
            let mut trace = self.frequency_trace.write().await;
            trace.push_back((computed_at, system_frequency_hz));
            while trace.len() > FREQUENCY_TRACE_LEN {
                trace.pop_front();
            }
        }

        GridSnapshot {
            system_frequency_hz,
            total_generation_mw: total_generation,
            total_load_mw: total_load,
            grid_losses_mw,
            nodes_online,
            nodes_offline,
            nodes_degraded,
            alarm_counts,
            frequency_trace: self.frequency_trace.read().await.iter().cloned().collect(),
            computed_at,
        }
    }

    /// Runs the 1 Hz aggregation tick until cancelled (spec.md §4.3, §4.12).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("aggregator shutting down");
                    return;
                }
                _ = ticker.tick() => self.tick_once().await,
            }
        }
    }

    async fn tick_once(&self) {
        let snapshot = self.compute().await;
        self.historian.send(HistorianRow::GridMetrics {
            time: snapshot.computed_at,
            total_generation_mw: snapshot.total_generation_mw,
            total_load_mw: snapshot.total_load_mw,
            system_frequency_hz: snapshot.system_frequency_hz,
            grid_losses_mw: snapshot.grid_losses_mw,
            nodes_online: snapshot.nodes_online,
            nodes_offline: snapshot.nodes_offline,
            active_alarms: snapshot.alarm_counts.info + snapshot.alarm_counts.warning + snapshot.alarm_counts.critical,
            critical_alarms: snapshot.alarm_counts.critical,
        });

        let should_publish = {
            let previous = self.last_snapshot.read().await;
            match previous.as_ref() {
                Some(prev) => prev.changed_materially(&snapshot),
                None => true,
            }
        };

        let keepalive_due = {
            let last = self.last_published.read().await;
            match *last {
                Some(t) => Utc::now() - t >= chrono::Duration::from_std(self.keepalive).unwrap_or_default(),
                None => true,
            }
        };

        if should_publish || keepalive_due {
            self.bus.publish(BusMessage::GridOverviewUpdate { grid: snapshot.clone() });
            *self.last_published.write().await = Some(Utc::now());
        }

        *self.last_snapshot.write().await = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, NodeCatalogue};
    use crate::model::node::{NodeDescriptor, NodeKind as Kind};
    use crate::model::telemetry::{SampleQuality, TelemetrySample};

    fn catalogue() -> NodeCatalogue {
        NodeCatalogue {
            node: vec![
                NodeDescriptor {
                    node_id: "GEN-001".into(),
                    kind: Kind::Generation,
                    nominal_voltage_kv: 230.0,
                    rated_capacity_mw: 500.0,
                    node_ip: "10.0.1.1".into(),
                    rest_port: 8101,
                    control_port: 9101,
                    modbus_port: 5101,
                    iec104_port: 2401,
                },
                NodeDescriptor {
                    node_id: "DIST-001".into(),
                    kind: Kind::Distribution,
                    nominal_voltage_kv: 13.8,
                    rated_capacity_mw: 40.0,
                    node_ip: "10.0.3.1".into(),
                    rest_port: 8301,
                    control_port: 9301,
                    modbus_port: 5301,
                    iec104_port: 2411,
                },
            ],
        }
    }

    fn sample(node_id: &str, power: f64, freq: Option<f64>) -> TelemetrySample {
        TelemetrySample {
            node_id: node_id.to_string(),
            sequence: 0,
            timestamp: Utc::now(),
            voltage_kv: Some(230.0),
            current_a: None,
            real_power_mw: Some(power),
            reactive_power_mvar: None,
            power_factor: None,
            frequency_hz: freq,
            temperature_c: None,
            breaker_state: None,
            energy_delivered_mwh: None,
            quality: SampleQuality::Good,
        }
    }

    async fn aggregator() -> Aggregator {
        let registry = Arc::new(NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default()));
        registry.on_connected("GEN-001").await;
        registry.on_connected("DIST-001").await;
        registry.on_telemetry(sample("GEN-001", 300.0, Some(50.0))).await;
        registry.on_telemetry(sample("DIST-001", 250.0, None)).await;

        let bus = FanOutBus::new();
        let historian = HistorianHandle::noop();
        let alarms = Arc::new(AlarmEngine::new(bus.clone(), historian.clone()));
        Aggregator::new(registry, alarms, bus, historian, 1000, 5000)
    }

    #[tokio::test]
    async fn losses_are_clamped_to_zero_when_load_exceeds_generation() {
        let aggregator = aggregator().await;
        let snapshot = aggregator.compute().await;
        assert!(snapshot.grid_losses_mw >= 0.0);
    }

    #[tokio::test]
    async fn nodes_online_counts_connected_nodes() {
        let aggregator = aggregator().await;
        let snapshot = aggregator.compute().await;
        assert_eq!(snapshot.nodes_online, 2);
    }

    #[tokio::test]
    async fn frequency_weighting_ignores_non_generating_nodes() {
        let aggregator = aggregator().await;
        let snapshot = aggregator.compute().await;
        assert_eq!(snapshot.system_frequency_hz, 50.0);
    }
}
