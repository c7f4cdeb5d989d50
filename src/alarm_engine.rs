//! Alarm raise/clear/acknowledge engine (spec.md §4.4).
//!
//! State is keyed by `(node_id, code)` and serialised through [`Sharded`]
//! rather than one global mutex, per the design note in spec.md §9.

use serde_json::json;
use tracing::info;

use crate::bus::{BusMessage, FanOutBus};
use crate::historian::{HistorianHandle, HistorianRow};
use crate::model::alarm::{Alarm, AlarmCode};
use crate::model::node::NodeKind;
use crate::model::telemetry::TelemetrySample;
use crate::sharded::Sharded;

/// Consecutive in-band samples required before an active alarm clears
/// (spec.md §4.4: "for at least 5 consecutive samples").
const CLEAR_STREAK: u32 = 5;

const FREQ_LOW_HZ: f64 = 49.5;
const FREQ_HIGH_HZ: f64 = 50.5;
const FREQ_HYSTERESIS_HZ: f64 = 0.05;
const VOLTAGE_DEVIATION_PCT: f64 = 0.10;
const VOLTAGE_HYSTERESIS_PCT: f64 = 0.02;
const THERMAL_TRIP_C: f64 = 100.0;
const THERMAL_HYSTERESIS_C: f64 = 5.0;

#[derive(Clone)]
struct ActiveEntry {
    alarm: Alarm,
    in_band_streak: u32,
}

pub struct AlarmEngine {
    table: Sharded<(String, AlarmCode), ActiveEntry>,
    bus: FanOutBus,
    historian: HistorianHandle,
}

impl AlarmEngine {
    pub fn new(bus: FanOutBus, historian: HistorianHandle) -> Self {
        Self {
            table: Sharded::new(),
            bus,
            historian,
        }
    }

    pub async fn active_alarms(&self) -> Vec<Alarm> {
        self.table
            .snapshot()
            .await
            .into_iter()
            .map(|entry| entry.alarm)
            .filter(|alarm| alarm.is_active())
            .collect()
    }

    /// Evaluates one telemetry sample's threshold crossings for the node
    /// kind it came from (spec.md §4.4 driver (a)).
    pub async fn evaluate_telemetry(&self, node_kind: NodeKind, nominal_voltage_kv: f64, sample: &TelemetrySample) {
        if let Some(freq) = sample.frequency_hz {
            let crossed = !(FREQ_LOW_HZ..=FREQ_HIGH_HZ).contains(&freq);
            let in_band = (FREQ_LOW_HZ + FREQ_HYSTERESIS_HZ..=FREQ_HIGH_HZ - FREQ_HYSTERESIS_HZ).contains(&freq);
            let code = if freq > FREQ_HIGH_HZ {
                AlarmCode::Overfrequency
            } else {
                AlarmCode::Underfrequency
            };
            self.apply_threshold(&sample.node_id, code, crossed, in_band, json!({"frequency_hz": freq})).await;
        }

        if let Some(voltage) = sample.voltage_kv {
            if nominal_voltage_kv > 0.0 {
                let deviation = (voltage - nominal_voltage_kv).abs() / nominal_voltage_kv;
                let crossed = deviation > VOLTAGE_DEVIATION_PCT;
                let in_band = deviation < VOLTAGE_HYSTERESIS_PCT;
                let code = if voltage > nominal_voltage_kv {
                    AlarmCode::Overvoltage
                } else {
                    AlarmCode::Undervoltage
                };
                self.apply_threshold(&sample.node_id, code, crossed, in_band, json!({"voltage_kv": voltage})).await;
            }
        }

        // Thermal is meaningful for generation/substation nodes only.
        if matches!(node_kind, NodeKind::Generation | NodeKind::Substation) {
            if let Some(temp) = sample.temperature_c {
                let crossed = temp > THERMAL_TRIP_C;
                let in_band = temp < THERMAL_TRIP_C - THERMAL_HYSTERESIS_C;
                self.apply_threshold(
                    &sample.node_id,
                    AlarmCode::ThermalTrip,
                    crossed,
                    in_band,
                    json!({"temperature_c": temp}),
                )
                .await;
            }
        }
    }

    /// A breaker transitioning to `Tripped` raises directly, no hysteresis
    /// (spec.md §4.4 driver (a): "breaker transition to Tripped").
    pub async fn report_breaker_tripped(&self, node_id: &str, breaker_id: &str) {
        self.apply_threshold(
            node_id,
            AlarmCode::BreakerTripped,
            true,
            false,
            json!({"breaker_id": breaker_id}),
        )
        .await;
    }

    /// An RTU operate command that timed out or came back with a failure
    /// result raises directly, no hysteresis (spec.md §4.5: a failed
    /// operate is both an audit entry and an alarm).
    pub async fn report_control_failure(&self, node_id: &str, breaker_id: &str, reason: &str) {
        self.apply_threshold(
            node_id,
            AlarmCode::ControlFailure,
            true,
            false,
            json!({"breaker_id": breaker_id, "reason": reason}),
        )
        .await;
    }

    async fn apply_threshold(&self, node_id: &str, code: AlarmCode, crossed: bool, in_band: bool, details: serde_json::Value) {
        let key = (node_id.to_string(), code);
        let outcome = self
            .table
            .with_entry(&key, |table| {
                match table.get_mut(&key) {
                    None if crossed => {
                        let alarm = Alarm::new(node_id.to_string(), code, details.clone());
                        table.insert(key.clone(), ActiveEntry { alarm: alarm.clone(), in_band_streak: 0 });
                        Some(Outcome::Raised(alarm))
                    }
                    Some(entry) if crossed => {
                        bump_occurrences(&mut entry.alarm.details);
                        entry.in_band_streak = 0;
                        None
                    }
                    Some(entry) if in_band => {
                        entry.in_band_streak += 1;
                        if entry.in_band_streak >= CLEAR_STREAK {
                            let mut alarm = entry.alarm.clone();
                            alarm.clear();
                            table.remove(&key);
                            Some(Outcome::Cleared(alarm))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            })
            .await;

        match outcome {
            Some(Outcome::Raised(alarm)) => {
                info!(node_id, code = ?code, "alarm raised");
                self.historian.send(HistorianRow::Alarm(alarm.clone()));
                self.bus.publish(BusMessage::AlarmRaised { alarm });
            }
            Some(Outcome::Cleared(alarm)) => {
                info!(node_id, code = ?code, "alarm cleared");
                self.historian.send(HistorianRow::Alarm(alarm.clone()));
                self.bus.publish(BusMessage::AlarmCleared { alarm });
            }
            None => {}
        }
    }

    /// `acknowledge(alarm_id, operator, comment)` from spec.md §4.4.
    pub async fn acknowledge(&self, node_id: &str, code: AlarmCode, operator: &str) -> Option<Alarm> {
        let key = (node_id.to_string(), code);
        let alarm = self
            .table
            .with_entry(&key, |table| {
                table.get_mut(&key).and_then(|entry| {
                    if entry.alarm.acknowledge(operator) {
                        Some(entry.alarm.clone())
                    } else {
                        None
                    }
                })
            })
            .await?;
        self.historian.send(HistorianRow::Alarm(alarm.clone()));
        self.bus.publish(BusMessage::AlarmAcknowledged { alarm: alarm.clone() });
        Some(alarm)
    }

    /// `POST /alarms/{id}/acknowledge` looks alarms up by `alarm_id`; the
    /// engine's own table is keyed by `(node_id, code)`, so resolve the id
    /// first (spec.md §6.1). Returns `None` if already cleared or unknown,
    /// matching the handler's `409` vs `404` split.
    pub async fn acknowledge_by_id(&self, alarm_id: uuid::Uuid, operator: &str) -> Option<Alarm> {
        let (node_id, code) = self
            .table
            .snapshot()
            .await
            .into_iter()
            .find(|entry| entry.alarm.alarm_id == alarm_id)
            .map(|entry| (entry.alarm.node_id, entry.alarm.code))?;
        self.acknowledge(&node_id, code, operator).await
    }
}

enum Outcome {
    Raised(Alarm),
    Cleared(Alarm),
}

fn bump_occurrences(details: &mut serde_json::Value) {
    if !details.is_object() {
        *details = json!({});
    }
    let obj = details.as_object_mut().expect("set to object above");
    let count = obj.get("occurrences").and_then(|v| v.as_u64()).unwrap_or(0);
    obj.insert("occurrences".to_string(), json!(count + 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(freq: f64) -> TelemetrySample {
        TelemetrySample {
            node_id: "GEN-001".into(),
            sequence: 0,
            timestamp: Utc::now(),
            voltage_kv: Some(230.0),
            current_a: None,
            real_power_mw: None,
            reactive_power_mvar: None,
            power_factor: None,
            frequency_hz: Some(freq),
            temperature_c: None,
            breaker_state: None,
            energy_delivered_mwh: None,
            quality: crate::model::telemetry::SampleQuality::Good,
        }
    }

    fn engine() -> AlarmEngine {
        AlarmEngine::new(FanOutBus::new(), HistorianHandle::noop())
    }

    #[tokio::test]
    async fn frequency_at_boundary_does_not_alarm() {
        let engine = engine();
        engine
            .evaluate_telemetry(NodeKind::Generation, 230.0, &sample(49.5))
            .await;
        assert!(engine.active_alarms().await.is_empty());
    }

    #[tokio::test]
    async fn frequency_just_under_boundary_alarms() {
        let engine = engine();
        engine
            .evaluate_telemetry(NodeKind::Generation, 230.0, &sample(49.4))
            .await;
        assert_eq!(engine.active_alarms().await.len(), 1);
    }

    #[tokio::test]
    async fn repeated_crossings_increment_occurrences_not_duplicate() {
        let engine = engine();
        engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(49.0)).await;
        engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(48.9)).await;
        let active = engine.active_alarms().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].details["occurrences"], json!(1));
    }

    #[tokio::test]
    async fn clears_only_after_five_consecutive_in_band_samples() {
        let engine = engine();
        engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(49.0)).await;
        for _ in 0..4 {
            engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(50.0)).await;
            assert_eq!(engine.active_alarms().await.len(), 1);
        }
        engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(50.0)).await;
        assert!(engine.active_alarms().await.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent_through_the_engine() {
        let engine = engine();
        engine.evaluate_telemetry(NodeKind::Generation, 230.0, &sample(49.0)).await;
        let first = engine.acknowledge("GEN-001", AlarmCode::Underfrequency, "op1").await;
        assert!(first.is_some());
        let second = engine.acknowledge("GEN-001", AlarmCode::Underfrequency, "op2").await;
        assert!(second.is_none());
    }
}
