//! Alarm state machine and codes (spec.md §3, §4.4).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Raised,
    Acknowledged,
    Cleared,
}

/// Static codes this engine raises; severity is selected by code
/// (spec.md §4.4: "Severity selection is by code (static mapping)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmCode {
    Overvoltage,
    Undervoltage,
    Overfrequency,
    Underfrequency,
    ThermalTrip,
    BreakerTripped,
    ControlFailure,
}

impl AlarmCode {
    pub fn severity(self) -> Severity {
        match self {
            AlarmCode::Overvoltage | AlarmCode::Undervoltage => Severity::Warning,
            AlarmCode::Overfrequency | AlarmCode::Underfrequency => Severity::Warning,
            AlarmCode::ThermalTrip => Severity::Critical,
            AlarmCode::BreakerTripped => Severity::Critical,
            AlarmCode::ControlFailure => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alarm {
    pub alarm_id: Uuid,
    pub node_id: String,
    pub code: AlarmCode,
    pub severity: Severity,
    pub state: AlarmState,
    pub raised_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub details: Value,
}

impl Alarm {
    pub fn new(node_id: String, code: AlarmCode, details: Value) -> Self {
        Self {
            alarm_id: Uuid::new_v4(),
            node_id,
            code,
            severity: code.severity(),
            state: AlarmState::Raised,
            raised_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            cleared_at: None,
            details,
        }
    }

    /// `Raised -> Acknowledged`. No-op if already `Acknowledged` or
    /// `Cleared` (spec.md §4.4 "idempotent acknowledge").
    pub fn acknowledge(&mut self, operator: &str) -> bool {
        if self.state != AlarmState::Raised {
            return false;
        }
        self.state = AlarmState::Acknowledged;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(operator.to_string());
        true
    }

    /// `Raised | Acknowledged -> Cleared`. Terminal: once cleared the
    /// record is immutable.
    pub fn clear(&mut self) -> bool {
        if self.state == AlarmState::Cleared {
            return false;
        }
        self.state = AlarmState::Cleared;
        self.cleared_at = Some(Utc::now());
        true
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AlarmState::Raised | AlarmState::Acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledge_is_idempotent() {
        let mut alarm = Alarm::new("GEN-001".into(), AlarmCode::Underfrequency, Value::Null);
        assert!(alarm.acknowledge("op1"));
        assert_eq!(alarm.state, AlarmState::Acknowledged);
        // second call is a no-op
        assert!(!alarm.acknowledge("op2"));
        assert_eq!(alarm.acknowledged_by.as_deref(), Some("op1"));
    }

    #[test]
    fn clear_after_acknowledge_is_terminal() {
        let mut alarm = Alarm::new("GEN-001".into(), AlarmCode::Underfrequency, Value::Null);
        alarm.acknowledge("op1");
        assert!(alarm.clear());
        assert!(!alarm.is_active());
        assert!(!alarm.clear());
    }

    #[test]
    fn raised_alarm_can_clear_directly() {
        let mut alarm = Alarm::new("GEN-001".into(), AlarmCode::ThermalTrip, Value::Null);
        assert!(alarm.clear());
        assert_eq!(alarm.state, AlarmState::Cleared);
    }
}
