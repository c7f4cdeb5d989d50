//! Grid-wide snapshot produced by the aggregator (spec.md §3, §4.3).

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rolled-up state of the whole grid at one aggregator tick. Only the
/// latest snapshot is kept in memory; history lives in the historian.
#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub system_frequency_hz: f64,
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
    pub grid_losses_mw: f64,
    pub nodes_online: u32,
    pub nodes_offline: u32,
    pub nodes_degraded: u32,
    pub alarm_counts: AlarmCounts,
    /// Last ten minutes of `system_frequency_hz`, oldest first.
    pub frequency_trace: Vec<(DateTime<Utc>, f64)>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AlarmCounts {
    pub info: u32,
    pub warning: u32,
    pub critical: u32,
}

impl GridSnapshot {
    /// Whether `other` differs from `self` by more than the epsilons in
    /// spec.md §4.3 (frequency 0.005 Hz, MW values 0.5 MW).
    pub fn changed_materially(&self, other: &GridSnapshot) -> bool {
        const FREQ_EPS: f64 = 0.005;
        const MW_EPS: f64 = 0.5;

        (self.system_frequency_hz - other.system_frequency_hz).abs() > FREQ_EPS
            || (self.total_generation_mw - other.total_generation_mw).abs() > MW_EPS
            || (self.total_load_mw - other.total_load_mw).abs() > MW_EPS
            || (self.grid_losses_mw - other.grid_losses_mw).abs() > MW_EPS
            || self.nodes_online != other.nodes_online
            || self.nodes_offline != other.nodes_offline
            || self.nodes_degraded != other.nodes_degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(freq: f64) -> GridSnapshot {
        GridSnapshot {
            system_frequency_hz: freq,
            total_generation_mw: 1000.0,
            total_load_mw: 950.0,
            grid_losses_mw: 50.0,
            nodes_online: 15,
            nodes_offline: 0,
            nodes_degraded: 0,
            alarm_counts: AlarmCounts::default(),
            frequency_trace: vec![],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn small_frequency_drift_is_not_material() {
        let a = snap(50.0);
        let b = snap(50.001);
        assert!(!a.changed_materially(&b));
    }

    #[test]
    fn large_frequency_drift_is_material() {
        let a = snap(50.0);
        let b = snap(50.1);
        assert!(a.changed_materially(&b));
    }
}
