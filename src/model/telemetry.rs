//! Telemetry sample type and the per-node ring buffer (spec.md §3, §4.3).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::BreakerState;

/// Quality flag a sample is tagged with. RTUs mark a sample `Suspect` when
/// the local simulator produced a non-finite value and the last good value
/// was substituted instead (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleQuality {
    Good,
    Suspect,
}

/// One telemetry reading from a node. Every numeric field is optional
/// because the schema is shared across node kinds and not every kind
/// produces every field (e.g. no `temperature_c` on distribution feeders).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub node_id: String,
    /// Per-node monotonic sequence number; dense except across reconnects.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub voltage_kv: Option<f64>,
    pub current_a: Option<f64>,
    pub real_power_mw: Option<f64>,
    pub reactive_power_mvar: Option<f64>,
    pub power_factor: Option<f64>,
    pub frequency_hz: Option<f64>,
    pub temperature_c: Option<f64>,
    pub breaker_state: Option<BreakerState>,
    pub energy_delivered_mwh: Option<f64>,
    pub quality: SampleQuality,
}

/// Fixed-capacity, oldest-eviction ring buffer of samples for a single node.
///
/// Default capacity is 3600 (spec.md §3: "retain ~1 h at 1 Hz").
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    samples: VecDeque<TelemetrySample>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    /// Push a new sample, evicting the oldest if at capacity.
    ///
    /// Invariant (spec.md §8): at capacity, exactly the oldest sample is
    /// evicted and no other.
    pub fn push(&mut self, sample: TelemetrySample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples with `from <= timestamp <= to`, newest-first, capped at
    /// `limit` (spec.md §6.1 `GET /nodes/{id}/telemetry`).
    pub fn query(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<TelemetrySample> {
        self.samples
            .iter()
            .rev()
            .filter(|s| from.map(|f| s.timestamp >= f).unwrap_or(true))
            .filter(|s| to.map(|t| s.timestamp <= t).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.samples.back()
    }
}

pub const DEFAULT_RING_CAPACITY: usize = 3600;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(node_id: &str, sequence: u64, ts: DateTime<Utc>) -> TelemetrySample {
        TelemetrySample {
            node_id: node_id.to_string(),
            sequence,
            timestamp: ts,
            voltage_kv: Some(230.0),
            current_a: None,
            real_power_mw: Some(100.0),
            reactive_power_mvar: None,
            power_factor: None,
            frequency_hz: Some(50.0),
            temperature_c: None,
            breaker_state: Some(BreakerState::Closed),
            energy_delivered_mwh: None,
            quality: SampleQuality::Good,
        }
    }

    #[test]
    fn eviction_drops_exactly_the_oldest() {
        let mut ring = RingBuffer::new(3);
        let t0 = Utc::now();
        ring.push(sample("N1", 0, t0));
        ring.push(sample("N1", 1, t0));
        ring.push(sample("N1", 2, t0));
        ring.push(sample("N1", 3, t0));

        assert_eq!(ring.len(), 3);
        let seqs: Vec<u64> = ring.query(None, None, 10).iter().map(|s| s.sequence).collect();
        // newest-first; sequence 0 must have been evicted
        assert_eq!(seqs, vec![3, 2, 1]);
    }

    #[test]
    fn query_respects_limit() {
        let mut ring = RingBuffer::new(10);
        let t0 = Utc::now();
        for i in 0..5 {
            ring.push(sample("N1", i, t0));
        }
        assert_eq!(ring.query(None, None, 2).len(), 2);
    }

    #[test]
    fn latest_reflects_most_recent_push() {
        let mut ring = RingBuffer::new(10);
        let t0 = Utc::now();
        ring.push(sample("N1", 0, t0));
        ring.push(sample("N1", 1, t0));
        assert_eq!(ring.latest().unwrap().sequence, 1);
    }
}
