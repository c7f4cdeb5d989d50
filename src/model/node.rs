//! Node descriptor and node runtime record types (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::telemetry::{RingBuffer, TelemetrySample};

/// Kind of grid node. Determines which telemetry fields are meaningful and
/// whether the node contributes to frequency weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Generation,
    Substation,
    Distribution,
}

/// Static declaration of a single node, loaded from the node catalogue
/// (spec.md §6.5) at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub kind: NodeKind,
    pub nominal_voltage_kv: f64,
    pub rated_capacity_mw: f64,
    pub node_ip: String,
    pub rest_port: u16,
    pub control_port: u16,
    pub modbus_port: u16,
    pub iec104_port: u16,
}

/// Connection/link state machine for a node's control-channel (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting,
    Degraded,
    Offline,
}

impl LinkState {
    /// Counts toward `nodes_online` per spec.md §4.3.
    pub fn is_online(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }
}

/// Last known state of a single breaker owned by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Open,
    Closed,
    Tripped,
}

/// In-memory record the registry keeps for each declared node.
///
/// Invariant: exactly one task (the node's supervisor) mutates this record;
/// everyone else only reads it (see spec.md §5's resource table).
#[derive(Debug, Clone)]
pub struct NodeRuntimeRecord {
    pub descriptor: NodeDescriptor,
    pub link_state: LinkState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub latest_sample: Option<TelemetrySample>,
    pub ring: RingBuffer,
    pub breakers: std::collections::HashMap<String, BreakerState>,
}

impl NodeRuntimeRecord {
    pub fn new(descriptor: NodeDescriptor, capacity: usize) -> Self {
        Self {
            descriptor,
            link_state: LinkState::Connecting,
            last_heartbeat: None,
            reconnect_attempts: 0,
            latest_sample: None,
            ring: RingBuffer::new(capacity),
            breakers: std::collections::HashMap::new(),
        }
    }

    /// A lightweight view of this record without the ring buffer, used for
    /// `GET /nodes` (spec.md §6.1).
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.descriptor.node_id.clone(),
            kind: self.descriptor.kind,
            link_state: self.link_state,
            last_heartbeat: self.last_heartbeat,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub kind: NodeKind,
    pub link_state: LinkState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            node_id: "GEN-001".to_string(),
            kind: NodeKind::Generation,
            nominal_voltage_kv: 230.0,
            rated_capacity_mw: 500.0,
            node_ip: "10.0.0.1".to_string(),
            rest_port: 8080,
            control_port: 9100,
            modbus_port: 502,
            iec104_port: 2404,
        }
    }

    #[test]
    fn online_counts_connected_and_degraded_only() {
        assert!(LinkState::Connected.is_online());
        assert!(LinkState::Degraded.is_online());
        assert!(!LinkState::Offline.is_online());
        assert!(!LinkState::Connecting.is_online());
        assert!(!LinkState::Reconnecting.is_online());
    }

    #[test]
    fn summary_omits_ring_buffer() {
        let record = NodeRuntimeRecord::new(descriptor(), 16);
        let summary = record.summary();
        assert_eq!(summary.node_id, "GEN-001");
        assert_eq!(summary.link_state, LinkState::Connecting);
    }
}
