//! Node registry and per-node connection supervision (spec.md §4.2).
//!
//! The registry is the single writer of each [`NodeRuntimeRecord`]; every
//! other component only reads through [`NodeRegistry::get_node`] /
//! [`NodeRegistry::list_nodes`] (spec.md §5 resource table).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HeartbeatConfig, NodeCatalogue};
use crate::errors::{GridError, GridResult};
use crate::model::node::{BreakerState, LinkState, NodeRuntimeRecord, NodeSummary};
use crate::model::telemetry::TelemetrySample;

/// Full jitter backoff (AWS architecture blog formula): `random(0, min(cap,
/// base * 2^attempt))`. Keeps reconnect storms from synchronising across
/// the 15 node supervisors.
pub fn full_jitter_backoff(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let exp = initial_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(max_ms);
    let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
    Duration::from_millis(jittered)
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeRuntimeRecord>>,
    heartbeat: HeartbeatConfig,
}

impl NodeRegistry {
    pub fn from_catalogue(catalogue: &NodeCatalogue, ring_capacity: usize, heartbeat: HeartbeatConfig) -> Self {
        let mut nodes = HashMap::with_capacity(catalogue.node.len());
        for descriptor in &catalogue.node {
            nodes.insert(
                descriptor.node_id.clone(),
                NodeRuntimeRecord::new(descriptor.clone(), ring_capacity),
            );
        }
        Self {
            nodes: RwLock::new(nodes),
            heartbeat,
        }
    }

    pub async fn list_nodes(&self) -> Vec<NodeSummary> {
        self.nodes.read().await.values().map(|n| n.summary()).collect()
    }

    /// Clones every node record for a consistent-enough read (spec.md §5:
    /// "readers under snapshot-consistent view"). Used by the aggregator.
    pub async fn snapshot_all(&self) -> Vec<NodeRuntimeRecord> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn get_node(&self, node_id: &str) -> GridResult<NodeRuntimeRecord> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| GridError::Validation(format!("unknown node {node_id}")))
    }

    pub async fn link_state(&self, node_id: &str) -> Option<LinkState> {
        self.nodes.read().await.get(node_id).map(|n| n.link_state)
    }

    /// Called by the control-channel reader when the handshake completes.
    /// Requests a full snapshot by returning `true` if this is the first
    /// `Connected` since a disconnect (spec.md §4.2).
    pub async fn on_connected(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(record) = nodes.get_mut(node_id) else { return false };
        let needs_snapshot = record.link_state != LinkState::Connected;
        if needs_snapshot {
            info!(node_id, from = ?record.link_state, "node connected");
        }
        record.link_state = LinkState::Connected;
        record.last_heartbeat = Some(Utc::now());
        record.reconnect_attempts = 0;
        needs_snapshot
    }

    pub async fn on_disconnected(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(record) = nodes.get_mut(node_id) {
            warn!(node_id, "control-channel disconnected");
            record.link_state = LinkState::Reconnecting;
        }
    }

    pub async fn on_reconnect_attempt(&self, node_id: &str) -> u32 {
        let mut nodes = self.nodes.write().await;
        let Some(record) = nodes.get_mut(node_id) else { return 0 };
        record.link_state = LinkState::Connecting;
        record.reconnect_attempts += 1;
        record.reconnect_attempts
    }

    pub async fn on_heartbeat(&self, node_id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(record) = nodes.get_mut(node_id) {
            record.last_heartbeat = Some(Utc::now());
            if record.link_state == LinkState::Degraded {
                info!(node_id, "heartbeat resumed, link restored");
                record.link_state = LinkState::Connected;
            }
        }
    }

    pub async fn on_telemetry(&self, sample: TelemetrySample) {
        let mut nodes = self.nodes.write().await;
        if let Some(record) = nodes.get_mut(&sample.node_id) {
            record.last_heartbeat = Some(Utc::now());
            record.ring.push(sample.clone());
            record.latest_sample = Some(sample);
        }
    }

    pub async fn set_breaker(&self, node_id: &str, breaker_id: &str, state: BreakerState) {
        let mut nodes = self.nodes.write().await;
        if let Some(record) = nodes.get_mut(node_id) {
            record.breakers.insert(breaker_id.to_string(), state);
        }
    }

    /// Downgrades link states whose heartbeat has gone stale. Run on a
    /// periodic tick by the supervisor (spec.md §4.2 state diagram).
    pub async fn sweep_link_states(&self) {
        let now = Utc::now();
        let mut nodes = self.nodes.write().await;
        for record in nodes.values_mut() {
            let Some(last) = record.last_heartbeat else { continue };
            let gap = (now - last).num_seconds().max(0) as u64;
            match record.link_state {
                LinkState::Connected if gap > self.heartbeat.degraded_after_secs => {
                    warn!(node_id = %record.descriptor.node_id, gap, "heartbeat gap exceeded H, degrading");
                    record.link_state = LinkState::Degraded;
                }
                LinkState::Degraded if gap > self.heartbeat.offline_after_secs => {
                    warn!(node_id = %record.descriptor.node_id, gap, "heartbeat gap exceeded F, marking offline");
                    record.link_state = LinkState::Offline;
                }
                _ => {}
            }
        }
    }

    /// Marks every node `Offline` for shutdown; control-channel tasks close
    /// their sockets independently on the same cancellation token.
    pub async fn broadcast_close(&self) {
        let mut nodes = self.nodes.write().await;
        for record in nodes.values_mut() {
            record.link_state = LinkState::Offline;
        }
    }
}

/// Runs [`NodeRegistry::sweep_link_states`] on the heartbeat cadence until
/// cancelled. Spawned once by bootstrap alongside the per-node dialers.
pub async fn run_stale_sweeper(registry: Arc<NodeRegistry>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(registry.heartbeat.interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stale sweeper shutting down");
                return;
            }
            _ = interval.tick() => {
                registry.sweep_link_states().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::{NodeDescriptor, NodeKind};

    fn catalogue() -> NodeCatalogue {
        NodeCatalogue {
            node: vec![NodeDescriptor {
                node_id: "GEN-001".into(),
                kind: NodeKind::Generation,
                nominal_voltage_kv: 230.0,
                rated_capacity_mw: 500.0,
                node_ip: "10.0.0.1".into(),
                rest_port: 8101,
                control_port: 9101,
                modbus_port: 5101,
                iec104_port: 2401,
            }],
        }
    }

    #[tokio::test]
    async fn first_connect_requests_a_snapshot() {
        let registry = NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default());
        assert!(registry.on_connected("GEN-001").await);
        // already connected: no snapshot needed on a redundant call
        assert!(!registry.on_connected("GEN-001").await);
    }

    #[tokio::test]
    async fn degraded_then_offline_transition_follows_heartbeat_gap() {
        let mut heartbeat = HeartbeatConfig::default();
        heartbeat.degraded_after_secs = 0;
        heartbeat.offline_after_secs = 0;
        let registry = NodeRegistry::from_catalogue(&catalogue(), 16, heartbeat);
        registry.on_connected("GEN-001").await;
        // force the heartbeat into the past
        {
            let mut nodes = registry.nodes.write().await;
            nodes.get_mut("GEN-001").unwrap().last_heartbeat =
                Some(Utc::now() - chrono::Duration::seconds(120));
        }
        registry.sweep_link_states().await;
        assert_eq!(registry.link_state("GEN-001").await, Some(LinkState::Degraded));
        registry.sweep_link_states().await;
        assert_eq!(registry.link_state("GEN-001").await, Some(LinkState::Offline));
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..30 {
            let delay = full_jitter_backoff(attempt, 1000, 60_000);
            assert!(delay.as_millis() <= 60_000);
        }
    }

    #[tokio::test]
    async fn unknown_node_lookup_is_a_validation_error() {
        let registry = NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default());
        let err = registry.get_node("DOES-NOT-EXIST").await.unwrap_err();
        assert!(matches!(err, GridError::Validation(_)));
    }
}
