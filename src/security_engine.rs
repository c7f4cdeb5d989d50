//! Security engine: allow-list, connection classification, and security
//! event emission (spec.md §4.6).

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bus::{BusMessage, FanOutBus};
use crate::historian::{HistorianHandle, HistorianRow};
use crate::model::security::{
    ConnectionRecord, ConnectionStatus, EventSeverity, Protocol, SecurityEvent, SecurityEventType,
};
use crate::protocol::{Command, CommandDispatch};

/// Connection history retained for `GET /security/connections` (spec.md
/// §4.6: "current + last 24 h").
const RETENTION: Duration = Duration::hours(24);
const MAX_RETAINED: usize = 50_000;

pub struct SecurityEngine {
    allow_list: RwLock<HashSet<(IpAddr, Protocol)>>,
    connections: RwLock<VecDeque<ConnectionRecord>>,
    blocked: RwLock<HashSet<IpAddr>>,
    bus: FanOutBus,
    historian: HistorianHandle,
    dispatch: CommandDispatch,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct SecuritySummary {
    pub authorised: usize,
    pub unknown: usize,
    pub by_node: Vec<(String, usize, usize)>,
}

impl SecurityEngine {
    pub fn new(allow_list: HashSet<(IpAddr, Protocol)>, bus: FanOutBus, historian: HistorianHandle, dispatch: CommandDispatch) -> Self {
        Self {
            allow_list: RwLock::new(allow_list),
            connections: RwLock::new(VecDeque::new()),
            blocked: RwLock::new(HashSet::new()),
            bus,
            historian,
            dispatch,
        }
    }

    /// Classifies `(client_ip, protocol)` against the allow-list
    /// (spec.md §3: "computed once at accept time").
    pub async fn classify(&self, client_ip: IpAddr, protocol: Protocol) -> ConnectionStatus {
        if self.allow_list.read().await.contains(&(client_ip, protocol)) {
            ConnectionStatus::Authorised
        } else {
            ConnectionStatus::Unknown
        }
    }

    /// Records a connection report pushed by an RTU (spec.md §4.1: "every
    /// accept and every close emits a connection record").
    pub async fn record_connection(&self, record: ConnectionRecord) {
        if record.status == ConnectionStatus::Unknown {
            self.emit_unknown_connection(&record).await;
        }

        let mut connections = self.connections.write().await;
        connections.push_back(record);
        let cutoff = Utc::now() - RETENTION;
        while connections.front().map(|r| r.connected_at < cutoff).unwrap_or(false) {
            connections.pop_front();
        }
        while connections.len() > MAX_RETAINED {
            connections.pop_front();
        }
    }

    async fn emit_unknown_connection(&self, record: &ConnectionRecord) {
        // Idempotent: one event per distinct (node, ip, protocol) accept,
        // not one per request on that connection (spec.md §4.6).
        let already_seen = self
            .connections
            .read()
            .await
            .iter()
            .any(|r| r.node_id == record.node_id && r.client_ip == record.client_ip && r.protocol == record.protocol && r.disconnected_at.is_none());
        if already_seen {
            return;
        }

        warn!(node_id = %record.node_id, client_ip = %record.client_ip, protocol = ?record.protocol, "unknown connection");
        let event = SecurityEvent::new(
            SecurityEventType::UnknownConnection,
            EventSeverity::Warning,
            Some(record.node_id.clone()),
            Some(record.client_ip),
            format!("unauthorised {:?} connection from {}", record.protocol, record.client_ip),
        );
        self.historian.send(HistorianRow::Security(event.clone()));
        self.bus.publish(BusMessage::UnknownConnection { event });
    }

    pub async fn summary(&self) -> SecuritySummary {
        let connections = self.connections.read().await;
        let mut by_node: std::collections::HashMap<String, (usize, usize)> = std::collections::HashMap::new();
        let mut authorised = 0;
        let mut unknown = 0;
        for record in connections.iter() {
            let entry = by_node.entry(record.node_id.clone()).or_default();
            match record.status {
                ConnectionStatus::Authorised => {
                    authorised += 1;
                    entry.0 += 1;
                }
                ConnectionStatus::Unknown => {
                    unknown += 1;
                    entry.1 += 1;
                }
            }
        }
        SecuritySummary {
            authorised,
            unknown,
            by_node: by_node.into_iter().map(|(k, (a, u))| (k, a, u)).collect(),
        }
    }

    /// Operator `block(client_ip)` command (spec.md §4.6, permission
    /// `admin.security`). Idempotent: repeated blocks are no-ops.
    pub async fn block(&self, client_ip: IpAddr) {
        let newly_blocked = self.blocked.write().await.insert(client_ip);
        if !newly_blocked {
            return;
        }

        self.allow_list.write().await.retain(|(ip, _)| *ip != client_ip);

        let node_ids: Vec<String> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|r| r.client_ip == client_ip && r.disconnected_at.is_none())
                .map(|r| r.node_id.clone())
                .collect()
        };
        for node_id in node_ids {
            let _ = self
                .dispatch
                .send(&node_id, Command::Block { client_ip }, std::time::Duration::from_secs(2))
                .await;
        }

        info!(%client_ip, "block issued");
        let event = SecurityEvent::new(SecurityEventType::BlockIssued, EventSeverity::Critical, None, Some(client_ip), format!("block issued for {client_ip}"));
        self.historian.send(HistorianRow::Security(event.clone()));
        self.bus.publish(BusMessage::SecurityEvent { event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn engine() -> SecurityEngine {
        let mut allow_list = HashSet::new();
        allow_list.insert((ip("10.0.1.1"), Protocol::Modbus));
        SecurityEngine::new(allow_list, FanOutBus::new(), HistorianHandle::noop(), CommandDispatch::default())
    }

    #[tokio::test]
    async fn allow_listed_pair_is_authorised() {
        let engine = engine();
        assert_eq!(engine.classify(ip("10.0.1.1"), Protocol::Modbus).await, ConnectionStatus::Authorised);
    }

    #[tokio::test]
    async fn unlisted_ip_is_unknown() {
        let engine = engine();
        assert_eq!(engine.classify(ip("203.0.113.9"), Protocol::Modbus).await, ConnectionStatus::Unknown);
    }

    #[tokio::test]
    async fn unknown_connection_appears_in_summary() {
        let engine = engine();
        engine
            .record_connection(ConnectionRecord {
                node_id: "GEN-001".into(),
                client_ip: ip("203.0.113.9"),
                client_port: 5555,
                protocol: Protocol::Modbus,
                status: ConnectionStatus::Unknown,
                connected_at: Utc::now(),
                disconnected_at: None,
                requests_count: 1,
                bytes_in: 10,
                bytes_out: 0,
            })
            .await;
        let summary = engine.summary().await;
        assert_eq!(summary.unknown, 1);
    }

    #[tokio::test]
    async fn repeated_block_is_a_no_op() {
        let engine = engine();
        engine.block(ip("203.0.113.9")).await;
        assert!(engine.blocked.read().await.contains(&ip("203.0.113.9")));
        engine.block(ip("203.0.113.9")).await;
        assert_eq!(engine.blocked.read().await.len(), 1);
    }
}
