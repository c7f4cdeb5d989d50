//! Security/connection classification types (spec.md §3, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Rest,
    WebSocket,
    Modbus,
    Iec104,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Authorised,
    Unknown,
}

/// One inbound client connection observed by an RTU's protocol listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub node_id: String,
    pub client_ip: std::net::IpAddr,
    pub client_port: u16,
    pub protocol: Protocol,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub requests_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    UnknownConnection,
    AuthFailure,
    PermissionDenied,
    RateLimited,
    BlockIssued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: EventSeverity,
    pub node_id: Option<String>,
    pub client_ip: Option<std::net::IpAddr>,
    pub description: String,
    pub raised_at: DateTime<Utc>,
    pub metadata: Value,
}

impl SecurityEvent {
    pub fn new(
        event_type: SecurityEventType,
        severity: EventSeverity,
        node_id: Option<String>,
        client_ip: Option<std::net::IpAddr>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            severity,
            node_id,
            client_ip,
            description: description.into(),
            raised_at: Utc::now(),
            metadata: Value::Null,
        }
    }
}
