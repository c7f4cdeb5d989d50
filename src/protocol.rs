//! RTU <-> Master control-channel frames (spec.md §6.3).
//!
//! Length-prefixed JSON frames over a persistent TCP connection: a u32
//! big-endian length header followed by that many bytes of a single
//! serialised `Frame`. Both directions use the same framing; which
//! variants are legal in which direction is enforced by the sender, not
//! the wire format.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::errors::{GridError, GridResult};
use crate::model::control::{BreakerAction, OperateResult};
use crate::model::node::{BreakerState, NodeDescriptor};
use crate::model::security::ConnectionRecord;
use crate::model::telemetry::TelemetrySample;

/// Maximum frame body size accepted by either side, guards against a
/// corrupt length header turning into an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// RTU -> Master, sent immediately after the TCP connection is accepted.
    Hello {
        node_id: String,
        descriptor: NodeDescriptor,
        breakers: Vec<(String, BreakerState)>,
    },

    /// RTU -> Master, requested by the supervisor after a reconnect; a full
    /// re-sync of everything the RTU currently knows.
    Snapshot {
        node_id: String,
        latest_sample: Option<TelemetrySample>,
        breakers: Vec<(String, BreakerState)>,
    },

    /// RTU -> Master, one per sampling tick.
    Telemetry { sample: TelemetrySample },

    /// RTU -> Master, for breaker transitions and alarm-worthy local events.
    Event {
        node_id: String,
        kind: EventKind,
    },

    /// RTU -> Master, emitted on every protocol-listener accept/close.
    ConnectionReport { record: ConnectionRecord },

    /// Master -> RTU.
    Command {
        request_id: Uuid,
        command: Command,
    },

    /// RTU -> Master, correlated to a `Command` by `request_id`.
    Reply {
        request_id: Uuid,
        outcome: ReplyOutcome,
    },

    /// Either direction, every heartbeat interval.
    Heartbeat { sent_at: chrono::DateTime<chrono::Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventKind {
    BreakerChanged {
        breaker_id: String,
        new_state: BreakerState,
    },
    LocalAlarm {
        code: String,
        details: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    SboOperate {
        breaker_id: String,
        action: BreakerAction,
    },
    Isolate,
    Block { client_ip: std::net::IpAddr },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ReplyOutcome {
    SboOperated {
        result: OperateResult,
        new_breaker_state: BreakerState,
        response_time_ms: u64,
    },
    Isolated,
    Blocked,
    Pong,
    Error { message: String },
}

/// Close code sent when a second control-channel supersedes the first
/// (spec.md §4.1: "the older is closed with code `Superseded`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseCode {
    Superseded,
    ShuttingDown,
}

/// Encode a frame as a length-prefixed byte buffer ready to write to a
/// socket.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(frame)?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a single frame body (the part after the length header has
/// already been read and validated against [`MAX_FRAME_BYTES`]).
pub fn decode(body: &[u8]) -> Result<Frame, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Writes one length-prefixed frame. Shared by both ends of the control
/// channel (spec.md §6.3) so the wire format can't drift between them.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    let bytes = encode(frame).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await
}

/// Reads one length-prefixed frame. `Ok(None)` on a clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds MAX_FRAME_BYTES"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// One in-flight request awaiting its correlated `Reply` frame.
pub struct PendingCommand {
    pub command: Command,
    pub reply_tx: oneshot::Sender<ReplyOutcome>,
}

/// Routes commands to whichever task owns a node's live control-channel.
/// Registered by the control-channel writer on connect, deregistered on
/// disconnect; the coordinator and security engine only ever see this
/// handle, never the socket itself.
#[derive(Clone, Default)]
pub struct CommandDispatch {
    channels: Arc<RwLock<HashMap<String, mpsc::Sender<PendingCommand>>>>,
}

impl CommandDispatch {
    pub async fn register(&self, node_id: String, sender: mpsc::Sender<PendingCommand>) {
        self.channels.write().await.insert(node_id, sender);
    }

    pub async fn unregister(&self, node_id: &str) {
        self.channels.write().await.remove(node_id);
    }

    /// Sends `command` to `node_id` and awaits its reply, bounded by
    /// `timeout` (spec.md §5: "command RPC 2 s").
    pub async fn send(&self, node_id: &str, command: Command, timeout: Duration) -> GridResult<ReplyOutcome> {
        let sender = self
            .channels
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| GridError::Unavailable(node_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(PendingCommand { command, reply_tx })
            .await
            .map_err(|_| GridError::Unavailable(node_id.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(GridError::Unavailable(node_id.to_string())),
            Err(_) => Err(GridError::Timeout(node_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrips_heartbeat() {
        let frame = Frame::Heartbeat { sent_at: chrono::Utc::now() };
        let bytes = encode(&frame).unwrap();
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);
        let decoded = decode(&bytes[4..]).unwrap();
        assert!(matches!(decoded, Frame::Heartbeat { .. }));
    }

    #[test]
    fn command_tag_survives_roundtrip() {
        let frame = Frame::Command {
            request_id: Uuid::new_v4(),
            command: Command::SboOperate {
                breaker_id: "BRK-01".into(),
                action: BreakerAction::Open,
            },
        };
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes[4..]).unwrap();
        match decoded {
            Frame::Command { command: Command::SboOperate { breaker_id, action }, .. } => {
                assert_eq!(breaker_id, "BRK-01");
                assert_eq!(action, BreakerAction::Open);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_node_is_unavailable() {
        let dispatch = CommandDispatch::default();
        let err = dispatch
            .send("GEN-001", Command::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Unavailable(_)));
    }

    #[tokio::test]
    async fn reply_is_delivered_to_caller() {
        let dispatch = CommandDispatch::default();
        let (tx, mut rx) = mpsc::channel(1);
        dispatch.register("GEN-001".to_string(), tx).await;

        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            pending.reply_tx.send(ReplyOutcome::Pong).unwrap();
        });

        let outcome = dispatch
            .send("GEN-001", Command::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ReplyOutcome::Pong));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn reply_timeout_surfaces_as_timeout_error() {
        let dispatch = CommandDispatch::default();
        let (tx, _rx) = mpsc::channel(1);
        dispatch.register("GEN-001".to_string(), tx).await;

        let err = dispatch
            .send("GEN-001", Command::Ping, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::Timeout(_)));
    }
}
