//! Master-side control-channel acceptor (spec.md §4.1, §4.2, §6.3).
//!
//! Each RTU dials this listener once and keeps the connection open for the
//! lifetime of the process (see `rtu::control_channel`). This module accepts
//! those connections, reads the `Hello` handshake to learn which node the
//! socket belongs to, then drives the registry/alarm/security state from
//! every frame the RTU sends and forwards outbound `Command`s registered
//! through [`CommandDispatch`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alarm_engine::AlarmEngine;
use crate::model::node::BreakerState;
use crate::protocol::{read_frame, write_frame, CommandDispatch, EventKind, Frame, PendingCommand, ReplyOutcome};
use crate::registry::NodeRegistry;
use crate::security_engine::SecurityEngine;

/// Accepts control-channel connections until `cancel` fires. One task per
/// connection; the acceptor itself never blocks on a slow RTU.
pub async fn run(
    bind_addr: SocketAddr,
    registry: Arc<NodeRegistry>,
    alarms: Arc<AlarmEngine>,
    security: Arc<SecurityEngine>,
    dispatch: CommandDispatch,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "control channel listener bound");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let registry = Arc::clone(&registry);
                let alarms = Arc::clone(&alarms);
                let security = Arc::clone(&security);
                let dispatch = dispatch.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_node(stream, &registry, &alarms, &security, &dispatch, cancel).await {
                        warn!(peer = %peer, error = %err, "control channel connection ended");
                    }
                });
            }
        }
    }
}

async fn serve_node(
    stream: TcpStream,
    registry: &Arc<NodeRegistry>,
    alarms: &Arc<AlarmEngine>,
    security: &Arc<SecurityEngine>,
    dispatch: &CommandDispatch,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();

    let node_id = match read_frame(&mut reader).await? {
        Some(Frame::Hello { node_id, breakers, .. }) => {
            for (breaker_id, state) in breakers {
                registry.set_breaker(&node_id, &breaker_id, state).await;
            }
            node_id
        }
        Some(other) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected Hello as the first frame, got {other:?}"),
            ))
        }
        None => return Ok(()),
    };

    info!(node_id, "control channel accepted");
    registry.on_connected(&node_id).await;

    let (command_tx, mut command_rx) = tokio::sync::mpsc::channel::<PendingCommand>(32);
    dispatch.register(node_id.clone(), command_tx).await;

    let result = serve_frames(&node_id, &mut reader, &mut writer, &mut command_rx, registry, alarms, security, &cancel).await;

    dispatch.unregister(&node_id).await;
    registry.on_disconnected(&node_id).await;
    info!(node_id, "control channel closed");
    result
}

#[allow(clippy::too_many_arguments)]
async fn serve_frames(
    node_id: &str,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    command_rx: &mut tokio::sync::mpsc::Receiver<PendingCommand>,
    registry: &Arc<NodeRegistry>,
    alarms: &Arc<AlarmEngine>,
    security: &Arc<SecurityEngine>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut awaiting: HashMap<Uuid, oneshot::Sender<ReplyOutcome>> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            pending = command_rx.recv() => {
                let Some(PendingCommand { command, reply_tx }) = pending else { return Ok(()) };
                let request_id = Uuid::new_v4();
                awaiting.insert(request_id, reply_tx);
                write_frame(writer, &Frame::Command { request_id, command }).await?;
            }
            frame = read_frame(reader) => {
                match frame? {
                    None => return Ok(()),
                    Some(Frame::Heartbeat { .. }) => {
                        registry.on_heartbeat(node_id).await;
                    }
                    Some(Frame::Telemetry { sample }) => {
                        if let Ok(record) = registry.get_node(node_id).await {
                            alarms
                                .evaluate_telemetry(record.descriptor.kind, record.descriptor.nominal_voltage_kv, &sample)
                                .await;
                        }
                        registry.on_telemetry(sample).await;
                    }
                    Some(Frame::ConnectionReport { record }) => {
                        security.record_connection(record).await;
                    }
                    Some(Frame::Reply { request_id, outcome }) => {
                        if let Some(reply_tx) = awaiting.remove(&request_id) {
                            let _ = reply_tx.send(outcome);
                        }
                    }
                    Some(Frame::Event { node_id: event_node_id, kind }) => {
                        handle_event(&event_node_id, kind, registry, alarms).await;
                    }
                    Some(Frame::Snapshot { node_id: snap_node_id, latest_sample, breakers }) => {
                        if let Some(sample) = latest_sample {
                            registry.on_telemetry(sample).await;
                        }
                        for (breaker_id, state) in breakers {
                            registry.set_breaker(&snap_node_id, &breaker_id, state).await;
                        }
                    }
                    Some(other @ (Frame::Hello { .. } | Frame::Command { .. })) => {
                        warn!(node_id, frame = ?other, "unexpected frame from rtu");
                    }
                }
            }
        }
    }
}

async fn handle_event(node_id: &str, kind: EventKind, registry: &Arc<NodeRegistry>, alarms: &Arc<AlarmEngine>) {
    match kind {
        EventKind::BreakerChanged { breaker_id, new_state } => {
            registry.set_breaker(node_id, &breaker_id, new_state).await;
            if new_state == BreakerState::Tripped {
                alarms.report_breaker_tripped(node_id, &breaker_id).await;
            }
        }
        EventKind::LocalAlarm { code, details } => {
            warn!(node_id, code, details = %details, "local alarm reported by rtu");
        }
    }
}
