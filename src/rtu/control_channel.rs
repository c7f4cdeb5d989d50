//! Outbound control channel: the RTU's single persistent TCP connection to
//! the Master (spec.md §4.1, §6.3). Handles the Hello handshake, drains
//! telemetry/events onto the wire, and answers `Command` frames.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::control::{BreakerAction, OperateResult};
use crate::model::node::BreakerState;
use crate::model::security::ConnectionRecord;
use crate::model::telemetry::TelemetrySample;
use crate::protocol::{read_frame, write_frame, Command, Frame, ReplyOutcome};
use crate::registry::full_jitter_backoff;

use super::state::RtuState;

/// Bounded, drop-oldest buffer of samples awaiting delivery. Filled by the
/// sampler, drained by the writer half of the control channel; survives a
/// reconnect so nothing is lost beyond the buffer's depth (spec.md §4.1).
pub struct OutboundBuffer {
    samples: Mutex<VecDeque<TelemetrySample>>,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { samples: Mutex::new(VecDeque::with_capacity(capacity.min(4096))), capacity }
    }

    pub async fn push(&self, sample: TelemetrySample) {
        let mut samples = self.samples.lock().await;
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    async fn drain(&self) -> Vec<TelemetrySample> {
        let mut samples = self.samples.lock().await;
        samples.drain(..).collect()
    }
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct ControlChannel {
    master_addr: String,
    state: Arc<RtuState>,
    outbound: Arc<OutboundBuffer>,
}

impl ControlChannel {
    pub fn new(master_addr: String, state: Arc<RtuState>, outbound: Arc<OutboundBuffer>) -> Self {
        Self { master_addr, state, outbound }
    }

    /// Dials, handshakes, and serves the connection until it drops or
    /// `cancel` fires, then backs off and retries. Runs forever.
    pub async fn run(self: Arc<Self>, mut connection_reports: mpsc::Receiver<ConnectionRecord>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.connect_and_serve(&mut connection_reports, &cancel).await {
                Ok(()) => {
                    info!(node_id = %self.state.descriptor.node_id, "control channel closed cleanly");
                    if cancel.is_cancelled() {
                        return;
                    }
                    attempt = 0;
                }
                Err(err) => {
                    warn!(node_id = %self.state.descriptor.node_id, error = %err, "control channel dropped");
                }
            }

            attempt += 1;
            let backoff = full_jitter_backoff(attempt, 1000, 60_000);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn connect_and_serve(
        &self,
        connection_reports: &mut mpsc::Receiver<ConnectionRecord>,
        cancel: &CancellationToken,
    ) -> std::io::Result<()> {
        let stream = TcpStream::connect(&self.master_addr).await?;
        stream.set_nodelay(true).ok();
        let (mut reader, mut writer) = stream.into_split();

        let breakers: Vec<(String, BreakerState)> =
            self.state.breakers.read().await.iter().map(|(k, v)| (k.clone(), *v)).collect();
        write_frame(&mut writer, &Frame::Hello {
            node_id: self.state.descriptor.node_id.clone(),
            descriptor: self.state.descriptor.clone(),
            breakers,
        })
        .await?;
        info!(node_id = %self.state.descriptor.node_id, addr = %self.master_addr, "control channel connected");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut drain_tick = tokio::time::interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    write_frame(&mut writer, &Frame::Heartbeat { sent_at: chrono::Utc::now() }).await?;
                }
                _ = drain_tick.tick() => {
                    for sample in self.outbound.drain().await {
                        write_frame(&mut writer, &Frame::Telemetry { sample }).await?;
                    }
                }
                record = connection_reports.recv() => {
                    if let Some(record) = record {
                        write_frame(&mut writer, &Frame::ConnectionReport { record }).await?;
                    }
                }
                frame = read_frame(&mut reader) => {
                    match frame? {
                        None => return Ok(()),
                        Some(Frame::Command { request_id, command }) => {
                            let outcome = self.execute(command).await;
                            write_frame(&mut writer, &Frame::Reply { request_id, outcome }).await?;
                        }
                        Some(other) => {
                            warn!(node_id = %self.state.descriptor.node_id, frame = ?other, "unexpected frame from master");
                        }
                    }
                }
            }
        }
    }

    async fn execute(&self, command: Command) -> ReplyOutcome {
        match command {
            Command::Ping => ReplyOutcome::Pong,
            Command::Isolate => {
                self.state.isolate().await;
                ReplyOutcome::Isolated
            }
            Command::Block { client_ip } => {
                self.state.block(client_ip).await;
                ReplyOutcome::Blocked
            }
            Command::SboOperate { breaker_id, action } => {
                let new_state = match action {
                    BreakerAction::Open => BreakerState::Open,
                    BreakerAction::Close => BreakerState::Closed,
                };
                self.state.set_breaker(&breaker_id, new_state).await;
                ReplyOutcome::SboOperated {
                    result: OperateResult::Success,
                    new_breaker_state: new_state,
                    response_time_ms: 0,
                }
            }
        }
    }
}
