//! IEC 60870-5-104 listener (spec.md §4.1 design note: "do not over-invest
//! in protocol fidelity" — this accepts, classifies, and reads until the
//! peer closes, without interpreting APDUs).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::security::{ConnectionRecord, Protocol};

use super::state::RtuState;

pub async fn run(
    bind_addr: SocketAddr,
    state: Arc<RtuState>,
    connection_reports: mpsc::Sender<ConnectionRecord>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "iec104 listener bound");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        let connection_reports = connection_reports.clone();

        tokio::spawn(async move {
            let status = state.classify(peer.ip(), Protocol::Iec104).await;
            let connected_at = chrono::Utc::now();
            let _ = connection_reports
                .send(ConnectionRecord {
                    node_id: state.descriptor.node_id.clone(),
                    client_ip: peer.ip(),
                    client_port: peer.port(),
                    protocol: Protocol::Iec104,
                    status,
                    connected_at,
                    disconnected_at: None,
                    requests_count: 0,
                    bytes_in: 0,
                    bytes_out: 0,
                })
                .await;

            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            info!(peer = %peer, "iec104 connection closed");
        });
    }
}
