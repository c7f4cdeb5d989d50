//! WebSocket surface for dashboard clients (spec.md §6.2).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bus::BusMessage;
use crate::model::user::Permission;

use super::state::AppState;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.auth.authorise(&query.token, Permission::ReadGrid, "ws.connect", "grid").await {
        Ok(_) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(err) => err.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let grid = state.aggregator.compute().await;
    let nodes = state.registry.list_nodes().await;
    let latest_samples = {
        let mut out = Vec::new();
        for node in &nodes {
            if let Ok(record) = state.registry.get_node(&node.node_id).await {
                if let Some(sample) = record.latest_sample {
                    out.push(sample);
                }
            }
        }
        out
    };
    let open_alarms = state.alarms.active_alarms().await;

    let snapshot = BusMessage::FullStateSnapshot { grid, nodes, latest_samples, open_alarms };
    if send(&mut socket, &snapshot).await.is_err() {
        return;
    }

    let mut subscription = state.bus.subscribe();
    info!("dashboard subscriber connected");

    loop {
        tokio::select! {
            message = subscription.recv() => {
                match message {
                    Some(message) => {
                        if send(&mut socket, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(error = %err, "dashboard socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    info!("dashboard subscriber disconnected");
}

/// Write with a 10 s deadline (spec.md §5). Treated as a slow consumer on
/// timeout; the broadcast-lag path already handles queue overflow, this
/// just bounds a stalled TCP write.
async fn send(socket: &mut WebSocket, message: &BusMessage) -> Result<(), ()> {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(_) => return Err(()),
    };
    match tokio::time::timeout(std::time::Duration::from_secs(10), socket.send(Message::Text(payload))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
