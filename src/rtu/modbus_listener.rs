//! Modbus TCP listener (spec.md §4.1, §4.6). Serves the node's registers
//! read-only to anyone, and applies writes only from an `Authorised`
//! client; classification happens once at accept time.

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tracing::{info, warn};

use crate::model::security::{ConnectionRecord, ConnectionStatus, Protocol};

use super::sampler::{RegisterBank, REG_BREAKER_STATE};
use super::state::RtuState;

#[derive(Clone)]
struct NodeModbusService {
    state: Arc<RtuState>,
    registers: Arc<RegisterBank>,
    authorised: bool,
}

impl tokio_modbus::server::Service for NodeModbusService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req.request))
    }
}

impl NodeModbusService {
    fn handle(&self, request: Request<'static>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadHoldingRegisters(addr, cnt) | Request::ReadInputRegisters(addr, cnt) => {
                let values = self.registers.read(addr, cnt).ok_or(ExceptionCode::IllegalDataAddress)?;
                Ok(Response::ReadHoldingRegisters(values))
            }
            Request::WriteSingleRegister(addr, value) => {
                if !self.authorised {
                    return Err(ExceptionCode::IllegalFunction);
                }
                if addr as usize != REG_BREAKER_STATE {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                let breaker_id = super::sampler::primary_breaker_id(self.state.descriptor.kind).to_string();
                let new_state = if value == 0 {
                    crate::model::node::BreakerState::Open
                } else {
                    crate::model::node::BreakerState::Closed
                };
                let state = Arc::clone(&self.state);
                tokio::spawn(async move { state.set_breaker(&breaker_id, new_state).await });
                Ok(Response::WriteSingleRegister(addr, value))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

pub async fn run(
    bind_addr: SocketAddr,
    state: Arc<RtuState>,
    registers: Arc<RegisterBank>,
    connection_reports: mpsc::Sender<ConnectionRecord>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "modbus listener bound");
    let server = Server::new(listener);

    let on_connected = |stream, socket_addr: SocketAddr| {
        let state = Arc::clone(&state);
        let registers = Arc::clone(&registers);
        let connection_reports = connection_reports.clone();
        async move {
            let status = state.classify(socket_addr.ip(), Protocol::Modbus).await;
            let _ = connection_reports
                .send(ConnectionRecord {
                    node_id: state.descriptor.node_id.clone(),
                    client_ip: socket_addr.ip(),
                    client_port: socket_addr.port(),
                    protocol: Protocol::Modbus,
                    status,
                    connected_at: chrono::Utc::now(),
                    disconnected_at: None,
                    requests_count: 0,
                    bytes_in: 0,
                    bytes_out: 0,
                })
                .await;

            let authorised = matches!(status, ConnectionStatus::Authorised);
            let new_service = move |_socket_addr: SocketAddr| {
                Ok(Some(NodeModbusService { state: Arc::clone(&state), registers: Arc::clone(&registers), authorised }))
            };
            accept_tcp_connection(stream, socket_addr, new_service)
        }
    };
    let on_process_error = |err: std::io::Error| warn!(error = %err, "modbus connection error");

    server.serve(&on_connected, on_process_error).await
}
