//! RTU-side runtime: one process per grid node, simulating local
//! electrical state and presenting it over three surfaces (spec.md §4.1):
//! an outbound control channel to the Master, and inbound Modbus / IEC104
//! listeners for field-protocol clients.

pub mod control_channel;
pub mod iec104_listener;
pub mod modbus_listener;
pub mod sampler;
pub mod state;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{NodeCatalogue, RtuConfig};

use control_channel::{ControlChannel, OutboundBuffer};
use sampler::RegisterBank;
use state::RtuState;

const CONNECTION_REPORT_BUFFER: usize = 256;
const OUTBOUND_SAMPLE_CAPACITY: usize = 3600;

/// Runs a single node's RTU process until `cancel` fires. Spawns the
/// sampler, the outbound control channel, and both field-protocol
/// listeners, then waits for all of them.
pub async fn run(config: RtuConfig, cancel: CancellationToken) -> Result<()> {
    let catalogue = NodeCatalogue::load(&config.catalogue_path).context("loading node catalogue")?;
    let descriptor = catalogue
        .find(&config.node_id)
        .cloned()
        .with_context(|| format!("node {} not present in catalogue", config.node_id))?;

    let master_ip: IpAddr = config
        .master_control_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&config.master_control_addr)
        .parse()
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    let state = Arc::new(RtuState::new(descriptor.clone(), &catalogue, master_ip));
    let registers = Arc::new(RegisterBank::new());
    let outbound = Arc::new(OutboundBuffer::new(OUTBOUND_SAMPLE_CAPACITY));

    let (report_tx, report_rx) = mpsc::channel(CONNECTION_REPORT_BUFFER);

    let modbus_addr = format!("0.0.0.0:{}", descriptor.modbus_port).parse()?;
    let iec104_addr = format!("0.0.0.0:{}", descriptor.iec104_port).parse()?;

    let modbus_task = tokio::spawn(modbus_listener::run(
        modbus_addr,
        Arc::clone(&state),
        Arc::clone(&registers),
        report_tx.clone(),
    ));
    let iec104_task = tokio::spawn(iec104_listener::run(iec104_addr, Arc::clone(&state), report_tx));

    let sampler_cancel = cancel.clone();
    let sampler_task = tokio::spawn(sampler::run(
        Arc::clone(&state),
        Arc::clone(&registers),
        Arc::clone(&outbound),
        config.sample_rate_hz,
        sampler_cancel,
    ));

    let channel = Arc::new(ControlChannel::new(config.master_control_addr.clone(), Arc::clone(&state), outbound));
    let channel_cancel = cancel.clone();
    let channel_task = tokio::spawn(channel.run(report_rx, channel_cancel));

    info!(node_id = %config.node_id, "rtu process started");

    cancel.cancelled().await;
    info!(node_id = %config.node_id, "rtu process shutting down");

    sampler_task.abort();
    modbus_task.abort();
    iec104_task.abort();
    let _ = channel_task.await;

    Ok(())
}
