//! Prometheus metrics for the Master (ambient observability; not one of
//! the spec's §1 non-goals since those only scope out *functionality*).

use std::net::SocketAddr;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref NODES_ONLINE: Gauge =
        register_gauge!("scada_nodes_online", "Number of nodes with link_state Connected or Degraded").unwrap();

    pub static ref NODES_OFFLINE: Gauge =
        register_gauge!("scada_nodes_offline", "Number of nodes with link_state Offline").unwrap();

    pub static ref ACTIVE_ALARMS: GaugeVec = register_gauge_vec!(
        "scada_active_alarms",
        "Currently active alarms by severity",
        &["severity"]
    )
    .unwrap();

    pub static ref SBO_OPERATIONS: CounterVec = register_counter_vec!(
        "scada_sbo_operations_total",
        "Select-before-operate outcomes",
        &["result"]
    )
    .unwrap();

    pub static ref COMMAND_RPC_LATENCY: HistogramVec = register_histogram_vec!(
        "scada_command_rpc_duration_seconds",
        "Round-trip latency of Master -> RTU commands",
        &["command"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]
    )
    .unwrap();

    pub static ref HISTORIAN_SPILL_LOSS: Gauge = register_gauge!(
        "scada_historian_spill_loss_total",
        "Rows dropped from the historian spillover buffer"
    )
    .unwrap();

    pub static ref FANOUT_SUBSCRIBERS: Gauge =
        register_gauge!("scada_fanout_subscribers", "Currently connected dashboard subscribers").unwrap();

    pub static ref UNKNOWN_CONNECTIONS: CounterVec = register_counter_vec!(
        "scada_unknown_connections_total",
        "Unknown (non-allow-listed) connection attempts",
        &["node_id", "protocol"]
    )
    .unwrap();
}

pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
