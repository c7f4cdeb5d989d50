//! Configuration and node catalogue loading (spec.md §4.11, §6.5).
//!
//! The node catalogue is a static TOML file loaded once at startup; the
//! rest of the settings follow the teacher's `Config::from_env` shape,
//! mixing required and optional environment variables.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::node::NodeDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeCatalogue {
    pub node: Vec<NodeDescriptor>,
}

impl NodeCatalogue {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading node catalogue at {:?}", path.as_ref()))?;
        let catalogue: NodeCatalogue =
            toml::from_str(&raw).context("parsing node catalogue TOML")?;
        Ok(catalogue)
    }

    pub fn find(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.node.iter().find(|n| n.node_id == node_id)
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub environment: String,
    pub catalogue_path: String,
    pub historian: HistorianConfig,
    pub auth: AuthConfig,
    pub http_port: u16,
    pub ws_port: u16,
    pub control_port: u16,
    pub metrics_port: u16,
    pub aggregator: AggregatorConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone)]
pub struct HistorianConfig {
    pub url: String,
    pub max_connections: u32,
    pub flush_interval_ms: u64,
    pub flush_max_rows: usize,
    pub spillover_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_lifetime_secs: i64,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub tick_ms: u64,
    pub keepalive_ms: u64,
    pub ring_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub degraded_after_secs: u64,
    pub offline_after_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            degraded_after_secs: 15,
            offline_after_secs: 60,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            catalogue_path: env::var("NODE_CATALOGUE_PATH")
                .unwrap_or_else(|_| "config/nodes.toml".to_string()),
            historian: HistorianConfig {
                url: env::var("HISTORIAN_DATABASE_URL")
                    .expect("HISTORIAN_DATABASE_URL must be set"),
                max_connections: env::var("HISTORIAN_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
                flush_interval_ms: env::var("HISTORIAN_FLUSH_INTERVAL_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
                flush_max_rows: env::var("HISTORIAN_FLUSH_MAX_ROWS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()?,
                spillover_capacity: env::var("HISTORIAN_SPILLOVER_CAPACITY")
                    .unwrap_or_else(|_| "100000".to_string())
                    .parse()?,
            },
            auth: AuthConfig {
                jwt_secret: env::var("JWT_SECRET")
                    .unwrap_or_else(|_| "development-only-insecure-secret".to_string()),
                token_lifetime_secs: env::var("TOKEN_LIFETIME_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()?,
            },
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "9000".to_string())
                .parse()?,
            ws_port: env::var("WS_PORT")
                .unwrap_or_else(|_| "9001".to_string())
                .parse()?,
            control_port: env::var("CONTROL_PORT")
                .unwrap_or_else(|_| "9500".to_string())
                .parse()?,
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()?,
            aggregator: AggregatorConfig {
                tick_ms: env::var("AGGREGATOR_TICK_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()?,
                keepalive_ms: env::var("AGGREGATOR_KEEPALIVE_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()?,
                ring_capacity: env::var("TELEMETRY_RING_CAPACITY")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()?,
            },
            heartbeat: HeartbeatConfig::default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub node_id: String,
    pub catalogue_path: String,
    pub master_control_addr: String,
    pub sample_rate_hz: f64,
}

impl RtuConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            node_id: env::var("NODE_ID").expect("NODE_ID must be set"),
            catalogue_path: env::var("NODE_CATALOGUE_PATH")
                .unwrap_or_else(|_| "config/nodes.toml".to_string()),
            master_control_addr: env::var("MASTER_CONTROL_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:9500".to_string()),
            sample_rate_hz: env::var("SAMPLE_RATE_HZ")
                .unwrap_or_else(|_| "1.0".to_string())
                .parse()?,
        })
    }
}
