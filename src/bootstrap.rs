//! Master process wiring (spec.md §4.12). Builds every component in
//! dependency order, opens the external surfaces last, and on a shutdown
//! signal tears them down in reverse.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alarm_engine::AlarmEngine;
use crate::auth::AuthGate;
use crate::bus::FanOutBus;
use crate::config::{MasterConfig, NodeCatalogue};
use crate::control_coordinator::ControlCoordinator;
use crate::historian::HistorianSink;
use crate::master_link;
use crate::metrics::MetricsServer;
use crate::model::security::Protocol;
use crate::model::user::{Role, User};
use crate::protocol::CommandDispatch;
use crate::registry::{run_stale_sweeper, NodeRegistry};
use crate::security_engine::SecurityEngine;
use crate::telemetry_store::Aggregator;

/// Built-in accounts (spec.md §4.7 doesn't specify a user store; this seeds
/// one account per role so the permission matrix is exercisable out of the
/// box). Real deployments would load these from a users table instead.
fn seed_users() -> Result<HashMap<String, User>> {
    let mut users = HashMap::new();
    for (username, role, password) in [
        ("admin", Role::Admin, "admin-default-change-me"),
        ("engineer", Role::Engineer, "engineer-default-change-me"),
        ("operator", Role::Operator, "operator-default-change-me"),
        ("viewer", Role::Viewer, "viewer-default-change-me"),
    ] {
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                role,
                password_hash: AuthGate::hash_password(password)?,
                failed_attempts: std::collections::VecDeque::new(),
                locked_until: None,
            },
        );
    }
    Ok(users)
}

fn default_allow_list(catalogue: &NodeCatalogue) -> std::collections::HashSet<(IpAddr, Protocol)> {
    let mut allow_list = std::collections::HashSet::new();
    for node in &catalogue.node {
        if let Ok(ip) = node.node_ip.parse::<IpAddr>() {
            for protocol in [Protocol::Rest, Protocol::WebSocket, Protocol::Modbus, Protocol::Iec104] {
                allow_list.insert((ip, protocol));
            }
        }
    }
    allow_list
}

pub async fn run(config: MasterConfig) -> Result<()> {
    let catalogue = NodeCatalogue::load(&config.catalogue_path)?;
    info!(environment = %config.environment, nodes = catalogue.node.len(), "loaded node catalogue");

    let (historian_sink, historian) = HistorianSink::connect(config.historian.clone()).await?;
    let historian_sink = Arc::new(historian_sink);
    info!("connected to historian store");

    let bus = FanOutBus::new();
    let dispatch = CommandDispatch::default();

    let registry = Arc::new(NodeRegistry::from_catalogue(&catalogue, config.aggregator.ring_capacity, config.heartbeat.clone()));
    let alarms = Arc::new(AlarmEngine::new(bus.clone(), historian.clone()));
    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&registry),
        Arc::clone(&alarms),
        bus.clone(),
        historian.clone(),
        config.aggregator.tick_ms,
        config.aggregator.keepalive_ms,
    ));
    let security = Arc::new(SecurityEngine::new(default_allow_list(&catalogue), bus.clone(), historian.clone(), dispatch.clone()));
    let coordinator = Arc::new(ControlCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&alarms),
        dispatch.clone(),
        bus.clone(),
        historian.clone(),
    ));
    let users = seed_users()?;
    let auth = Arc::new(AuthGate::new(users, config.auth.jwt_secret.clone(), config.auth.token_lifetime_secs, bus.clone(), historian.clone()));

    let cancel = CancellationToken::new();

    let historian_task = {
        let sink = Arc::clone(&historian_sink);
        let cancel = cancel.clone();
        tokio::spawn(async move { sink.run(cancel).await })
    };
    let sweeper_task = tokio::spawn(run_stale_sweeper(Arc::clone(&registry), cancel.clone()));
    let aggregator_task = {
        let aggregator = Arc::clone(&aggregator);
        let cancel = cancel.clone();
        tokio::spawn(async move { aggregator.run(cancel).await })
    };
    let expiry_task = {
        let coordinator = Arc::clone(&coordinator);
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run_expiry_sweeper(cancel).await })
    };

    let control_link_addr: std::net::SocketAddr = ("0.0.0.0", config.control_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve control channel bind address"))?;
    let control_link_task = {
        let registry = Arc::clone(&registry);
        let alarms = Arc::clone(&alarms);
        let security = Arc::clone(&security);
        let dispatch = dispatch.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = master_link::run(control_link_addr, registry, alarms, security, dispatch, cancel).await {
                error!(error = %err, "control channel listener error");
            }
        })
    };
    info!(port = config.control_port, "control channel listening");

    let metrics_server = MetricsServer::new(config.metrics_port);
    tokio::spawn(async move {
        if let Err(err) = metrics_server.serve().await {
            error!(error = %err, "metrics server error");
        }
    });
    info!(port = config.metrics_port, "metrics server listening");

    let state = crate::http::AppState {
        registry: Arc::clone(&registry),
        alarms: Arc::clone(&alarms),
        coordinator: Arc::clone(&coordinator),
        security: Arc::clone(&security),
        auth: Arc::clone(&auth),
        aggregator: Arc::clone(&aggregator),
        bus: bus.clone(),
        historian: historian.clone(),
        historian_sink: Arc::clone(&historian_sink),
    };
    let router = crate::http::build_router(state.clone());
    let http_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    let http_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(http_listener, router).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "http server error");
            }
        })
    };
    info!(port = config.http_port, "http surface listening");

    let ws_router = crate::http::build_ws_router(state);
    let ws_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.ws_port)).await?;
    let ws_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let serve = axum::serve(ws_listener, ws_router).with_graceful_shutdown(async move {
                cancel.cancelled().await;
            });
            if let Err(err) = serve.await {
                error!(error = %err, "websocket server error");
            }
        })
    };
    info!(port = config.ws_port, "websocket surface listening");

    info!("master ready, awaiting shutdown signal");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    cancel.cancel();
    registry.broadcast_close().await;

    let _ = http_task.await;
    let _ = ws_task.await;
    let _ = control_link_task.await;
    let _ = sweeper_task.await;
    let _ = aggregator_task.await;
    let _ = expiry_task.await;

    tokio::time::timeout(std::time::Duration::from_secs(5), historian_task)
        .await
        .map_err(|_| anyhow::anyhow!("historian did not drain within its shutdown grace"))??;

    info!("master stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received");
        }
    }
}
