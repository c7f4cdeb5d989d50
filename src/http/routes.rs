//! Router wiring for the Master's HTTP surface (spec.md §6.1).

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;
use super::ws;

/// REST surface, bound to `http_port` (spec.md §6.1, §6.2).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/login", post(handlers::login))
        .route("/grid/overview", get(handlers::grid_overview))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/:id", get(handlers::get_node))
        .route("/nodes/:id/telemetry", get(handlers::node_telemetry))
        .route("/alarms/active", get(handlers::active_alarms))
        .route("/alarms/:id/acknowledge", post(handlers::acknowledge_alarm))
        .route("/control/breaker/select", post(handlers::select_breaker))
        .route("/control/breaker/operate", post(handlers::operate_breaker))
        .route("/control/breaker/cancel", post(handlers::cancel_breaker))
        .route("/control/isolation/:node_id", post(handlers::isolate_node))
        .route("/security/connections", get(handlers::security_connections))
        .route("/security/block", post(handlers::security_block))
        .route("/security/audit", get(handlers::security_audit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// WebSocket surface, bound to `ws_port` on its own listener (spec.md §6.2:
/// the push feed is kept off the REST port so a slow client can't hold up
/// `axum::serve`'s accept loop for everyone else).
pub fn build_ws_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/grid", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
