//! REST handlers for the Master's external surface (spec.md §6.1).

use std::net::IpAddr;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{GridError, GridResult};
use crate::model::control::BreakerAction;
use crate::model::user::Permission;

use super::state::AppState;

fn bearer_token(headers: &HeaderMap) -> GridResult<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| GridError::AuthFailure("missing bearer token".to_string()))
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    nodes_connected: u32,
    nodes_offline: u32,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.aggregator.latest().await;
    let (connected, offline) = snapshot
        .map(|s| (s.nodes_online, s.nodes_offline))
        .unwrap_or((0, 0));
    Json(HealthResponse { status: "healthy", nodes_connected: connected, nodes_offline: offline })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
}

pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, GridError> {
    let ip: Option<IpAddr> = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let result = state.auth.login(&body.username, &body.password, ip).await?;
    Ok(Json(LoginResponse { access_token: result.access_token, token_type: "bearer", expires_in: result.expires_in }))
}

pub async fn grid_overview(State(state): State<AppState>, headers: HeaderMap) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ReadGrid, "grid.read", "grid").await?;
    let snapshot = state.aggregator.compute().await;
    Ok(Json(snapshot))
}

pub async fn list_nodes(State(state): State<AppState>, headers: HeaderMap) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ReadNodes, "nodes.read", "nodes").await?;
    Ok(Json(state.registry.list_nodes().await))
}

#[derive(Serialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    summary: crate::model::node::NodeSummary,
    latest_sample: Option<crate::model::telemetry::TelemetrySample>,
}

pub async fn get_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ReadNodes, "nodes.read", &node_id).await?;
    let record = state.registry.get_node(&node_id).await?;
    Ok(Json(NodeDetail { summary: record.summary(), latest_sample: record.latest_sample }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

pub async fn node_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Query(query): Query<TelemetryQuery>,
) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ReadHistorian, "telemetry.read", &node_id).await?;
    let record = state.registry.get_node(&node_id).await?;
    let limit = query.limit.unwrap_or(1000);
    Ok(Json(record.ring.query(query.from, query.to, limit)))
}

pub async fn active_alarms(State(state): State<AppState>, headers: HeaderMap) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ReadAlarms, "alarms.read", "alarms").await?;
    Ok(Json(state.alarms.active_alarms().await))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcknowledgeRequest {
    operator_id: String,
    #[allow(dead_code)]
    comment: Option<String>,
}

pub async fn acknowledge_alarm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(alarm_id): Path<Uuid>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<StatusCode, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::AcknowledgeAlarm, "alarms.acknowledge", &alarm_id.to_string()).await?;
    match state.alarms.acknowledge_by_id(alarm_id, &body.operator_id).await {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(GridError::Conflict("alarm already cleared or unknown".to_string())),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectRequest {
    node_id: String,
    breaker_id: String,
    action: BreakerAction,
    operator_id: String,
    reason: String,
}

#[derive(Serialize)]
pub struct SelectResponse {
    session_id: Uuid,
    expires_at: DateTime<Utc>,
    time_remaining_s: f64,
}

pub async fn select_breaker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SelectRequest>,
) -> Result<Json<SelectResponse>, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ControlBreaker, "sbo.select", &body.node_id).await?;
    let outcome = state
        .coordinator
        .select(&body.node_id, &body.breaker_id, body.action, &body.operator_id, &body.reason)
        .await?;
    Ok(Json(SelectResponse {
        session_id: outcome.session_id,
        expires_at: outcome.expires_at,
        time_remaining_s: outcome.time_remaining_s,
    }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperateRequest {
    session_id: Uuid,
    operator_id: String,
}

#[derive(Serialize)]
pub struct OperateResponse {
    result: crate::model::control::OperateResult,
    new_breaker_state: crate::model::node::BreakerState,
    response_time_ms: u64,
}

pub async fn operate_breaker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<OperateRequest>,
) -> Result<Json<OperateResponse>, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ControlBreaker, "sbo.operate", &body.session_id.to_string()).await?;
    let outcome = state.coordinator.operate(body.session_id, &body.operator_id).await?;
    Ok(Json(OperateResponse {
        result: outcome.result,
        new_breaker_state: outcome.new_breaker_state,
        response_time_ms: outcome.response_time_ms,
    }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelRequest {
    session_id: Uuid,
}

pub async fn cancel_breaker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CancelRequest>,
) -> Result<StatusCode, GridError> {
    let token = bearer_token(&headers)?;
    let claims = state.auth.authorise(&token, Permission::ControlBreaker, "sbo.cancel", &body.session_id.to_string()).await?;
    state.coordinator.cancel(body.session_id, &claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolateRequest {
    operator_id: String,
    #[allow(dead_code)]
    reason: String,
}

pub async fn isolate_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
    Json(body): Json<IsolateRequest>,
) -> Result<StatusCode, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::IsolateNode, "node.isolate", &node_id).await?;
    state.coordinator.isolate(&node_id, &body.operator_id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn security_connections(State(state): State<AppState>, headers: HeaderMap) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ViewSecurityConsole, "security.read", "connections").await?;
    Ok(Json(state.security.summary().await))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockRequest {
    client_ip: IpAddr,
}

pub async fn security_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BlockRequest>,
) -> Result<StatusCode, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::BlockIp, "security.block", &body.client_ip.to_string()).await?;
    state.security.block(body.client_ip).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditQuery {
    limit: Option<i64>,
}

pub async fn security_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<impl axum::response::IntoResponse, GridError> {
    let token = bearer_token(&headers)?;
    state.auth.authorise(&token, Permission::ViewAuditLog, "audit.read", "audit_log").await?;
    let rows = state
        .historian_sink
        .recent_audit(query.limit.unwrap_or(100))
        .await
        .map_err(GridError::Database)?;
    Ok(Json(rows))
}
