//! Select-Before-Operate control coordinator (spec.md §4.5).

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alarm_engine::AlarmEngine;
use crate::bus::{BusMessage, FanOutBus};
use crate::errors::{GridError, GridResult};
use crate::historian::{HistorianHandle, HistorianRow};
use crate::model::control::{BreakerAction, OperateResult, SboSession, SboState};
use crate::model::node::{BreakerState, LinkState};
use crate::model::user::{AuditEntry, AuditResult};
use crate::protocol::{Command, CommandDispatch, ReplyOutcome};
use crate::registry::NodeRegistry;
use crate::sharded::Sharded;

/// Bound on the RPC awaiting the RTU's reply (spec.md §5).
const OPERATE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ControlCoordinator {
    sessions: Sharded<(String, String), SboSession>,
    registry: std::sync::Arc<NodeRegistry>,
    alarms: std::sync::Arc<AlarmEngine>,
    dispatch: CommandDispatch,
    bus: FanOutBus,
    historian: HistorianHandle,
}

pub struct SelectOutcome {
    pub session_id: Uuid,
    pub expires_at: chrono::DateTime<Utc>,
    pub time_remaining_s: f64,
}

pub struct OperateOutcomeView {
    pub result: OperateResult,
    pub new_breaker_state: BreakerState,
    pub response_time_ms: u64,
}

impl ControlCoordinator {
    pub fn new(
        registry: std::sync::Arc<NodeRegistry>,
        alarms: std::sync::Arc<AlarmEngine>,
        dispatch: CommandDispatch,
        bus: FanOutBus,
        historian: HistorianHandle,
    ) -> Self {
        Self {
            sessions: Sharded::new(),
            registry,
            alarms,
            dispatch,
            bus,
            historian,
        }
    }

    /// `select(node_id, breaker_id, action, operator, reason)` (spec.md §4.5 step 1).
    pub async fn select(
        &self,
        node_id: &str,
        breaker_id: &str,
        action: BreakerAction,
        operator: &str,
        reason: &str,
    ) -> GridResult<SelectOutcome> {
        let link_state = self.registry.link_state(node_id).await;
        if link_state != Some(LinkState::Connected) {
            return Err(GridError::Unavailable(node_id.to_string()));
        }

        let key = (node_id.to_string(), breaker_id.to_string());
        let session = self
            .sessions
            .with_entry(&key, |table| {
                if let Some(existing) = table.get(&key) {
                    if existing.state == SboState::Armed && !existing.is_expired_at(Utc::now()) {
                        return None;
                    }
                }
                let session = SboSession::arm(
                    operator.to_string(),
                    node_id.to_string(),
                    breaker_id.to_string(),
                    action,
                );
                table.insert(key.clone(), session.clone());
                Some(session)
            })
            .await;

        let Some(session) = session else {
            return Err(GridError::Conflict(format!(
                "breaker {breaker_id} on {node_id} already has an armed selection"
            )));
        };

        info!(node_id, breaker_id, operator, reason, "breaker selection armed");
        self.audit("sbo.select", &format!("{node_id}/{breaker_id}"), operator, AuditResult::Success).await;

        let now = Utc::now();
        Ok(SelectOutcome {
            session_id: session.session_id,
            expires_at: session.deadline,
            time_remaining_s: session.time_remaining_s(now),
        })
    }

    /// `operate(session_id, operator)` (spec.md §4.5 step 2).
    pub async fn operate(&self, session_id: Uuid, operator: &str) -> GridResult<OperateOutcomeView> {
        let Some((key, mut session)) = self.find_session(session_id).await else {
            return Err(GridError::Validation("unknown session".to_string()));
        };

        if session.operator != operator {
            return Err(GridError::PermissionDenied("session armed by a different operator".to_string()));
        }
        if session.state != SboState::Armed {
            return Err(GridError::Conflict("session is not armed".to_string()));
        }
        if session.is_expired_at(Utc::now()) {
            self.sessions.with_entry(&key, |table| {
                if let Some(s) = table.get_mut(&key) {
                    s.expire();
                }
            }).await;
            self.audit("sbo.operate", &format!("{}/{}", key.0, key.1), operator, AuditResult::Failure).await;
            return Err(GridError::Conflict("session expired".to_string()));
        }

        let started = std::time::Instant::now();
        let outcome = self
            .dispatch
            .send(
                &session.node_id,
                Command::SboOperate { breaker_id: session.breaker_id.clone(), action: session.action },
                OPERATE_TIMEOUT,
            )
            .await;

        let (result, new_state, response_time_ms) = match outcome {
            Ok(ReplyOutcome::SboOperated { result, new_breaker_state, response_time_ms }) => {
                (result, new_breaker_state, response_time_ms)
            }
            Ok(_) => (OperateResult::Failure, BreakerState::Tripped, started.elapsed().as_millis() as u64),
            Err(_) => {
                let fallback = match session.action {
                    BreakerAction::Open => BreakerState::Closed,
                    BreakerAction::Close => BreakerState::Open,
                };
                (OperateResult::Failure, fallback, started.elapsed().as_millis() as u64)
            }
        };

        self.sessions.with_entry(&key, |table| {
            if let Some(s) = table.get_mut(&key) {
                s.operate(result);
                session = s.clone();
            }
        }).await;

        self.registry.set_breaker(&session.node_id, &session.breaker_id, new_state).await;

        let audit_result = match result {
            OperateResult::Success => AuditResult::Success,
            OperateResult::Failure => AuditResult::Failure,
        };
        self.audit("sbo.operate", &format!("{}/{}", key.0, key.1), operator, audit_result).await;

        if matches!(result, OperateResult::Failure) {
            warn!(node_id = %session.node_id, breaker_id = %session.breaker_id, "SBO operate failed");
            self.alarms
                .report_control_failure(&session.node_id, &session.breaker_id, "operate command timed out or was rejected")
                .await;
        }

        Ok(OperateOutcomeView { result, new_breaker_state: new_state, response_time_ms })
    }

    pub async fn cancel(&self, session_id: Uuid, operator: &str) -> GridResult<()> {
        let Some((key, _)) = self.find_session(session_id).await else {
            return Err(GridError::Validation("unknown session".to_string()));
        };
        let cancelled = self
            .sessions
            .with_entry(&key, |table| table.get_mut(&key).map(|s| s.cancel()).unwrap_or(false))
            .await;
        self.audit(
            "sbo.cancel",
            &format!("{}/{}", key.0, key.1),
            operator,
            if cancelled { AuditResult::Success } else { AuditResult::Denied },
        )
        .await;
        Ok(())
    }

    /// `POST /control/isolation/{node_id}` (spec.md §6.1): opens every
    /// breaker owned by the node, bypassing SBO (isolation is an
    /// engineer-level emergency action, not a per-breaker command).
    pub async fn isolate(&self, node_id: &str, operator: &str) -> GridResult<()> {
        self.dispatch.send(node_id, Command::Isolate, OPERATE_TIMEOUT).await?;
        self.audit("node.isolate", node_id, operator, AuditResult::Success).await;
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Option<((String, String), SboSession)> {
        for session in self.sessions.snapshot().await {
            if session.session_id == session_id {
                return Some(((session.node_id.clone(), session.breaker_id.clone()), session));
            }
        }
        None
    }

    async fn audit(&self, action: &str, resource: &str, operator: &str, result: AuditResult) {
        let entry = AuditEntry::new(operator, action, resource, result, None);
        self.historian.send(HistorianRow::Audit(entry));
    }

    /// Expiry sweeper (spec.md §4.5: "every 1 s"). Runs until cancelled.
    pub async fn run_expiry_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.expire_stale_sessions().await,
            }
        }
    }

    async fn expire_stale_sessions(&self) {
        let now = Utc::now();
        for mut session in self.sessions.snapshot().await {
            if session.state == SboState::Armed && session.is_expired_at(now) {
                let key = (session.node_id.clone(), session.breaker_id.clone());
                self.sessions
                    .with_entry(&key, |table| {
                        if let Some(s) = table.get_mut(&key) {
                            s.expire();
                        }
                    })
                    .await;
                session.expire();
                self.bus.publish(BusMessage::NodeStateChanged {
                    node_id: session.node_id.clone(),
                    link_state: self.registry.link_state(&session.node_id).await.unwrap_or(LinkState::Offline),
                });
                self.audit("sbo.expire", &format!("{}/{}", key.0, key.1), &session.operator, AuditResult::Success).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, NodeCatalogue};
    use crate::model::node::{NodeDescriptor, NodeKind};
    use tokio::sync::mpsc;

    fn catalogue() -> NodeCatalogue {
        NodeCatalogue {
            node: vec![NodeDescriptor {
                node_id: "SUB-001".into(),
                kind: NodeKind::Substation,
                nominal_voltage_kv: 138.0,
                rated_capacity_mw: 300.0,
                node_ip: "10.0.2.1".into(),
                rest_port: 8201,
                control_port: 9201,
                modbus_port: 5201,
                iec104_port: 2404,
            }],
        }
    }

    async fn coordinator_with_connected_node() -> (ControlCoordinator, CommandDispatch) {
        let registry = std::sync::Arc::new(NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default()));
        registry.on_connected("SUB-001").await;
        let dispatch = CommandDispatch::default();
        let alarms = std::sync::Arc::new(AlarmEngine::new(FanOutBus::new(), HistorianHandle::noop()));
        let coordinator = ControlCoordinator::new(registry, alarms, dispatch.clone(), FanOutBus::new(), HistorianHandle::noop());
        (coordinator, dispatch)
    }

    #[tokio::test]
    async fn second_select_for_same_breaker_is_a_conflict() {
        let (coordinator, _dispatch) = coordinator_with_connected_node().await;
        coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op1", "maintenance").await.unwrap();
        let err = coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op2", "maintenance").await.unwrap_err();
        assert!(matches!(err, GridError::Conflict(_)));
    }

    #[tokio::test]
    async fn operate_happy_path_reports_success() {
        let (coordinator, dispatch) = coordinator_with_connected_node().await;
        let outcome = coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op1", "maintenance").await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        dispatch.register("SUB-001".to_string(), tx).await;
        tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            pending
                .reply_tx
                .send(ReplyOutcome::SboOperated {
                    result: OperateResult::Success,
                    new_breaker_state: BreakerState::Open,
                    response_time_ms: 12,
                })
                .unwrap();
        });

        let result = coordinator.operate(outcome.session_id, "op1").await.unwrap();
        assert!(matches!(result.result, OperateResult::Success));
        assert_eq!(result.new_breaker_state, BreakerState::Open);
    }

    #[tokio::test]
    async fn operate_by_wrong_operator_is_denied() {
        let (coordinator, _dispatch) = coordinator_with_connected_node().await;
        let outcome = coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op1", "maintenance").await.unwrap();
        let err = coordinator.operate(outcome.session_id, "someone-else").await.unwrap_err();
        assert!(matches!(err, GridError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn select_against_offline_node_is_unavailable() {
        let registry = std::sync::Arc::new(NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default()));
        let alarms = std::sync::Arc::new(AlarmEngine::new(FanOutBus::new(), HistorianHandle::noop()));
        let coordinator = ControlCoordinator::new(registry, alarms, CommandDispatch::default(), FanOutBus::new(), HistorianHandle::noop());
        let err = coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op1", "maintenance").await.unwrap_err();
        assert!(matches!(err, GridError::Unavailable(_)));
    }

    #[tokio::test]
    async fn operate_timeout_raises_a_control_failure_alarm() {
        let registry = std::sync::Arc::new(NodeRegistry::from_catalogue(&catalogue(), 16, HeartbeatConfig::default()));
        registry.on_connected("SUB-001").await;
        let dispatch = CommandDispatch::default();
        let alarms = std::sync::Arc::new(AlarmEngine::new(FanOutBus::new(), HistorianHandle::noop()));
        let coordinator = ControlCoordinator::new(registry, std::sync::Arc::clone(&alarms), dispatch, FanOutBus::new(), HistorianHandle::noop());

        let outcome = coordinator.select("SUB-001", "BRK-01", BreakerAction::Open, "op1", "maintenance").await.unwrap();
        // no dispatch sender registered, so the RPC times out and the operate fails
        let result = coordinator.operate(outcome.session_id, "op1").await.unwrap();
        assert!(matches!(result.result, OperateResult::Failure));
        let active = alarms.active_alarms().await;
        assert!(active.iter().any(|a| a.code == crate::model::alarm::AlarmCode::ControlFailure));
    }
}
