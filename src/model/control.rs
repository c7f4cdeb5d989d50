//! Select-Before-Operate session state (spec.md §3, §4.5).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default arming window (spec.md §4.5).
pub const ARMING_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SboState {
    Armed,
    Operated,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperateResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct SboSession {
    pub session_id: Uuid,
    pub operator: String,
    pub node_id: String,
    pub breaker_id: String,
    pub action: BreakerAction,
    pub state: SboState,
    pub armed_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub result: Option<OperateResult>,
}

impl SboSession {
    pub fn arm(operator: String, node_id: String, breaker_id: String, action: BreakerAction) -> Self {
        let armed_at = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            operator,
            node_id,
            breaker_id,
            action,
            state: SboState::Armed,
            armed_at,
            deadline: armed_at + Duration::seconds(ARMING_WINDOW_SECS),
            result: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn time_remaining_s(&self, now: DateTime<Utc>) -> f64 {
        (self.deadline - now).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Terminal transition out of `Armed`. No-op if already terminal.
    fn transition(&mut self, state: SboState) -> bool {
        if self.state != SboState::Armed {
            return false;
        }
        self.state = state;
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(SboState::Cancelled)
    }

    pub fn expire(&mut self) -> bool {
        self.transition(SboState::Expired)
    }

    pub fn operate(&mut self, result: OperateResult) -> bool {
        if self.transition(SboState::Operated) {
            self.result = Some(result);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> SboSession {
        SboSession::arm("op1".into(), "SUB-001".into(), "BRK-01".into(), BreakerAction::Open)
    }

    #[test]
    fn operate_just_inside_deadline_succeeds() {
        let session = fresh();
        let almost_expired = session.deadline - Duration::milliseconds(1);
        assert!(!session.is_expired_at(almost_expired));
    }

    #[test]
    fn operate_just_past_deadline_is_expired() {
        let session = fresh();
        let past = session.deadline + Duration::milliseconds(1);
        assert!(session.is_expired_at(past));
    }

    #[test]
    fn terminal_transitions_are_one_shot() {
        let mut session = fresh();
        assert!(session.operate(OperateResult::Success));
        assert!(!session.cancel());
        assert!(!session.expire());
        assert!(!session.operate(OperateResult::Success));
    }

    #[test]
    fn cancel_is_noop_after_expire() {
        let mut session = fresh();
        assert!(session.expire());
        assert!(!session.cancel());
        assert_eq!(session.state, SboState::Expired);
    }
}
