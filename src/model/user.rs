//! Users, roles, and the permission matrix (spec.md §3, §4.7).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Engineer,
    Admin,
}

/// Fine-grained permissions checked by `authorise()` (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ReadGrid,
    ReadNodes,
    ReadAlarms,
    ReadHistorian,
    AcknowledgeAlarm,
    ControlBreaker,
    IsolateNode,
    ViewSecurityConsole,
    ManageUsers,
    BlockIp,
    ViewAuditLog,
}

impl Role {
    /// Fixed role -> permission-set mapping (spec.md §4.7 table). Each role
    /// includes everything the roles below it carry.
    pub fn permissions(self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Viewer => &[ReadGrid, ReadNodes, ReadAlarms, ReadHistorian],
            Role::Operator => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
            ],
            Role::Engineer => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
                IsolateNode,
                ViewSecurityConsole,
            ],
            Role::Admin => &[
                ReadGrid,
                ReadNodes,
                ReadAlarms,
                ReadHistorian,
                AcknowledgeAlarm,
                ControlBreaker,
                IsolateNode,
                ViewSecurityConsole,
                ManageUsers,
                BlockIp,
                ViewAuditLog,
            ],
        }
    }

    pub fn has(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// A registered operator/user account. Passwords are never stored in
/// plaintext; only the argon2 hash is persisted (spec.md §9 open question).
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub role: Role,
    pub password_hash: String,
    /// Timestamps of recent failed logins, oldest first. Pruned to the
    /// rolling lockout window on every login attempt (spec.md §4.7: "5
    /// failures in a rolling 15 minute window").
    pub failed_attempts: VecDeque<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

/// Immutable append-only audit entry (spec.md §3, §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub log_id: uuid::Uuid,
    pub operator: String,
    pub action: String,
    pub resource: String,
    pub result: AuditResult,
    pub ip: Option<std::net::IpAddr>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        operator: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        result: AuditResult,
        ip: Option<std::net::IpAddr>,
    ) -> Self {
        Self {
            log_id: uuid::Uuid::new_v4(),
            operator: operator.into(),
            action: action.into(),
            resource: resource.into(),
            result,
            ip,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewer_cannot_control_breakers() {
        assert!(!Role::Viewer.has(Permission::ControlBreaker));
    }

    #[test]
    fn operator_inherits_viewer_permissions() {
        assert!(Role::Operator.has(Permission::ReadGrid));
        assert!(Role::Operator.has(Permission::AcknowledgeAlarm));
        assert!(!Role::Operator.has(Permission::IsolateNode));
    }

    #[test]
    fn admin_has_every_permission() {
        for permission in [
            Permission::ReadGrid,
            Permission::ControlBreaker,
            Permission::IsolateNode,
            Permission::ManageUsers,
            Permission::BlockIp,
            Permission::ViewAuditLog,
        ] {
            assert!(Role::Admin.has(permission));
        }
    }

    #[test]
    fn engineer_has_security_console_but_not_user_management() {
        assert!(Role::Engineer.has(Permission::ViewSecurityConsole));
        assert!(!Role::Engineer.has(Permission::ManageUsers));
    }
}
