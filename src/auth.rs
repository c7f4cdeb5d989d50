//! Token issuance, password verification, and the permission gate
//! (spec.md §4.7).

use std::collections::HashMap;
use std::net::IpAddr;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::bus::{BusMessage, FanOutBus};
use crate::errors::{GridError, GridResult};
use crate::historian::{HistorianHandle, HistorianRow};
use crate::model::security::{EventSeverity, SecurityEvent, SecurityEventType};
use crate::model::user::{AuditEntry, AuditResult, Permission, Role, User};

/// Account lockout window and threshold (spec.md §4.7).
const LOCKOUT_THRESHOLD: u32 = 5;
const LOCKOUT_WINDOW: Duration = Duration::minutes(15);
const LOCKOUT_DURATION: Duration = Duration::minutes(15);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

pub struct LoginResult {
    pub access_token: String,
    pub expires_in: i64,
}

pub struct AuthGate {
    users: RwLock<HashMap<String, User>>,
    jwt_secret: String,
    token_lifetime_secs: i64,
    bus: FanOutBus,
    historian: HistorianHandle,
}

impl AuthGate {
    pub fn new(users: HashMap<String, User>, jwt_secret: String, token_lifetime_secs: i64, bus: FanOutBus, historian: HistorianHandle) -> Self {
        Self {
            users: RwLock::new(users),
            jwt_secret,
            token_lifetime_secs,
            bus,
            historian,
        }
    }

    pub fn hash_password(password: &str) -> GridResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| GridError::Internal(format!("password hashing failed: {e}")))
    }

    /// `login(username, password)` (spec.md §4.7).
    pub async fn login(&self, username: &str, password: &str, ip: Option<IpAddr>) -> GridResult<LoginResult> {
        let now = Utc::now();
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(username) else {
            self.audit(username, "auth.login", "auth", AuditResult::Failure, ip).await;
            return Err(GridError::AuthFailure("unknown user".to_string()));
        };

        if let Some(locked_until) = user.locked_until {
            if now < locked_until {
                self.audit(username, "auth.login", "auth", AuditResult::Failure, ip).await;
                return Err(GridError::AuthFailure("account locked".to_string()));
            }
            user.locked_until = None;
            user.failed_attempts.clear();
        }

        let window_start = now - LOCKOUT_WINDOW;
        while user.failed_attempts.front().map(|t| *t < window_start).unwrap_or(false) {
            user.failed_attempts.pop_front();
        }

        let valid = PasswordHash::new(&user.password_hash)
            .ok()
            .map(|hash| Argon2::default().verify_password(password.as_bytes(), &hash).is_ok())
            .unwrap_or(false);

        if !valid {
            user.failed_attempts.push_back(now);
            if user.failed_attempts.len() as u32 >= LOCKOUT_THRESHOLD {
                user.locked_until = Some(now + LOCKOUT_DURATION);
                warn!(username, "account locked after repeated failed logins within the window");
            }
            self.audit(username, "auth.login", "auth", AuditResult::Failure, ip).await;
            return Err(GridError::AuthFailure("invalid credentials".to_string()));
        }

        user.failed_attempts.clear();
        let role = user.role;
        drop(users);

        let claims = Claims {
            sub: username.to_string(),
            role,
            iat: now.timestamp(),
            exp: now.timestamp() + self.token_lifetime_secs,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(self.jwt_secret.as_bytes()))
            .map_err(|e| GridError::Internal(format!("token signing failed: {e}")))?;

        self.audit(username, "auth.login", "auth", AuditResult::Success, ip).await;
        Ok(LoginResult { access_token: token, expires_in: self.token_lifetime_secs })
    }

    /// Verifies a bearer token's signature and expiry window, returning
    /// its claims.
    pub fn verify_token(&self, token: &str) -> GridResult<Claims> {
        decode::<Claims>(token, &DecodingKey::from_secret(self.jwt_secret.as_bytes()), &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| GridError::AuthFailure("invalid or expired token".to_string()))
    }

    /// Wraps every mutating call: checks `token` carries `permission`,
    /// emits an audit entry regardless of outcome (spec.md §4.7).
    pub async fn authorise(&self, token: &str, permission: Permission, action: &str, resource: &str) -> GridResult<Claims> {
        let claims = match self.verify_token(token) {
            Ok(claims) => claims,
            Err(err) => {
                self.audit("unknown", action, resource, AuditResult::Denied, None).await;
                return Err(err);
            }
        };

        if !claims.role.has(permission) {
            self.audit(&claims.sub, action, resource, AuditResult::Denied, None).await;
            let event = SecurityEvent::new(
                SecurityEventType::PermissionDenied,
                EventSeverity::Warning,
                None,
                None,
                format!("{} denied {action} on {resource}", claims.sub),
            );
            self.historian.send(HistorianRow::Security(event.clone()));
            self.bus.publish(BusMessage::SecurityEvent { event });
            return Err(GridError::PermissionDenied(format!("missing permission for {action}")));
        }

        self.audit(&claims.sub, action, resource, AuditResult::Success, None).await;
        Ok(claims)
    }

    async fn audit(&self, operator: &str, action: &str, resource: &str, result: AuditResult, ip: Option<IpAddr>) {
        self.historian.send(HistorianRow::Audit(AuditEntry::new(operator, action, resource, result, ip)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, password: &str) -> User {
        User {
            username: "operator".into(),
            role,
            password_hash: AuthGate::hash_password(password).unwrap(),
            failed_attempts: std::collections::VecDeque::new(),
            locked_until: None,
        }
    }

    fn gate(role: Role) -> AuthGate {
        let mut users = HashMap::new();
        users.insert("operator".to_string(), user(role, "correct horse"));
        AuthGate::new(users, "test-secret".into(), 3600, FanOutBus::new(), HistorianHandle::noop())
    }

    #[tokio::test]
    async fn correct_password_issues_a_token() {
        let gate = gate(Role::Operator);
        let result = gate.login("operator", "correct horse", None).await.unwrap();
        assert!(!result.access_token.is_empty());
    }

    #[tokio::test]
    async fn wrong_password_is_auth_failure() {
        let gate = gate(Role::Operator);
        let err = gate.login("operator", "wrong", None).await.unwrap_err();
        assert!(matches!(err, GridError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn five_failed_attempts_locks_the_account() {
        let gate = gate(Role::Operator);
        for _ in 0..5 {
            let _ = gate.login("operator", "wrong", None).await;
        }
        let err = gate.login("operator", "correct horse", None).await.unwrap_err();
        assert!(matches!(err, GridError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn failed_attempts_outside_the_window_do_not_count_toward_lockout() {
        let gate = gate(Role::Operator);
        {
            let mut users = gate.users.write().await;
            let user = users.get_mut("operator").unwrap();
            let stale = Utc::now() - Duration::minutes(20);
            for _ in 0..4 {
                user.failed_attempts.push_back(stale);
            }
        }
        // one more failure, inside the window: only 1 of the 5 recorded
        // attempts is still within LOCKOUT_WINDOW, so the account must not lock
        let _ = gate.login("operator", "wrong", None).await;
        let result = gate.login("operator", "correct horse", None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn viewer_token_is_rejected_for_control_breaker() {
        let gate = gate(Role::Viewer);
        let login = gate.login("operator", "correct horse", None).await.unwrap();
        let err = gate
            .authorise(&login.access_token, Permission::ControlBreaker, "sbo.select", "SUB-001/BRK-01")
            .await
            .unwrap_err();
        assert!(matches!(err, GridError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn operator_token_is_accepted_for_control_breaker() {
        let gate = gate(Role::Operator);
        let login = gate.login("operator", "correct horse", None).await.unwrap();
        let claims = gate
            .authorise(&login.access_token, Permission::ControlBreaker, "sbo.select", "SUB-001/BRK-01")
            .await
            .unwrap();
        assert_eq!(claims.sub, "operator");
    }
}
