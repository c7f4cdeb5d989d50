//! Error taxonomy for the Master and RTU (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Distinct error kinds, not types, per spec.md §7. `kind()` gives the
/// stable string the error envelope (`{"error":{"kind": ...}}`) uses.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GridResult<T> = Result<T, GridError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    AuthFailure,
    PermissionDenied,
    Validation,
    Conflict,
    Unavailable,
    Timeout,
    Internal,
}

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::AuthFailure(_) => ErrorKind::AuthFailure,
            GridError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            GridError::Validation(_) => ErrorKind::Validation,
            GridError::Conflict(_) => ErrorKind::Conflict,
            GridError::Unavailable(_) => ErrorKind::Unavailable,
            GridError::Timeout(_) => ErrorKind::Timeout,
            GridError::Database(_) | GridError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GridError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
            GridError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GridError::Validation(_) => StatusCode::BAD_REQUEST,
            GridError::Conflict(_) => StatusCode::CONFLICT,
            GridError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GridError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GridError::Database(_) | GridError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GridError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, GridError::Internal(_) | GridError::Database(_)) {
            tracing::error!(error = %self, "internal error surfaced to caller");
        }
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "details": {}
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_conflict_stay_distinct() {
        assert_eq!(GridError::Timeout("rtu".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            GridError::Conflict("session expired".into()).kind(),
            ErrorKind::Conflict
        );
    }
}
