use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            return Self::ConcurrencyConflict {
                expected_tail: None,
                attempts: 1,
            };
        }
        Self::Storage(format!("Database error: {}", err))
    }
}

/// SQLite reports lock contention as SQLITE_BUSY (5) or one of its extended codes.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("5") | Some("261") | Some("517")
        ),
        _ => false,
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Concurrent append conflict (expected tail {expected_tail:?}, {attempts} attempts)")]
    ConcurrencyConflict {
        expected_tail: Option<i64>,
        attempts: u32,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn invalid_id(id: i64) -> Self {
        Self::Validation(format!("Invalid audit log ID: {}. IDs start at 1", id))
    }

    pub fn invalid_range(start: i64, end: i64) -> Self {
        Self::Validation(format!(
            "Invalid ID range: start {} is after end {}",
            start, end
        ))
    }

    pub fn entry_not_found(id: i64) -> Self {
        Self::NotFound(format!("Audit log entry {} not found", id))
    }

    pub fn partition_not_found(key: i32) -> Self {
        Self::NotFound(format!("Archive partition {} not found", key))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuditError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AuditError::invalid_id(0).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AuditError::entry_not_found(9).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AuditError::Storage("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AuditError::ConcurrencyConflict { expected_tail: Some(3), attempts: 5 }.status_code(),
            StatusCode::CONFLICT
        );
    }
}
