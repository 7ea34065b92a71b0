use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::correlation::{current_request_id, RequestId};

/// Error body returned to callers of the document API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Stable machine-readable code (e.g. "amount_exceeds_balance")
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Correlation reference for support and log lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error was produced
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid transition for {entity}: cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Payment of {amount} exceeds remaining balance {remaining} on invoice {invoice_id}")]
    AmountExceedsBalance {
        invoice_id: Uuid,
        amount: Decimal,
        remaining: Decimal,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error while {action}: {source}")]
    DatabaseError {
        action: String,
        #[source]
        source: DbErr,
    },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<DbErr> for ServiceError {
    fn from(source: DbErr) -> Self {
        ServiceError::DatabaseError {
            action: "executing a database operation".to_string(),
            source,
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a store error with the action that was being attempted.
    pub fn database(action: impl Into<String>, source: DbErr) -> Self {
        ServiceError::DatabaseError {
            action: action.into(),
            source,
        }
    }

    pub fn not_found(entity: &str, id: Uuid) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::AmountExceedsBalance { .. } => "amount_exceeds_balance",
            Self::ValidationError(_) => "validation_error",
            Self::DatabaseError { .. } => "database_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::InvalidState(_) | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::AmountExceedsBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::DatabaseError { .. } | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for store and internal failures whose details must not reach callers.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::DatabaseError { .. } | Self::InternalError(_))
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError { .. } | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal failures always carry a reference so the log line can be found.
        let request_id = current_request_id()
            .or_else(|| self.is_internal().then(RequestId::default))
            .map(|rid| rid.as_str().to_string());
        if self.is_internal() {
            error!(request_id = ?request_id, error = %self, "request failed with internal error");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

// Result extensions for attaching operation context to store failures
pub trait ResultExt<T> {
    fn during<F, S>(self, action: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T, DbErr> {
    fn during<F, S>(self, action: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| {
            let action = action().into();
            error!(action = %action, error = %e, "database operation failed");
            ServiceError::database(action, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn service_error_response_includes_request_id() {
        let response = crate::correlation::scope_request_id(RequestId::new("req-123"), async {
            ServiceError::NotFound("missing".into()).into_response()
        })
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.request_id.as_deref(), Some("req-123"));
        assert_eq!(payload.code, "not_found");
    }

    #[tokio::test]
    async fn internal_error_gets_generated_correlation_reference() {
        let response =
            ServiceError::database("inserting invoice", DbErr::Custom("secret dsn".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.message, "Internal server error");
        assert_eq!(payload.code, "database_error");
        assert!(payload.request_id.is_some());
        assert!(!payload.message.contains("secret"));
    }

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::InvalidState("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::InvalidTransition {
                entity: "order",
                from: "completed".into(),
                to: "processing".into(),
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::AmountExceedsBalance {
                invoice_id: Uuid::new_v4(),
                amount: dec!(50),
                remaining: dec!(40),
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::InternalError("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::NotFound("x".into()).code(), "not_found");
        assert_eq!(ServiceError::InvalidState("x".into()).code(), "invalid_state");
        assert_eq!(
            ServiceError::ValidationError("x".into()).code(),
            "validation_error"
        );
        assert_eq!(
            ServiceError::from(DbErr::Custom("boom".into())).code(),
            "database_error"
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::InternalError("sensitive".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Order 1 not found".into()).response_message(),
            "Not found: Order 1 not found"
        );
    }

    #[test]
    fn during_attaches_action_context() {
        let result: Result<(), DbErr> = Err(DbErr::Custom("connection reset".into()));
        let err = result.during(|| "updating invoice 42").unwrap_err();
        match err {
            ServiceError::DatabaseError { action, .. } => assert_eq!(action, "updating invoice 42"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
