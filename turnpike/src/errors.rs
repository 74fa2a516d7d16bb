//! Error types and HTTP response conversion.
//!
//! The gateway speaks the OpenAI-compatible error envelope on every failure:
//!
//! ```json
//! {"error": {"type": "rate_limit_error", "code": "rate_limit_error", "message": "..."}}
//! ```
//!
//! [`Error`] covers the full taxonomy surfaced to clients:
//!
//! - `Unauthorized` (401) - bad credential, revoked key, suspended tenant
//! - `ModelNotFound` (404) - alias disabled or not visible to the tenant
//! - `InvalidRequest` (400) - malformed body, file/batch validation
//! - `GuardrailBlocked` / `Permission` (403) - policy denials
//! - `RateLimited` (429) - any limiter rejection
//! - `BudgetExceeded` (402) - budget pre-check denial
//! - `ServiceUnavailable` (503) - no healthy route
//! - `Provider` (502) - upstream attempts exhausted
//! - `Database` / `Internal` / `Other` (500) - everything else
//!
//! Handlers return `Result<T, Error>`; `IntoResponse` renders the envelope and
//! logs at a severity matched to the class.

use crate::db::errors::DbError;
use axum::{
    http::StatusCode,
    http::header::RETRY_AFTER,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

/// Retry-After header value (in seconds) for rate-limit rejections.
const RATE_LIMITED_RETRY_AFTER_SECS: &str = "60";

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication failed: bad credential, revoked key, or suspended tenant
    #[error("{message}")]
    Unauthorized { message: String },

    /// Alias is unknown, disabled, or not visible to the tenant
    #[error("The model `{alias}` does not exist or you do not have access to it")]
    ModelNotFound { alias: String },

    /// Malformed or unprocessable request data
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Operation outside the selected route's capability set
    #[error("The operation `{operation}` is not supported by this model")]
    OperationUnsupported { operation: String },

    /// A guardrail policy blocked the content
    #[error("Request blocked by guardrail policy")]
    GuardrailBlocked { stage: GuardrailStage, violations: Vec<String> },

    /// Non-guardrail authorization denial
    #[error("{message}")]
    Permission { message: String },

    /// A rate limiter rejected the request
    #[error("{message}")]
    RateLimited { message: String },

    /// Tenant spend reached its budget window limit
    #[error("Budget exceeded: {used_cents} of {limit_cents} cents used in the current window")]
    BudgetExceeded { used_cents: i64, limit_cents: i64 },

    /// No healthy route is available for the alias
    #[error("{message}")]
    ServiceUnavailable { message: String },

    /// All upstream attempts failed
    #[error("{message}")]
    Provider { status: Option<u16>, message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which side of the request a guardrail verdict applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailStage {
    Prompt,
    Response,
}

impl GuardrailStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailStage::Prompt => "prompt",
            GuardrailStage::Response => "response",
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidRequest { .. } | Error::OperationUnsupported { .. } => StatusCode::BAD_REQUEST,
            Error::GuardrailBlocked { .. } | Error::Permission { .. } => StatusCode::FORBIDDEN,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Provider { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error class in the OpenAI envelope's `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Unauthorized { .. } => "unauthorized",
            Error::ModelNotFound { .. } => "model_not_found",
            Error::InvalidRequest { .. } | Error::OperationUnsupported { .. } => "invalid_request_error",
            Error::GuardrailBlocked { .. } | Error::Permission { .. } => "permission_error",
            Error::RateLimited { .. } => "rate_limit_error",
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::ServiceUnavailable { .. } => "service_unavailable",
            Error::Provider { .. } => "provider_error",
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "invalid_request_error",
                DbError::UniqueViolation { .. }
                | DbError::ForeignKeyViolation { .. }
                | DbError::CheckViolation { .. } => "invalid_request_error",
                DbError::PoolExhausted => "service_unavailable",
                DbError::Other(_) => "internal_error",
            },
            Error::Internal { .. } | Error::Other(_) => "internal_error",
        }
    }

    /// More specific machine-readable code, where one exists.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::GuardrailBlocked { .. } => "guardrail_blocked",
            Error::OperationUnsupported { operation } if operation.starts_with("image") => {
                "image_operation_unsupported"
            }
            Error::OperationUnsupported { .. } => "operation_unsupported",
            other => other.error_type(),
        }
    }

    /// Returns a user-safe message, without leaking internal details.
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::PoolExhausted => "Service temporarily overloaded, please retry".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            other => other.to_string(),
        }
    }

    /// The envelope body, also reused for mid-stream SSE error frames and
    /// per-item batch error payloads.
    pub fn envelope(&self) -> serde_json::Value {
        let mut error = json!({
            "type": self.error_type(),
            "code": self.error_code(),
            "message": self.user_message(),
        });
        if let Error::GuardrailBlocked { violations, .. } = self {
            error["violations"] = json!(violations);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full details before the envelope strips them - severity by class
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(DbError::PoolExhausted) => {
                tracing::warn!("Database connection pool exhausted - service overloaded");
            }
            Error::Provider { .. } | Error::ServiceUnavailable { .. } => {
                tracing::warn!("Upstream failure: {}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::Unauthorized { .. } | Error::Permission { .. } | Error::GuardrailBlocked { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::RateLimited { .. } | Error::BudgetExceeded { .. } => {
                tracing::info!("Admission denied: {}", self);
            }
            Error::InvalidRequest { .. } | Error::ModelNotFound { .. } | Error::OperationUnsupported { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let body = axum::response::Json(self.envelope());

        match &self {
            Error::RateLimited { .. } => {
                (status, [(RETRY_AFTER, RATE_LIMITED_RETRY_AFTER_SECS)], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        let cases = [
            (
                Error::Unauthorized {
                    message: "bad key".into(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (Error::ModelNotFound { alias: "gpt-x".into() }, StatusCode::NOT_FOUND),
            (
                Error::InvalidRequest { message: "bad".into() },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::RateLimited { message: "slow down".into() },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::BudgetExceeded {
                    used_cents: 100,
                    limit_cents: 100,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                Error::ServiceUnavailable {
                    message: "no healthy routes".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Provider {
                    status: Some(500),
                    message: "upstream".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }

    #[test]
    fn test_envelope_shape() {
        let err = Error::RateLimited {
            message: "requests per minute exceeded".into(),
        };
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
        assert_eq!(envelope["error"]["code"], "rate_limit_error");
        assert_eq!(envelope["error"]["message"], "requests per minute exceeded");
    }

    #[test]
    fn test_guardrail_envelope_carries_violations() {
        let err = Error::GuardrailBlocked {
            stage: GuardrailStage::Prompt,
            violations: vec!["topsecret".into()],
        };
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["type"], "permission_error");
        assert_eq!(envelope["error"]["code"], "guardrail_blocked");
        assert_eq!(envelope["error"]["violations"][0], "topsecret");
    }

    #[test]
    fn test_unsupported_image_operation_sentinel() {
        let err = Error::OperationUnsupported {
            operation: "image_edit".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid_request_error");
        assert_eq!(err.error_code(), "image_operation_unsupported");

        let err = Error::OperationUnsupported {
            operation: "audio_speech".into(),
        };
        assert_eq!(err.error_code(), "operation_unsupported");
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = Error::Internal {
            operation: "connect to postgres at 10.0.0.3".into(),
        };
        assert_eq!(err.user_message(), "Internal server error");
    }
}
