//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sitebill_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication
    #[error("Authentication required")]
    Unauthorized,

    // Validation
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resources
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Internal
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    /// The gateway could not confirm a notification right now; the caller
    /// should redeliver
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            // The gateway echoed INVALID or the signature failed: reject
            BillingError::SignatureInvalid => ApiError::Unauthorized,
            // Verification itself was unreachable: ask for redelivery
            BillingError::VerificationUnavailable(msg) => {
                tracing::warn!(error = %msg, "Notification verification unavailable");
                ApiError::ServiceUnavailable
            }
            BillingError::MalformedPayload(msg) => ApiError::BadRequest(msg),
            BillingError::UnknownGateway(g) => {
                ApiError::BadRequest(format!("unknown gateway: {g}"))
            }
            BillingError::InvalidLevel(level) => {
                ApiError::BadRequest(format!("unknown plan level: {level}"))
            }
            BillingError::InvalidAmount(msg) => ApiError::BadRequest(msg),
            BillingError::TenantNotFound(_) | BillingError::IntentNotFound(_) => {
                ApiError::NotFound
            }
            BillingError::Gateway(e) if e.retryable => {
                tracing::warn!(error = %e, "Gateway temporarily unavailable");
                ApiError::ServiceUnavailable
            }
            BillingError::Gateway(e) => ApiError::BadRequest(e.message),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_signature_failures_are_unauthorized() {
        assert_eq!(
            status_of(BillingError::SignatureInvalid.into()),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_verification_unavailable_requests_redelivery() {
        let err: ApiError =
            BillingError::VerificationUnavailable("timeout".to_string()).into();
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_malformed_payload_is_bad_request() {
        let err: ApiError = BillingError::MalformedPayload("missing field".to_string()).into();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }
}
